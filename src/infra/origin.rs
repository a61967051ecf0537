//! `object_store`-backed origin.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::{
    GetOptions, ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, path::Path,
};
use tracing::info;

use crate::{
    application::origin::{OriginError, OriginFetcher, OriginObject},
    config::{OriginSettings, S3Settings},
};

use super::error::InfraError;

const SOURCE: &str = "imagecache::infra::origin";

pub struct ObjectStoreOrigin {
    inner: Arc<dyn ObjectStore>,
}

impl ObjectStoreOrigin {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    pub fn from_settings(settings: &OriginSettings) -> Result<Self, InfraError> {
        let inner: Arc<dyn ObjectStore> = match settings {
            OriginSettings::S3(s3) => Arc::new(build_s3(s3)?),
            OriginSettings::Local { directory } => {
                let store = LocalFileSystem::new_with_prefix(directory).map_err(|err| {
                    InfraError::origin(format!(
                        "failed to open local origin at `{}`: {err}",
                        directory.display()
                    ))
                })?;
                info!(
                    target = SOURCE,
                    directory = %directory.display(),
                    "using local filesystem origin"
                );
                Arc::new(store)
            }
        };

        Ok(Self::new(inner))
    }
}

fn build_s3(settings: &S3Settings) -> Result<impl ObjectStore, InfraError> {
    // Credentials not set explicitly fall back to the standard AWS_* variables.
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(&settings.bucket)
        .with_region(&settings.region)
        .with_virtual_hosted_style_request(!settings.force_path_style)
        .with_allow_http(settings.allow_http);

    if let Some(endpoint) = settings.endpoint.as_ref() {
        builder = builder.with_endpoint(endpoint);
    }
    if let Some(access_key_id) = settings.access_key_id.as_ref() {
        builder = builder.with_access_key_id(access_key_id);
    }
    if let Some(secret) = settings.secret_access_key.as_ref() {
        builder = builder.with_secret_access_key(secret.expose());
    }

    let store = builder
        .build()
        .map_err(|err| InfraError::origin(format!("failed to create S3 client: {err}")))?;

    info!(
        target = SOURCE,
        bucket = %settings.bucket,
        region = %settings.region,
        endpoint = settings.endpoint.as_deref().unwrap_or("default"),
        force_path_style = settings.force_path_style,
        "using S3 origin"
    );
    Ok(store)
}

#[async_trait]
impl OriginFetcher for ObjectStoreOrigin {
    async fn fetch(&self, key: &str) -> Result<OriginObject, OriginError> {
        // Keys that cannot name an object (empty segments, `..`) are absent by definition.
        let path = Path::parse(key).map_err(|_| OriginError::not_found(key))?;
        if path.as_ref().is_empty() {
            return Err(OriginError::not_found(key));
        }

        let result = self
            .inner
            .get_opts(&path, GetOptions::default())
            .await
            .map_err(|err| match err {
                object_store::Error::NotFound { .. } => OriginError::not_found(key),
                other => OriginError::backend(key, other),
            })?;

        let size = result.meta.size;
        let owned_key = key.to_string();
        let body = result
            .into_stream()
            .map_err(move |err| OriginError::backend(owned_key.clone(), err))
            .boxed();

        Ok(OriginObject::new(Some(size), body))
    }
}
