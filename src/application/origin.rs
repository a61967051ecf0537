//! Origin port: read access to the upstream object store.

use std::error::Error as StdError;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{TryStreamExt, stream::BoxStream};
use thiserror::Error;

pub type OriginStream = BoxStream<'static, Result<Bytes, OriginError>>;

#[derive(Debug, Error)]
pub enum OriginError {
    #[error("origin object `{key}` not found")]
    NotFound { key: String },
    #[error("origin request for `{key}` failed")]
    Backend {
        key: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl OriginError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn backend(
        key: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self::Backend {
            key: key.into(),
            source: source.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OriginError::NotFound { .. })
    }
}

/// An object as returned by the origin: an optional size hint and a body
/// that is read lazily.
pub struct OriginObject {
    pub size: Option<u64>,
    pub body: OriginStream,
}

impl OriginObject {
    pub fn new(size: Option<u64>, body: OriginStream) -> Self {
        Self { size, body }
    }

    /// Drain the body into a single buffer.
    pub async fn bytes(self) -> Result<Bytes, OriginError> {
        let capacity = self
            .size
            .and_then(|size| usize::try_from(size).ok())
            .unwrap_or_default();
        let buffer = self
            .body
            .try_fold(BytesMut::with_capacity(capacity), |mut buffer, chunk| async move {
                buffer.extend_from_slice(&chunk);
                Ok(buffer)
            })
            .await?;
        Ok(buffer.freeze())
    }
}

impl std::fmt::Debug for OriginObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginObject")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait OriginFetcher: Send + Sync {
    /// Open the object stored under `key`.
    ///
    /// A missing object must be reported as [`OriginError::NotFound`];
    /// everything else is a backend failure.
    async fn fetch(&self, key: &str) -> Result<OriginObject, OriginError>;
}
