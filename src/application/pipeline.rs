//! Cache-aside request pipeline for the `/file` and `/image` routes.
//!
//! Both variants consult the [`DiskCacheStore`] first and fall back to the
//! origin on a miss. They differ in when the cache is populated:
//!
//! - files are streamed to the client while the same chunks are teed into
//!   the cache in the background;
//! - image variants are transformed in full and written to the cache before
//!   the response is produced, so the response can carry the new etag.
//!
//! Origin reads and transforms run on spawned tasks and are not cancelled
//! when the requesting client goes away.

use std::{io, sync::Arc, time::Instant};

use async_stream::stream;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream::BoxStream};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::{
    fs,
    io::AsyncReadExt,
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

use crate::{
    application::{
        origin::{OriginError, OriginFetcher, OriginObject, OriginStream},
        transform::{ImageTransformer, TransformError, TransformRequest},
    },
    cache::{CacheKey, CacheLookup, CachePayload, DiskCacheStore, InFlight},
    domain::{
        error::DomainError,
        options::{FileOptions, ImageOptions, RawOptions},
        signature,
    },
};

const SOURCE: &str = "imagecache::application::pipeline";

pub(crate) const METRIC_ORIGIN_FETCH: &str = "imagecache_origin_fetch_total";
pub(crate) const METRIC_ORIGIN_NOT_FOUND: &str = "imagecache_origin_not_found_total";
pub(crate) const METRIC_ORIGIN_ERROR: &str = "imagecache_origin_error_total";
pub(crate) const METRIC_TRANSFORM_MS: &str = "imagecache_transform_ms";

/// Chunks buffered between the origin pump and a slow client.
const CLIENT_BUFFER: usize = 16;
const FILE_CHUNK: usize = 64 * 1024;

pub type BodyStream = BoxStream<'static, Result<Bytes, io::Error>>;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("origin object `{0}` not found")]
    OriginNotFound(String),
    #[error("origin fetch failed")]
    Origin(#[source] Arc<OriginError>),
    #[error("image transform failed")]
    Transform(#[source] Arc<TransformError>),
    #[error("pipeline task failed: {0}")]
    Task(String),
}

/// Outcome of a successfully handled request.
#[derive(Debug)]
pub enum PipelineResponse {
    /// The client's `If-None-Match` matches the cached entry.
    NotModified { etag: String },
    Ok(ServedObject),
}

#[derive(Debug)]
pub struct ServedObject {
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub body: ServedBody,
}

pub enum ServedBody {
    /// A cache entry opened for reading.
    File { file: fs::File, len: u64 },
    /// Origin bytes relayed as they arrive.
    Stream {
        stream: BodyStream,
        len: Option<u64>,
    },
    Bytes(Bytes),
}

impl ServedBody {
    /// Body length when known up front.
    pub fn len(&self) -> Option<u64> {
        match self {
            ServedBody::File { len, .. } => Some(*len),
            ServedBody::Stream { len, .. } => *len,
            ServedBody::Bytes(bytes) => Some(bytes.len() as u64),
        }
    }

    pub fn into_stream(self) -> BodyStream {
        match self {
            ServedBody::File { file, .. } => file_stream(file),
            ServedBody::Stream { stream, .. } => stream,
            ServedBody::Bytes(bytes) => futures::stream::once(async move { Ok(bytes) }).boxed(),
        }
    }
}

impl std::fmt::Debug for ServedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServedBody::File { len, .. } => f.debug_struct("File").field("len", len).finish(),
            ServedBody::Stream { len, .. } => f.debug_struct("Stream").field("len", len).finish(),
            ServedBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
        }
    }
}

#[derive(Debug, Clone)]
struct RenderedImage {
    bytes: Bytes,
    etag: Option<String>,
}

type RenderResult = Result<RenderedImage, PipelineError>;

pub struct RequestPipeline {
    store: DiskCacheStore,
    origin: Arc<dyn OriginFetcher>,
    transformer: Arc<dyn ImageTransformer>,
    signing_key: Arc<[u8]>,
    image_flight: Option<InFlight<RenderResult>>,
}

impl RequestPipeline {
    pub fn new(
        store: DiskCacheStore,
        origin: Arc<dyn OriginFetcher>,
        transformer: Arc<dyn ImageTransformer>,
        signing_key: impl Into<Arc<[u8]>>,
        coalesce_image_misses: bool,
    ) -> Self {
        Self {
            store,
            origin,
            transformer,
            signing_key: signing_key.into(),
            image_flight: coalesce_image_misses.then(InFlight::new),
        }
    }

    pub fn store(&self) -> &DiskCacheStore {
        &self.store
    }

    /// Check the signature, then parse the option segment for `/file`.
    pub fn authorize_file(
        &self,
        token: &str,
        raw_options: &str,
        object_path: &str,
    ) -> Result<FileOptions, DomainError> {
        let raw = self.authorize(token, raw_options, object_path)?;
        Ok(FileOptions::from_raw(&raw))
    }

    /// Check the signature, then parse the option segment for `/image`.
    pub fn authorize_image(
        &self,
        token: &str,
        raw_options: &str,
        object_path: &str,
    ) -> Result<ImageOptions, DomainError> {
        let raw = self.authorize(token, raw_options, object_path)?;
        Ok(ImageOptions::from_raw(&raw)?)
    }

    fn authorize(
        &self,
        token: &str,
        raw_options: &str,
        object_path: &str,
    ) -> Result<RawOptions, DomainError> {
        signature::verify(&self.signing_key, raw_options, object_path, token)?;
        Ok(RawOptions::parse(raw_options))
    }

    pub async fn serve_file(
        &self,
        object_path: &str,
        options: &FileOptions,
        client_etag: &str,
    ) -> Result<PipelineResponse, PipelineError> {
        let key = CacheKey::original(object_path);

        if !options.no_cache {
            match self.store.get(&key, client_etag).await {
                CacheLookup::NotModified { etag } => {
                    return Ok(PipelineResponse::NotModified { etag });
                }
                CacheLookup::Hit { etag, file, len } => {
                    return Ok(PipelineResponse::Ok(ServedObject {
                        etag: Some(etag),
                        content_type: options.mime_type.clone(),
                        body: ServedBody::File { file, len },
                    }));
                }
                CacheLookup::Miss => {}
            }
        }

        let body = self.relay_origin(key).await?;
        Ok(PipelineResponse::Ok(ServedObject {
            etag: None,
            content_type: options.mime_type.clone(),
            body,
        }))
    }

    pub async fn serve_image(
        &self,
        object_path: &str,
        options: &ImageOptions,
        client_etag: &str,
    ) -> Result<PipelineResponse, PipelineError> {
        let key = CacheKey::new(object_path, options.labels());
        let content_type = options.format.content_type().map(str::to_string);

        match self.store.get(&key, client_etag).await {
            CacheLookup::NotModified { etag } => {
                return Ok(PipelineResponse::NotModified { etag });
            }
            CacheLookup::Hit { etag, file, len } => {
                return Ok(PipelineResponse::Ok(ServedObject {
                    etag: Some(etag),
                    content_type,
                    body: ServedBody::File { file, len },
                }));
            }
            CacheLookup::Miss => {}
        }

        let rendered = self.render(key, TransformRequest::from(options)).await?;
        Ok(PipelineResponse::Ok(ServedObject {
            etag: rendered.etag,
            content_type,
            body: ServedBody::Bytes(rendered.bytes),
        }))
    }

    /// Open the origin object on a detached task that relays it to the
    /// caller and tees it into the cache.
    async fn relay_origin(&self, key: CacheKey) -> Result<ServedBody, PipelineError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let store = self.store.clone();
        let origin = Arc::clone(&self.origin);

        tokio::spawn(async move {
            let object = match fetch_origin(origin.as_ref(), key.object_key()).await {
                Ok(object) => object,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            let OriginObject { size, body } = object;
            let (client_tx, client_rx) = mpsc::channel(CLIENT_BUFFER);
            let _ = ready_tx.send(Ok((size, client_rx)));
            tee_origin(store, key, body, client_tx).await;
        });

        let (len, mut client_rx) = ready_rx
            .await
            .map_err(|_| PipelineError::Task("origin relay ended before responding".to_string()))??;

        let stream = stream! {
            while let Some(chunk) = client_rx.recv().await {
                yield chunk;
            }
        };
        Ok(ServedBody::Stream {
            stream: stream.boxed(),
            len,
        })
    }

    async fn render(&self, key: CacheKey, request: TransformRequest) -> RenderResult {
        let work = render_image(
            self.store.clone(),
            Arc::clone(&self.origin),
            Arc::clone(&self.transformer),
            key.clone(),
            request,
        );

        match &self.image_flight {
            Some(flight) => flight
                .run(key, work)
                .await
                .map_err(|err| PipelineError::Task(err.to_string()))?,
            None => tokio::spawn(work)
                .await
                .map_err(|err| PipelineError::Task(err.to_string()))?,
        }
    }
}

async fn fetch_origin(origin: &dyn OriginFetcher, key: &str) -> Result<OriginObject, PipelineError> {
    counter!(METRIC_ORIGIN_FETCH).increment(1);
    match origin.fetch(key).await {
        Ok(object) => Ok(object),
        Err(err) if err.is_not_found() => {
            counter!(METRIC_ORIGIN_NOT_FOUND).increment(1);
            debug!(target = SOURCE, key, "origin object not found");
            Err(PipelineError::OriginNotFound(key.to_string()))
        }
        Err(err) => {
            counter!(METRIC_ORIGIN_ERROR).increment(1);
            Err(PipelineError::Origin(Arc::new(err)))
        }
    }
}

/// Drain `body`, forwarding every chunk to the client and the cache.
///
/// The cache side is unbounded so a slow disk never stalls the client. A
/// client that disconnects stops receiving but the cache copy completes.
async fn tee_origin(
    store: DiskCacheStore,
    key: CacheKey,
    mut body: OriginStream,
    client_tx: mpsc::Sender<Result<Bytes, io::Error>>,
) {
    let (cache_tx, mut cache_rx) = mpsc::unbounded_channel::<Result<Bytes, io::Error>>();
    let cache_stream = stream! {
        while let Some(chunk) = cache_rx.recv().await {
            yield chunk;
        }
    };
    let write = store.put(key.clone(), CachePayload::Stream(cache_stream.boxed()));

    let mut client = Some(client_tx);
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                let _ = cache_tx.send(Ok(bytes.clone()));
                if let Some(tx) = &client
                    && tx.send(Ok(bytes)).await.is_err()
                {
                    debug!(target = SOURCE, key = %key, "client went away; finishing cache copy");
                    client = None;
                }
            }
            Err(err) => {
                counter!(METRIC_ORIGIN_ERROR).increment(1);
                warn!(
                    target = SOURCE,
                    key = %key,
                    error = %err,
                    "origin stream failed mid-body"
                );
                let _ = cache_tx.send(Err(io::Error::other("origin stream failed")));
                if let Some(tx) = &client {
                    let _ = tx.send(Err(io::Error::other(err))).await;
                }
                break;
            }
        }
    }

    drop(cache_tx);
    let _ = write.await;
}

async fn render_image(
    store: DiskCacheStore,
    origin: Arc<dyn OriginFetcher>,
    transformer: Arc<dyn ImageTransformer>,
    key: CacheKey,
    request: TransformRequest,
) -> RenderResult {
    let object = fetch_origin(origin.as_ref(), key.object_key()).await?;
    let source = object.bytes().await.map_err(|err| {
        counter!(METRIC_ORIGIN_ERROR).increment(1);
        PipelineError::Origin(Arc::new(err))
    })?;

    let started = Instant::now();
    let bytes = transformer
        .transform(source, &request)
        .await
        .map_err(|err| PipelineError::Transform(Arc::new(err)))?;
    histogram!(METRIC_TRANSFORM_MS).record(started.elapsed().as_secs_f64() * 1000.0);

    let etag = if store
        .populate(&key, CachePayload::Bytes(bytes.clone()))
        .await
    {
        store.etag(&key).await
    } else {
        None
    };

    Ok(RenderedImage { bytes, etag })
}

fn file_stream(mut file: fs::File) -> BodyStream {
    let stream = stream! {
        loop {
            let mut buffer = BytesMut::with_capacity(FILE_CHUNK);
            match file.read_buf(&mut buffer).await {
                Ok(0) => break,
                Ok(_) => yield Ok(buffer.freeze()),
                Err(err) => {
                    yield Err(err);
                    break;
                }
            }
        }
    };
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use futures::TryStreamExt;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    use crate::domain::{
        options::{Fit, ImageFormat, Position},
        signature::{SignatureError, sign},
    };

    const KEY: &[u8] = b"test-signing-key";

    #[derive(Default)]
    struct FakeOrigin {
        objects: HashMap<String, Vec<Bytes>>,
        broken: HashMap<String, Vec<Bytes>>,
        fetches: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl FakeOrigin {
        fn with(mut self, key: &str, chunks: &[&'static [u8]]) -> Self {
            self.objects.insert(
                key.to_string(),
                chunks.iter().map(|chunk| Bytes::from_static(chunk)).collect(),
            );
            self
        }

        /// Object whose body fails after the given chunks.
        fn broken(mut self, key: &str, chunks: &[&'static [u8]]) -> Self {
            self.broken.insert(
                key.to_string(),
                chunks.iter().map(|chunk| Bytes::from_static(chunk)).collect(),
            );
            self
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OriginFetcher for FakeOrigin {
        async fn fetch(&self, key: &str) -> Result<OriginObject, OriginError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(chunks) = self.objects.get(key) {
                let size = chunks.iter().map(|chunk| chunk.len() as u64).sum();
                let items: Vec<Result<Bytes, OriginError>> =
                    chunks.iter().cloned().map(Ok).collect();
                return Ok(OriginObject::new(
                    Some(size),
                    futures::stream::iter(items).boxed(),
                ));
            }
            if let Some(chunks) = self.broken.get(key) {
                let mut items: Vec<Result<Bytes, OriginError>> =
                    chunks.iter().cloned().map(Ok).collect();
                items.push(Err(OriginError::backend(key, "connection reset")));
                return Ok(OriginObject::new(None, futures::stream::iter(items).boxed()));
            }
            Err(OriginError::not_found(key))
        }
    }

    /// Prefixes the source with the requested labels so outputs are
    /// distinguishable per variant.
    #[derive(Default)]
    struct FakeTransformer {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ImageTransformer for FakeTransformer {
        async fn transform(
            &self,
            source: Bytes,
            request: &TransformRequest,
        ) -> Result<Bytes, TransformError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TransformError::Decode("not an image".into()));
            }
            let mut out = format!(
                "{}x{}:{}:{}|",
                request.width.unwrap_or_default(),
                request.height.unwrap_or_default(),
                request.fit,
                request.format
            )
            .into_bytes();
            out.extend_from_slice(&source);
            Ok(Bytes::from(out))
        }
    }

    struct Harness {
        _dir: TempDir,
        origin: Arc<FakeOrigin>,
        transformer: Arc<FakeTransformer>,
        pipeline: Arc<RequestPipeline>,
    }

    fn harness(origin: FakeOrigin, transformer: FakeTransformer, coalesce: bool) -> Harness {
        let dir = TempDir::new().expect("tempdir");
        let store = DiskCacheStore::new(dir.path().join("cache")).expect("store");
        harness_with_store(dir, store, origin, transformer, coalesce)
    }

    fn harness_with_store(
        dir: TempDir,
        store: DiskCacheStore,
        origin: FakeOrigin,
        transformer: FakeTransformer,
        coalesce: bool,
    ) -> Harness {
        let origin = Arc::new(origin);
        let transformer = Arc::new(transformer);
        let pipeline = Arc::new(RequestPipeline::new(
            store,
            origin.clone(),
            transformer.clone(),
            KEY.to_vec(),
            coalesce,
        ));
        Harness {
            _dir: dir,
            origin,
            transformer,
            pipeline,
        }
    }

    fn ok(response: PipelineResponse) -> ServedObject {
        match response {
            PipelineResponse::Ok(object) => object,
            PipelineResponse::NotModified { etag } => panic!("unexpected 304 ({etag})"),
        }
    }

    async fn collect(body: ServedBody) -> Result<Vec<u8>, io::Error> {
        let chunks: Vec<Bytes> = body.into_stream().try_collect().await?;
        Ok(chunks.concat())
    }

    async fn wait_for_etag(store: &DiskCacheStore, key: &CacheKey) -> String {
        for _ in 0..200 {
            if let Some(etag) = store.etag(key).await {
                return etag;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cache entry for {key} never appeared");
    }

    fn image_options(width: u32, format: ImageFormat) -> ImageOptions {
        ImageOptions {
            width: Some(width),
            height: None,
            fit: Fit::Cover,
            position: Position::Center,
            format,
        }
    }

    #[test]
    fn authorize_checks_signature_before_options() {
        let h = harness(FakeOrigin::default(), FakeTransformer::default(), true);

        let unsupported = h.pipeline.authorize_image("rsa:abc", "w:abc", "a.png");
        assert_eq!(
            unsupported,
            Err(DomainError::Signature(SignatureError::UnsupportedType(
                "rsa".to_string()
            )))
        );

        let mismatch = h.pipeline.authorize_image("shm:00", "w:abc", "a.png");
        assert_eq!(mismatch, Err(DomainError::Signature(SignatureError::Mismatch)));

        let token = sign(KEY, "w:abc", "a.png");
        let invalid = h.pipeline.authorize_image(&token, "w:abc", "a.png");
        assert!(matches!(invalid, Err(DomainError::Options(_))));

        let token = sign(KEY, "nc+m:text/plain", "docs/a.txt");
        let options = h
            .pipeline
            .authorize_file(&token, "nc+m:text/plain", "docs/a.txt")
            .expect("valid file request");
        assert!(options.no_cache);
        assert_eq!(options.mime_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn file_miss_streams_origin_and_populates_cache() {
        let origin = FakeOrigin::default().with("docs/a.txt", &[b"hello ", b"world"]);
        let h = harness(origin, FakeTransformer::default(), true);
        let options = FileOptions {
            no_cache: false,
            mime_type: Some("text/plain".to_string()),
        };

        let served = ok(h
            .pipeline
            .serve_file("docs/a.txt", &options, "")
            .await
            .expect("served"));
        assert_eq!(served.etag, None);
        assert_eq!(served.content_type.as_deref(), Some("text/plain"));
        assert_eq!(served.body.len(), Some(11));
        assert_eq!(collect(served.body).await.expect("body"), b"hello world");

        let key = CacheKey::original("docs/a.txt");
        let etag = wait_for_etag(h.pipeline.store(), &key).await;

        let hit = ok(h
            .pipeline
            .serve_file("docs/a.txt", &options, "")
            .await
            .expect("hit"));
        assert_eq!(hit.etag.as_deref(), Some(etag.as_str()));
        assert!(matches!(hit.body, ServedBody::File { len: 11, .. }));
        assert_eq!(collect(hit.body).await.expect("body"), b"hello world");

        let not_modified = h
            .pipeline
            .serve_file("docs/a.txt", &options, &etag)
            .await
            .expect("conditional");
        assert!(matches!(not_modified, PipelineResponse::NotModified { etag: e } if e == etag));
        assert_eq!(h.origin.fetches(), 1);
    }

    #[tokio::test]
    async fn no_cache_skips_lookup_but_still_populates() {
        let origin = FakeOrigin::default().with("a.bin", &[b"v1"]);
        let h = harness(origin, FakeTransformer::default(), true);
        let key = CacheKey::original("a.bin");
        h.pipeline
            .store()
            .write(&key, Bytes::from_static(b"stale").into())
            .await
            .expect("seed");
        let seeded = h.pipeline.store().etag(&key).await.expect("seeded etag");

        let options = FileOptions {
            no_cache: true,
            mime_type: None,
        };
        let served = ok(h
            .pipeline
            .serve_file("a.bin", &options, &seeded)
            .await
            .expect("served"));
        assert_eq!(collect(served.body).await.expect("body"), b"v1");
        assert_eq!(h.origin.fetches(), 1);

        for _ in 0..200 {
            if h.pipeline.store().etag(&key).await.as_deref() != Some(seeded.as_str()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let contents = tokio::fs::read(h.pipeline.store().path_for(&key))
            .await
            .expect("entry");
        assert_eq!(contents, b"v1");
    }

    #[tokio::test]
    async fn missing_origin_object_is_not_cached() {
        let h = harness(FakeOrigin::default(), FakeTransformer::default(), true);

        let err = h
            .pipeline
            .serve_file("nope.txt", &FileOptions::default(), "")
            .await
            .expect_err("missing");
        assert!(matches!(err, PipelineError::OriginNotFound(ref key) if key == "nope.txt"));

        let err = h
            .pipeline
            .serve_image("nope.png", &image_options(10, ImageFormat::Png), "")
            .await
            .expect_err("missing");
        assert!(matches!(err, PipelineError::OriginNotFound(_)));
        assert_eq!(h.transformer.calls.load(Ordering::SeqCst), 0);
        assert!(
            h.pipeline
                .store()
                .etag(&CacheKey::original("nope.txt"))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn broken_origin_stream_aborts_body_and_skips_cache() {
        let origin = FakeOrigin::default().broken("big.bin", &[b"partial"]);
        let h = harness(origin, FakeTransformer::default(), true);

        let served = ok(h
            .pipeline
            .serve_file("big.bin", &FileOptions::default(), "")
            .await
            .expect("headers"));
        assert!(collect(served.body).await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            h.pipeline
                .store()
                .etag(&CacheKey::original("big.bin"))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn image_miss_writes_before_responding() {
        let origin = FakeOrigin::default().with("p/cat.png", &[b"PNG"]);
        let h = harness(origin, FakeTransformer::default(), true);
        let options = image_options(100, ImageFormat::Webp);

        let served = ok(h
            .pipeline
            .serve_image("p/cat.png", &options, "")
            .await
            .expect("rendered"));
        let etag = served.etag.clone().expect("etag after awaited write");
        assert_eq!(served.content_type.as_deref(), Some("image/webp"));
        assert_eq!(
            collect(served.body).await.expect("body"),
            b"100x0:cover:webp|PNG"
        );

        let key = CacheKey::new("p/cat.png", options.labels());
        assert_eq!(h.pipeline.store().etag(&key).await, Some(etag.clone()));

        let hit = ok(h
            .pipeline
            .serve_image("p/cat.png", &options, "")
            .await
            .expect("hit"));
        assert_eq!(hit.etag, Some(etag.clone()));
        assert_eq!(
            collect(hit.body).await.expect("body"),
            b"100x0:cover:webp|PNG"
        );

        let conditional = h
            .pipeline
            .serve_image("p/cat.png", &options, &format!("\"{etag}\""))
            .await
            .expect("conditional");
        assert!(matches!(conditional, PipelineResponse::NotModified { .. }));

        assert_eq!(h.origin.fetches(), 1);
        assert_eq!(h.transformer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn variants_of_one_object_are_cached_separately() {
        let origin = FakeOrigin::default().with("a.png", &[b"SRC"]);
        let h = harness(origin, FakeTransformer::default(), true);

        for width in [10, 20, 10] {
            h.pipeline
                .serve_image("a.png", &image_options(width, ImageFormat::Raw), "")
                .await
                .expect("rendered");
        }

        assert_eq!(h.transformer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transform_failure_is_reported_and_not_cached() {
        let origin = FakeOrigin::default().with("bad.png", &[b"garbage"]);
        let transformer = FakeTransformer {
            fail: true,
            ..FakeTransformer::default()
        };
        let h = harness(origin, transformer, true);
        let options = image_options(10, ImageFormat::Png);

        let err = h
            .pipeline
            .serve_image("bad.png", &options, "")
            .await
            .expect_err("transform failed");
        assert!(matches!(err, PipelineError::Transform(_)));
        let key = CacheKey::new("bad.png", options.labels());
        assert!(h.pipeline.store().etag(&key).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_image_misses_are_coalesced() {
        let gate = Arc::new(Notify::new());
        let origin = FakeOrigin {
            gate: Some(gate.clone()),
            ..FakeOrigin::default()
        }
        .with("hot.png", &[b"HOT"]);
        let h = harness(origin, FakeTransformer::default(), true);
        let options = image_options(64, ImageFormat::Jpeg);

        let mut requests = Vec::new();
        for _ in 0..6 {
            let pipeline = Arc::clone(&h.pipeline);
            requests.push(tokio::spawn(async move {
                let served = ok(pipeline
                    .serve_image("hot.png", &options, "")
                    .await
                    .expect("rendered"));
                collect(served.body).await.expect("body")
            }));
        }

        while h.origin.fetches() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.notify_one();

        for request in requests {
            assert_eq!(
                request.await.expect("request task"),
                b"64x0:cover:jpeg|HOT"
            );
        }
        assert_eq!(h.origin.fetches(), 1);
        assert_eq!(h.transformer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unusable_cache_still_serves_images() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().join("cache");
        let store = DiskCacheStore::new(root.clone()).expect("store");
        std::fs::remove_dir(&root).expect("remove cache root");
        std::fs::write(&root, b"not a directory").expect("block cache root");

        let origin = FakeOrigin::default().with("a.png", &[b"SRC"]);
        let h = harness_with_store(dir, store, origin, FakeTransformer::default(), false);

        let served = ok(h
            .pipeline
            .serve_image("a.png", &image_options(5, ImageFormat::Png), "")
            .await
            .expect("served without cache"));
        assert_eq!(served.etag, None);
        assert_eq!(collect(served.body).await.expect("body"), b"5x0:cover:png|SRC");
    }
}
