use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_NONE_MATCH},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::debug;

use crate::application::{
    error::HttpError,
    pipeline::{PipelineResponse, RequestPipeline},
};

use super::middleware::{log_responses, set_request_context};

const SOURCE: &str = "imagecache::infra::http::public";

#[derive(Clone)]
pub struct HttpState {
    pub pipeline: Arc<RequestPipeline>,
}

impl HttpState {
    pub fn new(pipeline: RequestPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/file/{signature}/{options}/{*object_path}", get(serve_file))
        .route("/image/{signature}/{options}/{*object_path}", get(serve_image))
        .route("/_health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn serve_file(
    State(state): State<HttpState>,
    Path((signature, options, object_path)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    let options = state
        .pipeline
        .authorize_file(&signature, &options, &object_path)?;

    let outcome = state
        .pipeline
        .serve_file(&object_path, &options, client_etag(&headers))
        .await?;
    Ok(into_response(outcome))
}

async fn serve_image(
    State(state): State<HttpState>,
    Path((signature, options, object_path)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    let options = state
        .pipeline
        .authorize_image(&signature, &options, &object_path)?;

    let outcome = state
        .pipeline
        .serve_image(&object_path, &options, client_etag(&headers))
        .await?;
    Ok(into_response(outcome))
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

fn client_etag(headers: &HeaderMap) -> &str {
    headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

fn into_response(outcome: PipelineResponse) -> Response {
    match outcome {
        PipelineResponse::NotModified { etag } => {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            if let Ok(value) = HeaderValue::from_str(&etag) {
                response.headers_mut().insert(ETAG, value);
            }
            response
        }
        PipelineResponse::Ok(object) => {
            let len = object.body.len();
            let mut response = Response::new(Body::from_stream(object.body.into_stream()));
            *response.status_mut() = StatusCode::OK;

            let headers = response.headers_mut();
            if let Some(etag) = object.etag
                && let Ok(value) = HeaderValue::from_str(&etag)
            {
                headers.insert(ETAG, value);
            }
            if let Some(content_type) = object.content_type {
                match HeaderValue::from_str(&content_type) {
                    Ok(value) => {
                        headers.insert(CONTENT_TYPE, value);
                    }
                    Err(_) => debug!(
                        target = SOURCE,
                        content_type = %content_type,
                        "ignoring unrepresentable content type"
                    ),
                }
            }
            if let Some(len) = len {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            }

            response
        }
    }
}
