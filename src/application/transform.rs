//! Image transformation port.

use std::error::Error as StdError;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::domain::options::{Fit, ImageFormat, ImageOptions, Position};

/// Parameters of a single transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fit: Fit,
    pub position: Position,
    pub format: ImageFormat,
}

impl TransformRequest {
    pub fn resizes(&self) -> bool {
        self.width.is_some() || self.height.is_some()
    }
}

impl From<&ImageOptions> for TransformRequest {
    fn from(options: &ImageOptions) -> Self {
        Self {
            width: options.width,
            height: options.height,
            fit: options.fit,
            position: options.position,
            format: options.format,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to decode source image")]
    Decode(#[source] Box<dyn StdError + Send + Sync>),
    #[error("failed to encode image as {format}")]
    Encode {
        format: &'static str,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("requested {width}x{height} image exceeds the output limits")]
    TooLarge { width: u32, height: u32 },
    #[error("transform task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait ImageTransformer: Send + Sync {
    async fn transform(
        &self,
        source: Bytes,
        request: &TransformRequest,
    ) -> Result<Bytes, TransformError>;
}
