//! Image transforms on top of the `image` crate.
//!
//! Crops and letterboxing are always anchored at the centre of the image;
//! the requested [`Position`](crate::domain::options::Position) is accepted
//! but not applied.

use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use image::{
    DynamicImage, ImageFormat as Codec, RgbaImage,
    codecs::jpeg::JpegEncoder,
    imageops::{self, FilterType},
};

use crate::{
    application::transform::{ImageTransformer, TransformError, TransformRequest},
    domain::options::{Fit, ImageFormat},
};

const FILTER: FilterType = FilterType::CatmullRom;
const JPEG_QUALITY: u8 = 80;

/// Largest side any output or intermediate image may have (the WebP limit).
const MAX_SIDE: u32 = 16_383;
/// Pixel budget for any output or intermediate image.
const MAX_PIXELS: u64 = 40_000_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateTransformer;

impl ImageCrateTransformer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ImageTransformer for ImageCrateTransformer {
    async fn transform(
        &self,
        source: Bytes,
        request: &TransformRequest,
    ) -> Result<Bytes, TransformError> {
        let request = *request;
        tokio::task::spawn_blocking(move || transform_blocking(source, &request))
            .await
            .map_err(|err| TransformError::Task(err.to_string()))?
    }
}

fn transform_blocking(source: Bytes, request: &TransformRequest) -> Result<Bytes, TransformError> {
    let source_codec =
        image::guess_format(&source).map_err(|err| TransformError::Decode(Box::new(err)))?;

    if request.format == ImageFormat::Raw && !request.resizes() {
        return Ok(source);
    }

    let decoded = image::load_from_memory_with_format(&source, source_codec)
        .map_err(|err| TransformError::Decode(Box::new(err)))?;
    let resized = if request.resizes() {
        resize(decoded, request)?
    } else {
        decoded
    };

    let codec = match request.format {
        ImageFormat::Jpeg => Codec::Jpeg,
        ImageFormat::Png => Codec::Png,
        ImageFormat::Webp => Codec::WebP,
        ImageFormat::Raw => source_codec,
    };
    encode(&resized, codec)
}

/// Apply `request.fit` to reach the requested box. A missing dimension is
/// derived from the source aspect ratio.
///
/// The box, and for `cover`/`outside` the covering size, must stay within
/// [`MAX_SIDE`] and [`MAX_PIXELS`]; nothing is allocated otherwise.
fn resize(image: DynamicImage, request: &TransformRequest) -> Result<DynamicImage, TransformError> {
    let (width, height) = target_box(image.width(), image.height(), request.width, request.height);
    check_bounds(width, height)?;

    let resized = match request.fit {
        Fit::Cover => {
            let (cover_width, cover_height) = covering(&image, width, height);
            check_bounds(cover_width, cover_height)?;
            image.resize_to_fill(width, height, FILTER)
        }
        Fit::Fill => image.resize_exact(width, height, FILTER),
        Fit::Inside => image.resize(width, height, FILTER),
        Fit::Contain => letterbox(&image.resize(width, height, FILTER), width, height),
        Fit::Outside => {
            let (cover_width, cover_height) = covering(&image, width, height);
            check_bounds(cover_width, cover_height)?;
            image.resize_exact(cover_width, cover_height, FILTER)
        }
    };
    Ok(resized)
}

/// Smallest aspect-preserving size of `image` that covers `width`×`height`.
fn covering(image: &DynamicImage, width: u32, height: u32) -> (u32, u32) {
    let scale = f64::max(
        f64::from(width) / f64::from(image.width().max(1)),
        f64::from(height) / f64::from(image.height().max(1)),
    );
    (scaled(image.width(), scale), scaled(image.height(), scale))
}

fn check_bounds(width: u32, height: u32) -> Result<(), TransformError> {
    if width > MAX_SIDE || height > MAX_SIDE || u64::from(width) * u64::from(height) > MAX_PIXELS
    {
        return Err(TransformError::TooLarge { width, height });
    }
    Ok(())
}

fn target_box(
    source_width: u32,
    source_height: u32,
    width: Option<u32>,
    height: Option<u32>,
) -> (u32, u32) {
    let source_width = source_width.max(1);
    let source_height = source_height.max(1);

    match (width, height) {
        (Some(width), Some(height)) => (width, height),
        (Some(width), None) => (
            width,
            scaled(source_height, f64::from(width) / f64::from(source_width)),
        ),
        (None, Some(height)) => (
            scaled(source_width, f64::from(height) / f64::from(source_height)),
            height,
        ),
        (None, None) => (source_width, source_height),
    }
}

fn scaled(value: u32, scale: f64) -> u32 {
    let result = (f64::from(value) * scale).round();
    if result < 1.0 {
        1
    } else if result > f64::from(u32::MAX) {
        u32::MAX
    } else {
        result as u32
    }
}

/// Centre `image` on a transparent `width`×`height` canvas.
fn letterbox(image: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    let mut canvas = RgbaImage::new(width, height);
    let x = (i64::from(width) - i64::from(image.width())) / 2;
    let y = (i64::from(height) - i64::from(image.height())) / 2;
    imageops::overlay(&mut canvas, &image.to_rgba8(), x, y);
    DynamicImage::ImageRgba8(canvas)
}

fn encode(image: &DynamicImage, codec: Codec) -> Result<Bytes, TransformError> {
    let mut buffer = Cursor::new(Vec::new());
    let encode_error = |err: image::ImageError| TransformError::Encode {
        format: codec_name(codec),
        source: Box::new(err),
    };

    match codec {
        Codec::Jpeg => {
            // JPEG has no alpha channel; it is dropped.
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY);
            rgb.write_with_encoder(encoder).map_err(encode_error)?;
        }
        Codec::WebP => {
            // The WebP encoder is lossless and only takes 8-bit RGB(A).
            let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
            rgba.write_to(&mut buffer, Codec::WebP)
                .map_err(encode_error)?;
        }
        other => image.write_to(&mut buffer, other).map_err(encode_error)?,
    }

    Ok(Bytes::from(buffer.into_inner()))
}

fn codec_name(codec: Codec) -> &'static str {
    codec.extensions_str().first().copied().unwrap_or("unknown")
}
