// src/adapter.rs

//! Renderer adapter: one synchronous engine call per request.
//!
//! Applies the request's presentation parameters, invokes the engine once and
//! turns the raw raster into a PNG payload. No retries happen here; a failure
//! is classified and handed back to the queue:
//! - engine refusals become [`RenderError`]s (with the engine's diagnostic code),
//! - a panicking engine or a malformed raster becomes an internal fault.

use base64::Engine as _;
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder};
use log::*;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use crate::engine::{EngineParams, Raster, RenderEngine};
use crate::error::RenderError;
use crate::options::RenderRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
}

impl ImageFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
        }
    }
}

/// Portable encoded image handed to every caller that shares a fingerprint.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

impl EncodedImage {
    /// `data:` URL suitable for an `<img src>`.
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.format.mime_type(),
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

impl fmt::Debug for EncodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedImage")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// Why a single adapter call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    Render(RenderError),
    Internal(String),
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterError::Render(e) => write!(f, "engine rejected request: {e}"),
            AdapterError::Internal(msg) => write!(f, "internal adapter fault: {msg}"),
        }
    }
}

impl std::error::Error for AdapterError {}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RendererAdapter;

impl RendererAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Renders `request` with `engine` and encodes the result.
    pub fn render(
        &self,
        engine: &mut dyn RenderEngine,
        request: &RenderRequest,
    ) -> Result<EncodedImage, AdapterError> {
        let start = Instant::now();
        let params = EngineParams::from_options(&request.options);
        trace!(
            "RendererAdapter: {} scale=({}, {}) pad=({}, {})",
            request.symbol,
            params.scale_x,
            params.scale_y,
            params.pad_x,
            params.pad_y
        );

        let raster = panic::catch_unwind(AssertUnwindSafe(|| {
            engine.render(&request.symbol, &request.code, &params)
        }))
        .map_err(|payload| {
            let msg = panic_message(payload.as_ref());
            error!("RendererAdapter: engine panicked: {}", msg);
            AdapterError::Internal(format!("engine panicked: {msg}"))
        })?
        .map_err(AdapterError::Render)?;

        let image = encode_png(&raster)?;
        debug!(
            "RendererAdapter: {} rendered {}x{} in {:?}",
            request.symbol,
            image.width,
            image.height,
            start.elapsed()
        );
        Ok(image)
    }
}

fn encode_png(raster: &Raster) -> Result<EncodedImage, AdapterError> {
    if raster.width == 0 || raster.height == 0 {
        return Err(AdapterError::Internal(format!(
            "engine produced an empty {}x{} raster",
            raster.width, raster.height
        )));
    }
    if raster.pixels.len() != raster.expected_len() {
        return Err(AdapterError::Internal(format!(
            "raster is {}x{} but carries {} bytes, expected {}",
            raster.width,
            raster.height,
            raster.pixels.len(),
            raster.expected_len()
        )));
    }

    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes)
        .write_image(
            &raster.pixels,
            raster.width,
            raster.height,
            ColorType::Rgba8.into(),
        )
        .map_err(|e| AdapterError::Internal(format!("png encoding failed: {e}")))?;

    Ok(EncodedImage {
        format: ImageFormat::Png,
        width: raster.width,
        height: raster.height,
        bytes,
    })
}
