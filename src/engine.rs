// src/engine.rs

//! Contract with the opaque render engine.
//!
//! The engine is synchronous and non-reentrant: one call turns a symbol type
//! and payload into a raw RGBA raster. Everything else (queueing, caching,
//! encoding) lives outside it. The adapter builds an [`EngineParams`] from the
//! request options before each call.

pub mod preview;

pub use preview::{PreviewEngine, PreviewFactory};

use crate::error::RenderError;
use crate::options::{EcLevel, RenderOptions};

/// Presentation parameters handed to the engine for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineParams {
    pub scale_x: f32,
    pub scale_y: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    /// RGBA fill applied to the bitmap before drawing.
    pub background: [u8; 4],
    pub include_text: bool,
    /// Caption drawn instead of the payload when `include_text` is set.
    pub alt_text: Option<String>,
    pub error_correction: Option<EcLevel>,
}

impl EngineParams {
    pub fn from_options(options: &RenderOptions) -> Self {
        Self {
            scale_x: options.scale.x,
            scale_y: options.scale.y,
            pad_x: options.padding.x,
            pad_y: options.padding.y,
            background: options.background.rgba(),
            include_text: options.include_text,
            alt_text: options.caption.clone(),
            error_correction: options.error_correction,
        }
    }
}

/// Raw engine output: tightly packed RGBA8 rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Raster {
    /// Allocates a raster filled with `fill`.
    pub fn filled(width: u32, height: u32, fill: [u8; 4]) -> Self {
        let len = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(len * 4);
        for _ in 0..len {
            pixels.extend_from_slice(&fill);
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Number of bytes a raster of this size must carry.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Paints an axis-aligned rectangle, clipped to the raster.
    pub fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 4]) {
        let x_end = x.saturating_add(w).min(self.width);
        let y_end = y.saturating_add(h).min(self.height);
        for row in y.min(self.height)..y_end {
            for col in x.min(self.width)..x_end {
                let i = (row as usize * self.width as usize + col as usize) * 4;
                self.pixels[i..i + 4].copy_from_slice(&color);
            }
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        let px = self.pixels.get(i..i + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }
}

/// The opaque, synchronous render primitive.
///
/// Implementations are only ever called from the render worker, one call at a
/// time, but may be moved to a helper thread for a timed call, hence `Send`.
pub trait RenderEngine: Send {
    /// Renders `code` as symbol type `symbol`.
    ///
    /// Engines that report failures as `[code] message` strings should build
    /// the error with [`RenderError::from_wire`].
    fn render(
        &mut self,
        symbol: &str,
        code: &str,
        params: &EngineParams,
    ) -> Result<Raster, RenderError>;
}

impl<F> RenderEngine for F
where
    F: FnMut(&str, &str, &EngineParams) -> Result<Raster, RenderError> + Send,
{
    fn render(
        &mut self,
        symbol: &str,
        code: &str,
        params: &EngineParams,
    ) -> Result<Raster, RenderError> {
        self(symbol, code, params)
    }
}
