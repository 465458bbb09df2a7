// src/engine/preview.rs

//! Built-in preview engine.
//!
//! Draws the `bitstrip` symbol: every payload byte becomes eight modules, most
//! significant bit first, dark for 1. It is not a scannable symbology; it
//! exists so the coordinator can be driven end to end without the real engine.

use crate::engine::{EngineParams, Raster, RenderEngine};
use crate::error::RenderError;
use crate::loader::{EngineFactory, LoadedResource};

pub const BITSTRIP: &str = "bitstrip";

/// Bar height in unscaled pixels.
const BAR_HEIGHT: f32 = 24.0;
/// Height of the space reserved under the bars for the caption.
const CAPTION_BAND: f32 = 8.0;
const INK: [u8; 4] = [0, 0, 0, 0xff];
/// Largest raster the preview engine will allocate (64 Mpx, 256 MiB of RGBA).
pub const MAX_PIXELS: u64 = 1 << 26;

fn px(v: f32) -> u32 {
    v.round().max(0.0) as u32
}

/// Output size for `len` payload bytes, or `None` if it overflows or exceeds
/// [`MAX_PIXELS`].
fn raster_size(len: usize, module: u32, body: u32, pad_x: u32, pad_y: u32) -> Option<(u32, u32)> {
    let modules = u32::try_from(len).ok()?.checked_mul(8)?;
    let width = modules
        .checked_mul(module)?
        .checked_add(pad_x.checked_mul(2)?)?;
    let height = body.checked_add(pad_y.checked_mul(2)?)?;
    if u64::from(width) * u64::from(height) > MAX_PIXELS {
        return None;
    }
    Some((width, height))
}

#[derive(Debug, Default)]
pub struct PreviewEngine {
    renders: u64,
}

impl PreviewEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful renders so far.
    pub fn renders(&self) -> u64 {
        self.renders
    }
}

impl RenderEngine for PreviewEngine {
    fn render(
        &mut self,
        symbol: &str,
        code: &str,
        params: &EngineParams,
    ) -> Result<Raster, RenderError> {
        if symbol != BITSTRIP {
            return Err(RenderError::from_wire(&format!(
                "[BWIPP.UNKNOWN_ENCODER] unknown symbol type '{symbol}'"
            )));
        }
        if code.is_empty() {
            return Err(RenderError::new("BITSTRIP.EMPTY", "nothing to encode"));
        }

        let module = px(params.scale_x).max(1);
        let bar_height = px(BAR_HEIGHT * params.scale_y).max(1);
        let caption = if params.include_text {
            px(CAPTION_BAND * params.scale_y)
        } else {
            0
        };
        let (pad_x, pad_y) = (px(params.pad_x), px(params.pad_y));

        let body = bar_height.saturating_add(caption);
        let (width, height) =
            raster_size(code.len(), module, body, pad_x, pad_y).ok_or_else(|| {
                RenderError::new(
                    "BITSTRIP.TOO_LARGE",
                    format!(
                        "{} modules at scale ({}, {}) exceed {} pixels",
                        code.len() * 8,
                        params.scale_x,
                        params.scale_y,
                        MAX_PIXELS
                    ),
                )
            })?;
        let mut raster = Raster::filled(width, height, params.background);

        for (i, byte) in code.bytes().enumerate() {
            for bit in 0..8u32 {
                if byte & (0x80 >> bit) != 0 {
                    let x = pad_x + (i as u32 * 8 + bit) * module;
                    raster.fill_rect(x, pad_y, module, bar_height, INK);
                }
            }
        }

        self.renders += 1;
        Ok(raster)
    }
}

/// Factory for [`PreviewEngine`]. Needs no resources; any configured ones are
/// loaded and ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreviewFactory;

impl EngineFactory for PreviewFactory {
    fn instantiate(&self, _resources: &[LoadedResource]) -> Result<Box<dyn RenderEngine>, String> {
        Ok(Box::new(PreviewEngine::new()))
    }
}
