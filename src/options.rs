// src/options.rs

//! Typed render options and the request fingerprint.
//!
//! Options fall in two groups:
//! - **Pixel-affecting** (scale, padding, background, caption, error correction):
//!   these go into the [`Fingerprint`] and are handed to the engine.
//! - **Placement-only** ([`Placement`]): how a host embeds the finished image.
//!   They ride along with the request but never change the cache identity.
//!
//! Scale and padding deserialize from either a bare number (both axes) or an
//! `{ "x": .., "y": .. }` object where a missing axis takes the default.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::ConfigError;

/// Symbol type used when a request names none.
pub const DEFAULT_SYMBOL: &str = "code128";
pub const DEFAULT_SCALE: f32 = 2.0;
pub const DEFAULT_PADDING: f32 = 0.0;

/// Serialized form of a two-axis option: one number for both axes, or an
/// object where a missing axis takes the option's default.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum AxisRepr {
    Uniform(f32),
    Axes { x: Option<f32>, y: Option<f32> },
}

impl AxisRepr {
    fn resolve(self, default: f32) -> (f32, f32) {
        match self {
            AxisRepr::Uniform(v) => (v, v),
            AxisRepr::Axes { x, y } => (x.unwrap_or(default), y.unwrap_or(default)),
        }
    }
}

/// Horizontal and vertical scale factors applied by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AxisRepr")]
pub struct Scale {
    pub x: f32,
    pub y: f32,
}

impl Scale {
    pub fn new(x: f32, y: f32) -> Result<Self, ConfigError> {
        for v in [x, y] {
            if !v.is_finite() || v <= 0.0 {
                return Err(ConfigError::InvalidScale(v));
            }
        }
        Ok(Self { x, y })
    }

    pub fn uniform(v: f32) -> Result<Self, ConfigError> {
        Self::new(v, v)
    }
}

impl Default for Scale {
    fn default() -> Self {
        Self {
            x: DEFAULT_SCALE,
            y: DEFAULT_SCALE,
        }
    }
}

impl TryFrom<AxisRepr> for Scale {
    type Error = ConfigError;

    fn try_from(repr: AxisRepr) -> Result<Self, Self::Error> {
        let (x, y) = repr.resolve(DEFAULT_SCALE);
        Self::new(x, y)
    }
}

/// Blank margin added around the symbol, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AxisRepr")]
pub struct Padding {
    pub x: f32,
    pub y: f32,
}

impl Padding {
    pub fn new(x: f32, y: f32) -> Result<Self, ConfigError> {
        for v in [x, y] {
            if !v.is_finite() || v < 0.0 {
                return Err(ConfigError::InvalidPadding(v));
            }
        }
        Ok(Self { x, y })
    }
}

impl Default for Padding {
    fn default() -> Self {
        Self {
            x: DEFAULT_PADDING,
            y: DEFAULT_PADDING,
        }
    }
}

impl TryFrom<AxisRepr> for Padding {
    type Error = ConfigError;

    fn try_from(repr: AxisRepr) -> Result<Self, Self::Error> {
        let (x, y) = repr.resolve(DEFAULT_PADDING);
        Self::new(x, y)
    }
}

/// Background fill of the output image.
///
/// Defaults to opaque white (`FFF`). Parses `transparent`, `RGB`, `RRGGBB`
/// and `RRGGBBAA`, with or without a leading `#`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Background {
    Transparent,
    Rgba([u8; 4]),
}

impl Background {
    pub const WHITE: Background = Background::Rgba([0xff, 0xff, 0xff, 0xff]);

    /// RGBA bytes of the fill colour; transparent is all zeroes.
    pub fn rgba(self) -> [u8; 4] {
        match self {
            Background::Transparent => [0, 0, 0, 0],
            Background::Rgba(c) => c,
        }
    }
}

impl Default for Background {
    fn default() -> Self {
        Background::WHITE
    }
}

impl FromStr for Background {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("transparent") {
            return Ok(Background::Transparent);
        }
        let hex = trimmed.strip_prefix('#').unwrap_or(trimmed);
        let bad = || ConfigError::InvalidColor(s.to_string());
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(bad());
        }
        let nibble = |i: usize| u8::from_str_radix(&hex[i..=i], 16).map_err(|_| bad());
        let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| bad());
        match hex.len() {
            3 => {
                let (r, g, b) = (nibble(0)?, nibble(1)?, nibble(2)?);
                Ok(Background::Rgba([r * 17, g * 17, b * 17, 0xff]))
            }
            6 => Ok(Background::Rgba([byte(0)?, byte(2)?, byte(4)?, 0xff])),
            8 => Ok(Background::Rgba([byte(0)?, byte(2)?, byte(4)?, byte(6)?])),
            _ => Err(bad()),
        }
    }
}

impl TryFrom<String> for Background {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Background> for String {
    fn from(bg: Background) -> Self {
        bg.to_string()
    }
}

impl fmt::Display for Background {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Background::Transparent => f.write_str("transparent"),
            Background::Rgba([r, g, b, 0xff]) => write!(f, "{r:02X}{g:02X}{b:02X}"),
            Background::Rgba([r, g, b, a]) => write!(f, "{r:02X}{g:02X}{b:02X}{a:02X}"),
        }
    }
}

/// Error-correction level for symbologies that support one
/// (L = 7%, M = 15%, Q = 25%, H = 30% recoverable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EcLevel {
    L,
    M,
    Q,
    H,
}

impl EcLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EcLevel::L => "L",
            EcLevel::M => "M",
            EcLevel::Q => "Q",
            EcLevel::H => "H",
        }
    }
}

/// Where a host puts the finished image relative to its anchor element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementMode {
    #[default]
    Replace,
    Append,
    Prepend,
    Before,
    After,
    /// Do not place the image; only hand it to the caller.
    None,
}

/// Placement-only options. Never part of the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Placement {
    pub id: Option<String>,
    pub class_name: Option<String>,
    pub mode: PlacementMode,
    /// Attach the code as a title/tooltip on the embedded image.
    pub title: bool,
}

/// Options for one render request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// Draw the human-readable caption under the symbol.
    pub include_text: bool,
    /// Caption to draw instead of the code itself.
    pub caption: Option<String>,
    pub error_correction: Option<EcLevel>,
    pub scale: Scale,
    pub padding: Padding,
    pub background: Background,
    pub placement: Placement,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            include_text: true,
            caption: None,
            error_correction: None,
            scale: Scale::default(),
            padding: Padding::default(),
            background: Background::default(),
            placement: Placement::default(),
        }
    }
}

impl RenderOptions {
    pub fn with_scale(mut self, scale: Scale) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_background(mut self, background: Background) -> Self {
        self.background = background;
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn with_error_correction(mut self, level: EcLevel) -> Self {
        self.error_correction = Some(level);
        self
    }

    pub fn without_text(mut self) -> Self {
        self.include_text = false;
        self
    }
}

/// One caller's render request: symbol type, payload and options.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub symbol: String,
    /// Payload to encode. Expected pre-trimmed; the coordinator never inspects it.
    pub code: String,
    pub options: RenderOptions,
}

impl RenderRequest {
    pub fn new(symbol: impl Into<String>, code: impl Into<String>, options: RenderOptions) -> Self {
        Self {
            symbol: symbol.into(),
            code: code.into(),
            options,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }
}

// Float fields are keyed by their bit pattern; -0.0 is folded into 0.0 so the
// two spellings of zero padding share an entry.
fn key_bits(v: f32) -> u32 {
    if v == 0.0 {
        0
    } else {
        v.to_bits()
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct FingerprintKey {
    symbol: String,
    code: String,
    scale: (u32, u32),
    padding: (u32, u32),
    background: Background,
    include_text: bool,
    caption: Option<String>,
    error_correction: Option<EcLevel>,
}

/// Cache identity of a request: everything that can change the output pixels
/// and nothing else.
///
/// Cheap to clone; equality and hashing compare the full key, never just a digest.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    key: Arc<FingerprintKey>,
}

impl Fingerprint {
    pub fn of(request: &RenderRequest) -> Self {
        let o = &request.options;
        Self {
            key: Arc::new(FingerprintKey {
                symbol: request.symbol.clone(),
                code: request.code.clone(),
                scale: (key_bits(o.scale.x), key_bits(o.scale.y)),
                padding: (key_bits(o.padding.x), key_bits(o.padding.y)),
                background: o.background,
                include_text: o.include_text,
                caption: o.caption.clone(),
                error_correction: o.error_correction,
            }),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.key.symbol
    }

    pub fn code(&self) -> &str {
        &self.key.code
    }

    /// Short stable digest, used in logs and error messages.
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.key.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:016x}", self.key.symbol, self.digest())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fingerprint")
            .field("symbol", &self.key.symbol)
            .field("code", &self.key.code)
            .field("digest", &format_args!("{:016x}", self.digest()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn request(options: RenderOptions) -> RenderRequest {
        RenderRequest::new("qrcode", "HELLO", options)
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let o = RenderOptions::default();
        assert!(o.include_text);
        assert_eq!(o.scale, Scale { x: 2.0, y: 2.0 });
        assert_eq!(o.padding, Padding { x: 0.0, y: 0.0 });
        assert_eq!(o.background, Background::WHITE);
        assert_eq!(o.error_correction, None);
    }

    #[test]
    fn placement_does_not_change_the_fingerprint() {
        let plain = request(RenderOptions::default());
        let mut placed = RenderOptions::default();
        placed.placement = Placement {
            id: Some("code-1".into()),
            class_name: Some("wide".into()),
            mode: PlacementMode::None,
            title: true,
        };
        assert_eq!(plain.fingerprint(), request(placed).fingerprint());
    }

    #[test]
    fn pixel_options_change_the_fingerprint() {
        let base = request(RenderOptions::default()).fingerprint();
        let scaled = request(RenderOptions::default().with_scale(Scale::uniform(3.0).unwrap()));
        let captioned = request(RenderOptions::default().with_caption("hi"));
        let ec = request(RenderOptions::default().with_error_correction(EcLevel::H));
        let bg = request(RenderOptions::default().with_background(Background::Transparent));
        for other in [scaled, captioned, ec, bg] {
            assert_ne!(base, other.fingerprint());
        }
        assert_ne!(
            base,
            RenderRequest::new("qrcode", "HELLO!", RenderOptions::default()).fingerprint()
        );
    }

    #[test]
    fn negative_zero_padding_is_the_same_key() {
        let a = request(RenderOptions::default().with_padding(Padding::new(0.0, 0.0).unwrap()));
        let b = request(RenderOptions::default().with_padding(Padding::new(-0.0, 0.0).unwrap()));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn scale_accepts_number_or_axes() {
        let uniform: Scale = serde_json::from_str("3").unwrap();
        assert_eq!(uniform, Scale { x: 3.0, y: 3.0 });
        let partial: Scale = serde_json::from_str(r#"{"y": 4}"#).unwrap();
        assert_eq!(partial, Scale { x: 2.0, y: 4.0 });
        assert!(serde_json::from_str::<Scale>("0").is_err());
    }

    #[test]
    fn padding_axes_default_to_zero() {
        let p: Padding = serde_json::from_str(r#"{"x": 20}"#).unwrap();
        assert_eq!(p, Padding { x: 20.0, y: 0.0 });
        assert!(serde_json::from_str::<Padding>("-1").is_err());
    }

    #[test]
    fn background_parsing() {
        assert_eq!("transparent".parse::<Background>().unwrap(), Background::Transparent);
        assert_eq!("FFF".parse::<Background>().unwrap(), Background::WHITE);
        assert_eq!(
            "#102030".parse::<Background>().unwrap(),
            Background::Rgba([0x10, 0x20, 0x30, 0xff])
        );
        assert_eq!(
            "10203040".parse::<Background>().unwrap(),
            Background::Rgba([0x10, 0x20, 0x30, 0x40])
        );
        assert!("white-ish".parse::<Background>().is_err());
        assert!("12345".parse::<Background>().is_err());
        assert_eq!(Background::WHITE.to_string(), "FFFFFF");
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let o: RenderOptions = serde_json::from_str(
            r#"{"scale": {"x": 3, "y": 3}, "background": "transparent", "error_correction": "Q",
                "placement": {"mode": "append"}}"#,
        )
        .unwrap();
        assert_eq!(o.scale, Scale { x: 3.0, y: 3.0 });
        assert_eq!(o.background, Background::Transparent);
        assert_eq!(o.error_correction, Some(EcLevel::Q));
        assert_eq!(o.placement.mode, PlacementMode::Append);
        assert!(o.include_text);
    }
}
