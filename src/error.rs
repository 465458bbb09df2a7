//! Error types for the render coordinator.
//!
//! - [`LoadError`]: a resource (or the engine itself) failed to load; only the
//!   shared load future is rejected and the loader becomes retryable.
//! - [`RenderError`]: the engine rejected one request; only that task fails.
//! - [`RequestError`]: what a caller finally sees: a kind, the engine diagnostic
//!   if there is one, and the fingerprint of the request.
//! - [`ConfigError`]: an option or config value is out of range.

use std::fmt;
use thiserror::Error;

use crate::options::Fingerprint;

/// Resource id reported when every resource loaded but the engine could not
/// be instantiated from them.
pub const ENGINE_STAGE: &str = "<engine>";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to load resource '{resource_id}': {reason}")]
pub struct LoadError {
    pub resource_id: String,
    pub reason: String,
}

impl LoadError {
    pub fn new(resource_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            reason: reason.into(),
        }
    }
}

/// The engine refused a type/code/options combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderError {
    /// Engine-reported diagnostic code, e.g. `BWIPP.UNKNOWN_ENCODER`.
    pub engine_code: Option<String>,
    pub message: String,
}

impl RenderError {
    pub fn new(engine_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            engine_code: Some(engine_code.into()),
            message: message.into(),
        }
    }

    /// Parses the engine's single-string error contract, `[code] message`.
    ///
    /// Anything that does not start with a bracketed code becomes a message
    /// with no code.
    pub fn from_wire(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Some(rest) = trimmed.strip_prefix('[') {
            if let Some((code, message)) = rest.split_once(']') {
                let code = code.trim();
                if !code.is_empty() {
                    return Self {
                        engine_code: Some(code.to_string()),
                        message: message.trim().to_string(),
                    };
                }
            }
        }
        Self {
            engine_code: None,
            message: trimmed.to_string(),
        }
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.engine_code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RenderError {}

/// Failure category carried by a [`RequestError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Engine resources could not be loaded.
    Load,
    /// The engine rejected the request.
    Render,
    /// The task was cancelled before it produced a result.
    Cancelled,
    /// The engine call exceeded the per-task timeout.
    TimedOut,
    /// Adapter or worker fault not attributable to the request.
    Internal,
    /// Request cache invariant violated.
    Cache,
}

impl ErrorKind {
    /// Transient failures say nothing about the request itself, so a cached
    /// entry holding one is always replaced on the next identical request.
    pub fn is_transient(self) -> bool {
        !matches!(self, ErrorKind::Render)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Load => "load",
            ErrorKind::Render => "render",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::Internal => "internal",
            ErrorKind::Cache => "cache",
        };
        f.write_str(name)
    }
}

/// Settled failure of one render request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error for {fingerprint}: {message}")]
pub struct RequestError {
    pub kind: ErrorKind,
    pub engine_code: Option<String>,
    pub message: String,
    pub fingerprint: Fingerprint,
}

impl RequestError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, fingerprint: &Fingerprint) -> Self {
        Self {
            kind,
            engine_code: None,
            message: message.into(),
            fingerprint: fingerprint.clone(),
        }
    }

    pub fn render(err: RenderError, fingerprint: &Fingerprint) -> Self {
        Self {
            kind: ErrorKind::Render,
            engine_code: err.engine_code,
            message: err.message,
            fingerprint: fingerprint.clone(),
        }
    }

    pub fn load(err: &LoadError, fingerprint: &Fingerprint) -> Self {
        Self::new(ErrorKind::Load, err.to_string(), fingerprint)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("scale must be finite and positive, got {0}")]
    InvalidScale(f32),
    #[error("padding must be finite and non-negative, got {0}")]
    InvalidPadding(f32),
    #[error("invalid colour '{0}': expected 'transparent' or hex RGB, RRGGBB or RRGGBBAA")]
    InvalidColor(String),
}
