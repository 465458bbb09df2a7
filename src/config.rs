// src/config.rs

//! Configuration for the render coordinator.
//!
//! The whole tree deserializes from JSON with defaults for every missing
//! field, so an empty object (or no file at all) is a valid configuration.
//! There is no process-wide instance: the host builds one and hands it to
//! [`BarcodeService`](crate::service::BarcodeService).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::FailurePolicy;
use crate::options::{RenderOptions, DEFAULT_SYMBOL};

/// Engine resources in load order. Later files rely on what earlier ones set up.
pub const DEFAULT_RESOURCES: [&str; 5] = [
    "freetype.js",
    "bwipp.js",
    "bwipjs.js",
    "lib/bitmap.js",
    "fonts/Inconsolata.otf",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub loader: LoaderConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    /// Service-wide defaults applied when a request leaves them out.
    pub defaults: RenderDefaults,
}

impl Config {
    /// Reads and parses a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse config JSON")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoaderConfig {
    /// Directory the resources are read from.
    pub root: PathBuf,
    pub resources: Vec<String>,
    /// Start loading as soon as the service is built instead of on first use.
    pub preload: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            root: PathBuf::from("bwip-js"),
            resources: DEFAULT_RESOURCES.iter().map(|s| s.to_string()).collect(),
            preload: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound for a single engine call. Unset means wait forever.
    pub task_timeout_ms: Option<u64>,
}

impl QueueConfig {
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderDefaults {
    pub symbol: String,
    pub options: RenderOptions,
}

impl Default for RenderDefaults {
    fn default() -> Self {
        RenderDefaults {
            symbol: DEFAULT_SYMBOL.to_string(),
            options: RenderOptions::default(),
        }
    }
}
