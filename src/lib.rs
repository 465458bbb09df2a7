//! Barcode render coordinator.
//!
//! Puts an asynchronous, single-flight façade in front of a synchronous,
//! non-reentrant barcode render engine:
//!
//! - [`loader`]: brings the engine up exactly once, sharing one load among all
//!   concurrent callers
//! - [`adapter`]: one engine call per request, raster to PNG
//! - [`queue`]: strict FIFO render thread with cancellation, timeouts and a
//!   `Drained` event
//! - [`cache`]: at most one render per request fingerprint
//! - [`service`]: the object a host builds once and hands to its callers
//!
//! # Example
//!
//! ```no_run
//! use barcode_render::config::Config;
//! use barcode_render::engine::PreviewFactory;
//! use barcode_render::options::RenderOptions;
//! use barcode_render::service::BarcodeService;
//! use std::sync::Arc;
//!
//! let mut config = Config::default();
//! config.loader.resources.clear();
//! let service = BarcodeService::from_config(&config, Arc::new(PreviewFactory))?;
//!
//! let ticket = service.render("bitstrip", "HELLO", RenderOptions::default());
//! let image = ticket.wait()?;
//! println!("{}", image.to_data_url());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod adapter;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod loader;
pub mod options;
pub mod promise;
pub mod queue;
pub mod service;

pub use error::{ErrorKind, LoadError, RenderError, RequestError};
pub use options::{Fingerprint, RenderOptions, RenderRequest};
pub use service::{BarcodeService, Ticket};
