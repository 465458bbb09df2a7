// src/main.rs

//! Command-line front end: renders one symbol through the coordinator.
//!
//! Usage: `barcode-render [--config FILE] SYMBOL CODE [OUT.png]`

use anyhow::{bail, Context};
use barcode_render::config::Config;
use barcode_render::engine::PreviewFactory;
use barcode_render::queue::QueueEvent;
use barcode_render::service::BarcodeService;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "usage: barcode-render [--config FILE] SYMBOL CODE [OUT.png]";

/// How long to wait for the drained event after the render settled.
const DRAIN_WAIT: Duration = Duration::from_secs(1);

struct Args {
    config: Option<PathBuf>,
    symbol: String,
    code: String,
    output: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config = None;
    let mut positional = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a file argument")?;
                config = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let (Some(symbol), Some(code)) = (positional.next(), positional.next()) else {
        bail!("{USAGE}");
    };
    let output = positional.next().map(PathBuf::from);
    if positional.next().is_some() {
        bail!("{USAGE}");
    }
    Ok(Args {
        config,
        symbol,
        code: code.trim().to_string(),
        output,
    })
}

fn main() -> anyhow::Result<()> {
    // Initialize the logger. Default filter is "info" if RUST_LOG is not set.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    let args = parse_args()?;

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            // The built-in preview engine needs no resource files.
            let mut config = Config::default();
            config.loader.resources.clear();
            config
        }
    };
    info!("Configuration loaded: {:?}", config);

    let service = BarcodeService::from_config(&config, Arc::new(PreviewFactory))
        .context("Failed to start barcode service")?;
    let events = service.subscribe();

    let ticket = service.render(&args.symbol, &args.code, config.defaults.options.clone());
    let outcome = ticket.wait();

    while let Ok(event) = events.recv_timeout(DRAIN_WAIT) {
        if let QueueEvent::Drained { cycle, settled } = event {
            info!("Render queue drained (cycle {}, {} task(s))", cycle, settled);
            break;
        }
    }
    service.shutdown();

    let image = match outcome {
        Ok(image) => image,
        Err(e) => {
            error!(
                "Render failed: kind={} engine_code={:?} fingerprint={}",
                e.kind, e.engine_code, e.fingerprint
            );
            return Err(e).context("Render failed");
        }
    };

    match &args.output {
        Some(path) => {
            std::fs::write(path, &image.bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(
                "Wrote {}x{} image to {}",
                image.width,
                image.height,
                path.display()
            );
        }
        None => println!("{}", image.to_data_url()),
    }

    Ok(())
}
