use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Log to stderr at `info` (or whatever `RUST_LOG` asks for), and everything
/// down to `debug` into `debug_log` if one is given.
///
/// stdout is left to the session so generated Verilog can be piped.
pub fn init(debug_log: Option<&Path>) -> anyhow::Result<()> {
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        );

    let debug_log = match debug_log {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create debug log {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr)
        .with(debug_log)
        .try_init()
        .context("Failed to install the logger")?;
    Ok(())
}
