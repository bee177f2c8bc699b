//! Subcommands of the `wasmtime-async` binary.

use anyhow::Result;
use std::io::IsTerminal;

mod demo;

pub use self::demo::DemoCommand;

/// Installs a `tracing` subscriber writing to stderr, filtered by the
/// `WASMTIME_ASYNC_LOG` environment variable. Records emitted through the
/// `log` facade are forwarded to it.
pub(crate) fn init_logging() -> Result<()> {
    tracing_subscriber::FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("WASMTIME_ASYNC_LOG"))
        .with_ansi(std::io::stderr().is_terminal())
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}
