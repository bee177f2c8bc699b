//! Command-line driver for the asynchronous call core.

use anyhow::Result;
use clap::Parser;

mod commands;

/// Drives asynchronous guest calls from the command line.
#[derive(Parser)]
#[command(name = "wasmtime-async")]
enum WasmtimeAsync {
    Demo(commands::DemoCommand),
}

impl WasmtimeAsync {
    fn execute(self) -> Result<()> {
        match self {
            Self::Demo(c) => c.execute(),
        }
    }
}

fn main() -> Result<()> {
    WasmtimeAsync::parse().execute()
}
