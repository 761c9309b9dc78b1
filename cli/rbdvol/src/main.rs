//! rbdvol - provision RBD-backed block devices on this host
//!
//! Creates or reuses a pool image, maps it, formats it when needed and mounts
//! it; `teardown` reverses the host side.

use anyhow::Result;
use clap::Parser;

mod commands;
mod config;
mod error;
mod logging;
mod output;

use commands::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run() {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
