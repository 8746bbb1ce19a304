//! Command-line entry point for the `xqd-host` binary (§1
//! "Embedder" (AMBIENT)).
//!
//! Grounded on other_examples fasttime's `structopt`-based CLI, modernized
//! to `clap`'s derive API to match the rest of this crate's dependency choices.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "xqd-host", about = "Host runtime for XQD-ABI WebAssembly programs")]
pub struct Cli {
    /// Path to the TOML config file describing backends, dictionaries, and
    /// the guest module to serve.
    #[arg(short, long, env = "XQD_HOST_CONFIG")]
    pub config: PathBuf,

    /// Override the config's `listen` address.
    #[arg(long)]
    pub listen: Option<std::net::SocketAddr>,

    /// Increase log verbosity (`-v`, `-vv`, ...); overrides `RUST_LOG`.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn log_filter(&self) -> String {
        match self.verbose {
            0 => "info".to_string(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}
