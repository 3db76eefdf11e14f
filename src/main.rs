//! Entry point for the patchobj differ.
//!
//! Simple flow: parse args → load both objects → diff → extract the
//! closure → write the patch object. Exit status 1 means an operational
//! failure, 2 an unreconcilable difference between the inputs.

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use patchobj::config::Config;
use patchobj::error::Unreconcilable;

fn main() -> ExitCode {
    let config = Config::parse();

    // Initialize logging; --debug raises the default threshold, RUST_LOG
    // still wins when set.
    let default = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match patchobj::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.downcast_ref::<Unreconcilable>().is_some() => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}
