//! # ebpfdump
//!
//! Capture helper for packet analyzers: lists the interfaces a capture can be
//! started on (including container endpoints) and streams eBPF-observed
//! process/socket events as a capture file.

use std::{env, process::ExitCode};

use log::error;

mod cli;
mod core;
mod dump;
mod interfaces;

use crate::core::logger::Logger;

fn main() -> ExitCode {
    if let Err(e) = Logger::init() {
        eprintln!("Could not set up logging: {e}");
    }

    let args: Vec<_> = env::args_os().collect();
    // Before parsing, so that its own traces show up.
    Logger::set_debug(cli::debug_requested(&args));
    let invocation = cli::parse(args);

    match cli::dispatch(&invocation, &mut cli::Frontend::stdout()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
