// src/bin/recover_batch.rs

//! `tron-recover-batch <STATUS_FILE>`
//!
//! Runs on the node next to an action runner. Exits with the action's
//! return code once its status file records one, or with 1 if the runner
//! died without recording it.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tron::fs::RealFileSystem;
use tron::logging;
use tron::recovery::status_file::{ProcFs, wait_for_exit};

#[derive(Debug, Parser)]
#[command(
    name = "tron-recover-batch",
    version,
    about = "Check if an action runner has exited; wait otherwise."
)]
struct Args {
    /// Status file written by the action runner.
    #[arg(value_name = "STATUS_FILE")]
    status_file: PathBuf,

    /// Seconds between liveness checks of the action runner.
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,
}

fn main() {
    let args = Args::parse();
    if let Err(err) = logging::init_logging(None) {
        eprintln!("tron-recover-batch: {err:?}");
    }

    match wait_for_exit(
        &RealFileSystem,
        &args.status_file,
        &ProcFs,
        Duration::from_secs(args.poll_interval.max(1)),
    ) {
        Ok((code, message)) => {
            if let Some(message) = message {
                eprintln!("{message}");
            }
            std::process::exit(code);
        }
        Err(err) => {
            eprintln!("tron-recover-batch error: {err:?}");
            std::process::exit(1);
        }
    }
}
