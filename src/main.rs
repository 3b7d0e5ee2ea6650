mod args;
mod session;

use clap::Parser;
use log::{debug, LevelFilter};
use std::error::Error;
use std::process::ExitCode;

use crate::args::Args;

fn main() -> ExitCode {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();
    debug!("args: {:?}", args);

    match session::run_session(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            let mut source = e.source();
            while let Some(s) = source {
                eprintln!("  caused by: {}", s);
                source = s.source();
            }
            ExitCode::FAILURE
        }
    }
}
