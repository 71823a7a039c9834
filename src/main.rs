use ble_scanner::app::{Options, RunError, run_with_io};
use ble_scanner::scanner::RealScanner;
use clap::Parser;
use log::LevelFilter;
use std::panic::{self, PanicHookInfo};
use std::sync::Arc;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Log to stderr. `-v` lowers the default level from warn to debug;
/// `RUST_LOG` overrides both.
fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    let scanner = Arc::new(RealScanner::new(options.backend));
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();

    match run_with_io(options, scanner, &mut stdout, &mut stderr).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        // Already reported by the run loop
        Err(RunError::Session(_)) => std::process::exit(EXIT_ERROR),
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
