//! Locator.
//!
//! Resolves keys to values through a slow, rate limited remote lookup service, answering from
//! a persistent cache whenever possible.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
