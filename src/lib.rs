//! rtmsg command-line client
//!
//! Runs one execution context against a notification server and prints what
//! it receives as NDJSON.

pub mod output;
pub mod runner;

pub use runner::run_client;

use rtmsg_core::prelude::*;
use rtmsg_core::Settings;

/// Entry point once settings are resolved.
pub async fn run(settings: Settings) -> Result<()> {
    color_eyre::install().map_err(|e| Error::config(format!("error reporting: {e}")))?;
    rtmsg_core::logging::init()?;

    let result = run_client(&settings).await;
    if let Err(ref e) = result {
        error!("Client error (fatal: {}): {:?}", e.is_fatal(), e);
        if let Ok(log_file) = rtmsg_core::logging::get_current_log_file() {
            eprintln!("See {} for details", log_file.display());
        }
    }
    result
}
