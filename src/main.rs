//! rtmsg - cross-context real-time notification client
//!
//! Binary entry point: resolves settings from the config file, environment
//! and flags, then hands over to the library.

use std::path::PathBuf;

use clap::Parser;
use rtmsg_core::prelude::*;
use rtmsg_core::{default_config_path, load_settings, Settings, StoreBackend};

/// rtmsg - cross-context real-time notification client
#[derive(Parser, Debug)]
#[command(name = "rtmsg")]
#[command(about = "Shares one notification socket between cooperating processes", long_about = None)]
struct Args {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Notification server host, optionally with port
    #[arg(long)]
    host: Option<String>,

    /// Shard identifier
    #[arg(long)]
    shard: Option<String>,

    /// Use ws:// instead of wss://
    #[arg(long)]
    insecure: bool,

    /// Authentication token (overrides RTMSG_AUTH_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Directory of the shared store
    #[arg(long, value_name = "DIR")]
    store_dir: Option<PathBuf>,

    /// Keep the store in memory (no coordination with other processes)
    #[arg(long, conflicts_with = "store_dir")]
    memory_store: bool,
}

impl Args {
    fn apply(self, settings: &mut Settings) {
        if let Some(host) = self.host {
            settings.server.host_name = host;
        }
        if let Some(shard) = self.shard {
            settings.server.shard_id = shard;
        }
        if self.insecure {
            settings.server.secure = false;
        }
        if let Some(token) = self.token {
            settings.server.auth_token = Some(token);
        }
        if let Some(dir) = self.store_dir {
            settings.store.backend = StoreBackend::File;
            settings.store.dir = Some(dir);
        }
        if self.memory_store {
            settings.store.backend = StoreBackend::Memory;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = args.config.as_ref().filter(|p| !p.exists()) {
        eprintln!("❌ {}", Error::ConfigNotFound { path: path.clone() });
        std::process::exit(2);
    }

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut settings = load_settings(&config_path);
    settings.apply_env();
    args.apply(&mut settings);

    if let Err(e) = settings.validate() {
        eprintln!("❌ Invalid settings: {e}");
        eprintln!("   Config file: {}", config_path.display());
        eprintln!();
        eprintln!("Hint: pass the server on the command line:");
        eprintln!("      rtmsg --host push.example.com --shard 7");
        std::process::exit(2);
    }

    rtmsg::run(settings).await
}
