//! DirGuard — directory tally built on the DirGuard concurrency toolkit.
//!
//! Thin binary entry point. The toolkit lives in `dirguard-core`; this
//! binary only wires configuration, logging and the tally worker together.

mod tally;

use anyhow::Context;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use dirguard_core::config::DEFAULT_LOCK_TIMEOUT_SECS;
use dirguard_core::SyncConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "dirguard",
    about = "DirGuard — tally a directory tree with deadlock-safe workers",
    version
)]
struct Cli {
    /// Directory to tally (default: current directory)
    #[arg(value_name = "PATH", conflicts_with = "path_flag")]
    path: Option<PathBuf>,

    /// Directory to tally, as a flag
    #[arg(short = 'P', long = "path", id = "path_flag", value_name = "PATH")]
    path_flag: Option<PathBuf>,

    /// Worker threads (default: CPU count)
    #[arg(short, long, env = "DIRGUARD_THREADS")]
    threads: Option<usize>,

    /// Lock acquisition timeout in seconds
    #[arg(short, long, env = "DIRGUARD_LOCK_TIMEOUT", default_value_t = DEFAULT_LOCK_TIMEOUT_SECS)]
    lock_timeout: f64,

    /// Debug-level logging and coherence instrumentation
    #[arg(
        short,
        long,
        env = "DIRGUARD_DETAILED",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    detailed: bool,
}

impl Cli {
    fn config(&self) -> anyhow::Result<SyncConfig> {
        let mut config = SyncConfig::with_lock_timeout_secs(self.lock_timeout);
        if let Some(threads) = self.threads {
            config.worker_threads = threads;
        }
        config.detailed = self.detailed;
        config.validate()?;
        Ok(config)
    }

    fn root(&self) -> anyhow::Result<PathBuf> {
        match self.path.as_ref().or(self.path_flag.as_ref()) {
            Some(path) => Ok(path.clone()),
            None => std::env::current_dir().context("cannot read current directory"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config()?;

    // Initialise structured logging.
    let level = if config.detailed {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("DirGuard starting");

    let root = cli.root()?;
    if !root.is_dir() {
        anyhow::bail!("target path is not a directory: {}", root.display());
    }

    let summary = tally::tally_directory(&root, &config)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
