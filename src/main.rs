use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use metrond::config::{ConfigKey, EngineConfig};
use metrond::engine::Engine;
use metrond::guardrail::EngineStats;
use metrond::metrics::init::InitDeps;
use metrond::wire::AtomStream;

/// In-process metric aggregation engine.
#[derive(Parser)]
#[command(name = "metrond", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Uid the configuration is installed under.
    #[arg(long, default_value_t = 1000)]
    uid: i32,

    /// Wire-format atom stream to replay; stdin when omitted.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Include the current partial bucket in the report.
    #[arg(long)]
    include_partial: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("metrond {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;
    let cfg = EngineConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(version = version::RELEASE, "starting metrond");

    let mut data = Vec::new();
    match &cli.input {
        Some(path) => {
            data = std::fs::read(path)
                .with_context(|| format!("reading atoms from {}", path.display()))?;
        }
        None => {
            std::io::stdin()
                .read_to_end(&mut data)
                .context("reading atoms from stdin")?;
        }
    }

    let key = ConfigKey {
        uid: cli.uid,
        id: cfg.id,
    };
    let engine = Engine::new(0, InitDeps::bare(EngineStats::shared()), None);
    if !engine.install_config(key, cfg, 0) {
        anyhow::bail!("configuration rejected");
    }

    let mut ingested = 0u64;
    let mut dropped = 0u64;
    let mut last_elapsed_ns = 0i64;
    for record in AtomStream::new(&data) {
        match record {
            Ok(atom) => {
                last_elapsed_ns = last_elapsed_ns.max(atom.elapsed_ns());
                engine.on_atom(&atom);
                ingested += 1;
            }
            Err(err) => {
                tracing::warn!(%err, "skipping malformed record");
                dropped += 1;
            }
        }
    }
    tracing::info!(ingested, dropped, "replay complete");

    let report = engine
        .dump_report(key, last_elapsed_ns, 0, cli.include_partial, true)
        .context("configuration vanished mid-run")?;
    let bytes = report.to_bytes();
    println!("{}", String::from_utf8_lossy(&bytes));

    Ok(())
}
