//! Storyloom - Interactive Story Writing in the Terminal
//!
//! Reads story entries and `/`-commands from stdin and types the generated
//! continuation to stdout as it arrives from KoboldCpp.
//!
//! # Usage
//!
//! ```bash
//! # Local KoboldCpp on the default port
//! storyloom
//!
//! # Remote server, separate save file
//! storyloom --host gpu-box --port 5002 --save ~/stories/fantasy.json
//!
//! # Verbose logging (to stderr)
//! storyloom -vv
//! RUST_LOG=storyloom_core=trace storyloom
//! ```
//!
//! # Signals
//!
//! - `SIGINT`: stop the running generation, or quit when idle

mod app;
mod repl;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use storyloom_core::{
    config, narrative, Conductor, ConductorConfig, ConfigOverrides, GenerationBackend,
    KoboldBackend, ProjectRegistry,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use app::{App, Flow};

/// Storyloom - interactive story writing with a local KoboldCpp server
#[derive(Parser, Debug)]
#[command(name = "storyloom")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "STORYLOOM_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// KoboldCpp host
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// KoboldCpp port
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Save file path
    #[arg(short = 's', long, value_name = "PATH")]
    save: Option<PathBuf>,

    /// More logging on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

/// Initialize logging on stderr so it never mixes with the story
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("storyloom={level},storyloom_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Load configuration from file, environment and arguments
fn resolve_config(args: &Args) -> Result<config::StoryloomConfig> {
    let mut config = match &args.config {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            config::load_config_from_path(Some(path))?
        }
        None => config::load_config()?,
    };

    let mut overrides = ConfigOverrides::new();
    overrides.host.clone_from(&args.host);
    overrides.port = args.port;
    overrides.save_path.clone_from(&args.save);
    overrides.apply(&mut config)?;

    info!(
        host = %config.backend.host,
        port = config.backend.port,
        source = %config.source(),
        "Configuration loaded"
    );
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = resolve_config(&args)?;

    let registry = match &config.save_path {
        Some(path) => narrative::load(path)
            .with_context(|| format!("Failed to load save file {}", path.display()))?,
        None => {
            warn!("No data directory found, projects will not be saved");
            ProjectRegistry::start_empty()
        }
    };

    let backend = KoboldBackend::with_connect_timeout(
        config.backend.host.clone(),
        config.backend.port,
        config.backend.connect_timeout,
    )?
    .with_sampler(config.sampler.clone());

    let mut stdout = std::io::stdout();
    if !backend.health_check().await {
        writeln!(
            stdout,
            "KoboldCpp is not reachable at {}:{}. Start it, then type a line to write.",
            config.backend.host, config.backend.port
        )?;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conductor_config = ConductorConfig {
        typing: config.typing,
        save_path: config.save_path.clone(),
    };
    let mut app = App::new(Conductor::new(backend, registry, conductor_config, tx)?);

    writeln!(
        stdout,
        "storyloom {} - type /help for commands",
        env!("CARGO_PKG_VERSION")
    )?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    info!("End of input");
                    break;
                };
                if app.handle_line(&line, &mut stdout).await? == Flow::Quit {
                    break;
                }
            }
            Some(message) = rx.recv() => {
                app.render(&message, &mut stdout)?;
            }
            _ = tokio::signal::ctrl_c() => {
                if !app.conductor().abort().await {
                    info!("Interrupted");
                    break;
                }
            }
        }
    }

    info!("Shutting down");
    app.shutdown().context("Failed to save on exit")?;
    Ok(())
}
