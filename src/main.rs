use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{info, Level};

use webserv::{Config, Server};

/// Single-threaded HTTP/1.1 server with virtual hosts and CGI.
#[derive(Parser)]
#[command(name = "webserv", version)]
struct Cli {
    /// Configuration file
    #[arg(default_value = "config.toml")]
    config: PathBuf,

    /// Validate and print the configuration, then exit
    #[arg(long, default_value_t = false)]
    check: bool,

    /// Overrides `logging.level` from the configuration
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    print!("{}", config);
    if cli.check {
        println!("configuration ok");
        return Ok(());
    }

    let level_name = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let level: Level = level_name
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown log level '{}'", level_name))?;
    match &config.logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_target(false)
                .with_ansi(false)
                .with_max_level(level)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_target(false)
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .with_context(|| format!("registering handler for signal {}", signal))?;
    }

    let mut server = Server::bind(config).context("starting server")?;
    server.run(&shutdown)?;
    info!("stopped");
    Ok(())
}
