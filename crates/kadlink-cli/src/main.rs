//! kadlink CLI
//!
//! Runs a node and an interactive shell for connecting, discovering peers,
//! and exchanging stream messages.

mod app;
mod config;
mod shell;

use clap::Parser;
use console::style;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use app::App;
use config::CliConfig;
use kadlink_core::{Keypair, Node};
use shell::Command;

/// kadlink - authenticated peer-to-peer node
#[derive(Parser)]
#[command(name = "kadlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Bootstrap peer addresses
    #[arg(short, long, num_args = 1..)]
    bootstrap: Vec<String>,

    /// Identity seed (32 bytes hex)
    #[arg(long)]
    seed: Option<String>,

    /// Ask before accepting PoR requests
    #[arg(long)]
    no_auto_accept: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CliConfig::load(path)?,
        None => CliConfig::load_or_default()?,
    };
    apply_overrides(&mut config, &cli);
    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let keypair = config.keypair()?.unwrap_or_else(Keypair::generate);
    let node = Node::with_keypair(keypair, config.to_node_config()?)?;
    node.start().await?;

    println!("{}", style("kadlink node").bold());
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Peer ID: {}", node.peer_id());
    let address = node
        .listen(&shell::listen_address(&config.node.host, config.node.port))
        .await?;
    println!("Address: {address}");

    let app = App::new(
        node.clone(),
        config.node.auto_accept,
        Duration::from_secs(config.stream.read_timeout_secs),
    );
    let events = tokio::spawn(app.clone().run_events());

    if !config.dht.bootstrap.is_empty() {
        if node.bootstrap().await {
            println!("Bootstrapped, {} routable peers", node.kad_known_peers().len());
        } else {
            println!("{}", style("Bootstrap found no peers").yellow());
        }
    }

    println!("Type 'help' for commands");
    run_shell(&app, &config.node.host).await?;

    println!("\nShutting down...");
    node.stop().await?;
    let _ = events.await;
    Ok(())
}

fn apply_overrides(config: &mut CliConfig, cli: &Cli) {
    if let Some(port) = cli.port {
        config.node.port = port;
    }
    if let Some(host) = &cli.host {
        config.node.host.clone_from(host);
    }
    if !cli.bootstrap.is_empty() {
        config.dht.bootstrap.clone_from(&cli.bootstrap);
    }
    if let Some(seed) = &cli.seed {
        config.node.seed = Some(seed.clone());
    }
    if cli.no_auto_accept {
        config.node.auto_accept = false;
    }
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
}

async fn run_shell(app: &App, default_host: &str) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };
        let Some(line) = line else {
            return Ok(());
        };

        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{} {e}", style("error:").red());
                continue;
            }
        };
        match shell::execute(app, command, default_host).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => println!("{} {e}", style("error:").red()),
        }
    }
}
