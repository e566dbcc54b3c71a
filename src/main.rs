use anyhow::Context;
use clap::Parser;
use log::info;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use warden_proxy::{Config, Console, ProxyServer};

#[derive(Parser)]
#[clap(
    version,
    about = "A caching, domain-blocking forward proxy with a live operator console"
)]
struct Args {
    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8002)")]
    listen: Option<SocketAddr>,

    #[clap(long, value_name = "PORT", help = "Operator console WebSocket port")]
    console_port: Option<u16>,

    #[clap(short, long, value_name = "FILE", help = "Blocklist persistence file")]
    blacklist: Option<PathBuf>,

    #[clap(
        short,
        long,
        value_name = "LEVEL",
        help = "Console verbosity (1 = lifecycle events, 3 = include relay payloads)"
    )]
    verbosity: Option<u8>,

    #[clap(long, value_name = "SECONDS", help = "Origin connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Some(config_file) = args.generate_config {
        Config::default()
            .to_file(&config_file)
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            anyhow::bail!("Configuration file not found: {}", config_file);
        }
        Config::from_file(config_file).map_err(|e| anyhow::anyhow!("{}", e))?
    } else {
        create_config_from_args(&args)
    };

    info!("Starting proxy server...");

    let (console, log_rx) = Console::new(
        config.console_port,
        config.blacklist_file.clone(),
        config.console_verbosity,
    );

    let console_handle = tokio::spawn({
        let console = Arc::clone(&console);
        async move {
            if let Err(e) = console.run(log_rx).await {
                eprintln!("Console error: {}", e);
            }
        }
    });

    let proxy = Arc::new(ProxyServer::new(config, Arc::clone(&console)));
    let server_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            eprintln!("Server error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        result = server_handle => {
            result.context("server task failed")?;
        }
        result = console_handle => {
            result.context("console task failed")?;
        }
    }

    console.save();
    info!("Proxy server stopped. Goodbye!");
    Ok(())
}

fn create_config_from_args(args: &Args) -> Config {
    let mut config = Config::default();
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(port) = args.console_port {
        config.console_port = port;
    }
    if let Some(blacklist) = &args.blacklist {
        config.blacklist_file = blacklist.clone();
    }
    if let Some(verbosity) = args.verbosity {
        config.console_verbosity = verbosity;
    }
    if let Some(timeout) = args.connect_timeout {
        config.connect_timeout_secs = Some(timeout);
    }
    config
}
