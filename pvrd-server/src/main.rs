//! pvrd: PVR streaming backend for set-top clients.
//!
//! Clients connect over TCP and access live channels, recordings,
//! timers and the program guide remotely.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use log::{error, info};

mod backend;
mod logging;
mod server;

use backend::memory::{self, CatalogFile};
use server::{Server, ServerConfig};

/// pvrd - PVR streaming backend
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:34892")]
    listen: SocketAddr,

    /// Server name reported to clients
    #[arg(short, long, default_value = "pvrd")]
    server_name: String,

    /// Base URL for channel logos
    #[arg(long, default_value = "")]
    picons_url: String,

    /// Tuner acquisition timeout in seconds
    #[arg(long, default_value = "3")]
    stream_timeout: u32,

    /// Path to the channel/recording catalog file
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Enable the channel scanner interface
    #[arg(long)]
    enable_scanner: bool,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    logging: LoggingSection,
    #[serde(default)]
    catalog: CatalogSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ServerSection {
    listen: Option<String>,
    server_name: Option<String>,
    picons_url: Option<String>,
    stream_timeout: Option<u32>,
    enable_scanner: Option<bool>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct CatalogSection {
    path: Option<String>,
}

fn load_config(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("pvrd.toml");
        if default_path.exists() {
            Some(default_path)
        } else {
            None
        }
    });
    let file_config = if let Some(config_path) = &config_path {
        match load_config(config_path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", config_path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        }
    } else {
        ConfigFile::default()
    };

    // Merge logging settings (command line takes precedence)
    let log_dir = if args.log_dir.to_string_lossy() != "logs" {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let log_retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };

    logging::init_logging(&log_dir, log_retention_days, args.verbose)
        .expect("Failed to initialize logging");

    let listen_addr = file_config
        .server
        .listen
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(args.listen);
    let server_name = file_config.server.server_name.unwrap_or(args.server_name);
    let picons_url = file_config.server.picons_url.unwrap_or(args.picons_url);
    let stream_timeout_secs = file_config
        .server
        .stream_timeout
        .unwrap_or(args.stream_timeout);
    let enable_scanner = file_config
        .server
        .enable_scanner
        .unwrap_or(args.enable_scanner);

    // Load the channel/recording catalog
    let catalog_path = file_config
        .catalog
        .path
        .map(PathBuf::from)
        .or(args.catalog);
    let catalog = match &catalog_path {
        Some(path) => {
            info!("Loading catalog: {:?}", path);
            match CatalogFile::load(path) {
                Ok(c) => Some(c),
                Err(e) => {
                    error!("Failed to load catalog: {}", e);
                    return Err(e.into());
                }
            }
        }
        None => None,
    };

    let backend = memory::build(catalog, enable_scanner);

    let config = ServerConfig {
        listen_addr,
        server_name,
        picons_url,
        stream_timeout_secs,
    };

    info!("pvrd starting...");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Server name: {}", config.server_name);
    if !config.picons_url.is_empty() {
        info!("  Channel logos: {}", config.picons_url);
    }
    info!("  Scanner interface: {}", enable_scanner);

    let server = Server::new(config, backend);

    // Ctrl-C drains every session before the listener stops
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = shutdown.send(());
        }
    });

    server.run().await?;

    Ok(())
}
