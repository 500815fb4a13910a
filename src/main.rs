use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use trustgate::cli::AppConfig;
use trustgate::server;

#[derive(Parser)]
#[command(name = "trustgate")]
#[command(about = "trustgate - cached-identity fast login with background trust verification", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults to ~/.trustgate/config.toml)
    /// Also settable via TRUSTGATE_CONFIG env var
    #[arg(short, long, env = "TRUSTGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the login service in the foreground
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
    },
    /// Load the configuration and ping the cache backend
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => AppConfig::default_path()?,
    };
    let mut config = AppConfig::from_file(&config_path)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = cli.log_level.as_deref().unwrap_or(&config.server.log_level);
        EnvFilter::new(level)
    });
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Serve { port, host } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            tracing::info!(
                "Starting trustgate v{} (config: {})",
                env!("CARGO_PKG_VERSION"),
                config_path.display()
            );
            server::start_server(config).await
        }
        Commands::Check => {
            println!("✅ Config OK: {}", config_path.display());
            let cache =
                server::build_cache(&config.cache).context("Failed to build cache backend")?;
            cache
                .ping()
                .await
                .with_context(|| format!("Cache backend ({:?}) unreachable", config.cache.backend))?;
            println!("✅ Cache backend reachable ({:?})", config.cache.backend);
            println!(
                "   Fast login: {}",
                if config.fast_auth.enabled { "enabled" } else { "disabled" }
            );
            Ok(())
        }
    }
}
