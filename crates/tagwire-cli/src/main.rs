use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tagwire_core::config::{GatewayConfig, TagwireConfig};
use tagwire_gateway::GatewayState;

mod demo;

#[derive(Parser)]
#[command(
    name = "tagwire",
    about = "Server-driven UI gateway: live pages pushed over WebSockets",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo page through the gateway
    Serve {
        /// Port to listen on (default: 8080)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 127.0.0.1)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Ask a running gateway for its health
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Print the config file path
    Path,
}

fn init_logging(config: &TagwireConfig, verbose: bool) {
    let logging = config.logging.clone().unwrap_or_default();
    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".into())
    };
    let mut directives = vec![level];
    directives.extend(logging.filters.iter().cloned());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directives.join(",")));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(TagwireConfig::default_path);
    let mut config = TagwireConfig::load(&config_path)?;

    // Initialize logging
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Serve { port, bind } => {
            if port.is_some() || bind.is_some() {
                let default_port = config.gateway_port();
                let gateway = config.gateway.get_or_insert_with(|| GatewayConfig {
                    port: default_port,
                    bind: None,
                    request_timeout_secs: None,
                    queue_capacity: None,
                });
                if let Some(port) = port {
                    gateway.port = port;
                }
                if bind.is_some() {
                    gateway.bind = bind;
                }
            }
            tracing::info!(
                "Starting tagwire on {}:{}",
                config.bind_addr(),
                config.gateway_port()
            );

            let state = Arc::new(GatewayState::new(config));
            let app = demo::router(state.clone());
            #[cfg(feature = "prometheus")]
            let app = app.merge(metrics_router()?);

            tokio::spawn(demo::run_clock(state.hub.clone()));
            tagwire_gateway::start_gateway(state, app).await?;
        }
        Commands::Status => {
            println!("tagwire v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            let url = format!(
                "http://{}:{}/health",
                config.bind_addr(),
                config.gateway_port()
            );
            match reqwest::get(&url).await {
                Ok(resp) => {
                    let body: serde_json::Value = resp.json().await?;
                    println!("{}", serde_json::to_string_pretty(&body)?);
                }
                Err(err) => {
                    tracing::debug!(error = %err, "health request failed");
                    println!("Status: not running");
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Path => println!("{}", config_path.display()),
        },
    }

    Ok(())
}

#[cfg(feature = "prometheus")]
fn metrics_router() -> anyhow::Result<axum::Router> {
    let handle = tagwire_gateway::metrics::install_prometheus_recorder()?;
    Ok(axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    ))
}
