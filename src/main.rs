use clap::Parser;
use modelgate::config::config_search_paths;
use modelgate::{build_router, AppState, GatewayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "modelgate",
    about = "OpenAI chat/responses and Anthropic messages endpoints over one generation backend",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// JSONL usage log (overrides config)
    #[arg(long)]
    usage_log: Option<PathBuf>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modelgate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(usage_log) = cli.usage_log {
        config.usage_log = Some(usage_log);
    }

    // Validate config eagerly
    let options = config.build_options()?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting modelgate");
    info!("  Backend:   {}", config.backend.as_deref().unwrap_or("(none)"));
    info!("  Models:    {}", config.models.len());
    if let Some(ref path) = config.usage_log {
        info!("  Usage log: {}", path.display());
    }

    let app = build_router(Arc::new(AppState::new(options)));
    let bind_addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
