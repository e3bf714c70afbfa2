use clap::Parser;
use ollama_bridge::config::config_search_paths;
use ollama_bridge::providers::ProviderPreset;
use ollama_bridge::{build_router, AppState, GatewayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "ollama-bridge",
    about = "Ollama-compatible gateway that routes chat traffic to an OpenAI-style provider",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Provider preset name (overrides config)
    #[arg(long)]
    provider: Option<String>,

    /// Record every exchange into this directory
    #[arg(long)]
    record_dir: Option<PathBuf>,

    /// Forward unhandled routes to this base URL
    #[arg(long)]
    proxy_target: Option<String>,

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
                .unwrap_or_else(|_| "ollama_bridge=info,tower_http=info".into()),
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

    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(provider) = cli.provider {
        if ProviderPreset::from_name(&provider).is_none() {
            warn!(%provider, "Unknown provider preset; base_url must be configured");
        }
        config.upstream.provider = provider;
    }
    if let Some(dir) = cli.record_dir {
        config.recording.enabled = true;
        config.recording.dir = dir;
    }
    if let Some(target) = cli.proxy_target {
        config.proxy.enabled = true;
        config.proxy.target = target;
    }

    let endpoint = config.upstream.chat_completions_url()?;
    if let Err(e) = config.upstream.resolve_api_key() {
        // requests will answer 500 until the key is provided
        warn!(error = %e, "Upstream credential unavailable");
    }

    info!("ollama-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("  Provider:   {}", config.upstream.provider);
    info!("  Endpoint:   {}", endpoint);
    info!(
        "  Models:     prefix '{}' → default {}",
        config.upstream.effective_model_prefix(),
        config.upstream.effective_default_model()
    );
    if config.recording.enabled {
        info!("  Recording:  {}", config.recording.dir.display());
    }
    if config.proxy.enabled {
        info!("  Proxy:      {}", config.proxy.target);
    }

    let bind_addr = config.bind_addr();
    let state = Arc::new(AppState::new(config)?);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
