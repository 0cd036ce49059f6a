use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ccload_common::CooldownSettings;
use ccload_core::{EngineConfig, ProxyEngine, UpstreamClientConfig, WreqUpstreamClient};
use ccload_storage::{SeaOrmStore, Store};

#[derive(Debug, Parser)]
#[command(
    name = "ccload",
    about = "Load-balancing reverse proxy for multi-vendor LLM chat APIs"
)]
struct Cli {
    #[arg(long, env = "CCLOAD_HOST", default_value = "0.0.0.0")]
    host: String,
    #[arg(long, env = "CCLOAD_PORT", default_value_t = 8787)]
    port: u16,
    /// Database DSN (sqlite, mysql, or postgres).
    #[arg(long, env = "CCLOAD_DSN", default_value = "sqlite://ccload.db?mode=rwc")]
    dsn: String,
    #[arg(long, env = "CCLOAD_REQUEST_TIMEOUT_SEC", default_value_t = 600)]
    request_timeout_sec: u64,
    #[arg(long, env = "CCLOAD_FIRST_BYTE_TIMEOUT_SEC", default_value_t = 30)]
    first_byte_timeout_sec: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cooldowns = CooldownSettings::from_env();

    let store = SeaOrmStore::connect(&cli.dsn, cooldowns).await?;
    store.sync().await?;
    let store: Arc<dyn Store> = Arc::new(store);

    let upstream_config = UpstreamClientConfig {
        first_byte_timeout: Duration::from_secs(cli.first_byte_timeout_sec),
        ..UpstreamClientConfig::default()
    };
    let client = Arc::new(WreqUpstreamClient::new(upstream_config)?);

    let engine_config = EngineConfig {
        request_timeout: Duration::from_secs(cli.request_timeout_sec),
        ..EngineConfig::default()
    };
    let engine = Arc::new(ProxyEngine::new(store, client, engine_config));

    let app = ccload_router::proxy_router(engine);
    let bind = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(bind = %bind, "ccload listening");
    axum::serve(listener, app).await?;
    Ok(())
}
