use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use tollgate::pricing::{PricingCache, StoreRateSource};
use tollgate::proxy::UpstreamClient;
use tollgate::store::{SqliteStore, UsageStore};
use tollgate::{AppState, PricingRateRow, ServerConfig, SystemClock};

const USAGE: &str = "usage: tollgate [config.toml] [--listen HOST:PORT] [--sqlite PATH] \
[--default-target URL] [--pricing-seed rates.json] [--json-logs]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    let mut listen: Option<String> = None;
    let mut sqlite_path: Option<PathBuf> = None;
    let mut default_target: Option<String> = None;
    let mut pricing_seed: Option<PathBuf> = None;
    let mut json_logs = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            "--sqlite" => {
                sqlite_path = Some(args.next().ok_or("missing value for --sqlite")?.into());
            }
            "--default-target" => {
                default_target = Some(args.next().ok_or("missing value for --default-target")?);
            }
            "--pricing-seed" => {
                pricing_seed = Some(args.next().ok_or("missing value for --pricing-seed")?.into());
            }
            "--json-logs" => {
                json_logs = true;
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            other if config_path.is_none() && !other.starts_with('-') => {
                config_path = Some(other.into());
            }
            other => {
                return Err(format!("unknown argument: {other}\n{USAGE}").into());
            }
        }
    }

    init_tracing(json_logs)?;

    let mut config = match config_path {
        Some(path) => ServerConfig::load(&path)?,
        None => ServerConfig::default(),
    };
    config.apply_env()?;
    if let Some(listen) = listen {
        config.listen = listen;
    }
    if let Some(path) = sqlite_path {
        config.sqlite_path = path;
    }
    if let Some(target) = default_target {
        config.default_target = Some(target);
    }

    let store = SqliteStore::new(&config.sqlite_path);
    store.init().await?;
    if let Some(path) = pricing_seed {
        let raw = std::fs::read_to_string(&path)?;
        let rows: Vec<PricingRateRow> = serde_json::from_str(&raw)?;
        tracing::info!(rates = rows.len(), path = %path.display(), "seeding pricing rates");
        store.replace_rates(rows).await?;
    }

    let store: Arc<dyn UsageStore> = Arc::new(store);
    let pricing = Arc::new(PricingCache::new(
        Arc::new(StoreRateSource::new(store.clone())),
        config.pricing_ttl_seconds,
        Arc::new(SystemClock),
    ));
    let upstream = UpstreamClient::new(Duration::from_secs(config.upstream_timeout_seconds))?;

    let mut state = AppState::new(store, pricing, upstream)
        .with_max_body_bytes(config.max_body_bytes)
        .with_usage_max_body_bytes(config.usage_max_body_bytes);
    if let Some(target) = &config.default_target {
        state = state.with_default_target(target);
    }

    let app = tollgate::router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!("tollgate listening on {}", config.listen);
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}
