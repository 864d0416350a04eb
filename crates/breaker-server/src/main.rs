//! The `breaker` binary: one hub behind an axum router.
//!
//! Websocket peers connect on the configured path and everything any of them
//! sends is relayed to all of them. Other processes can publish by `POST`ing
//! a body to the broadcast path.
//!
//! Settings come from `breaker.toml` (or the file given as the only
//! argument), then `BREAKER_*` variables, with `__` between nested keys:
//!
//! ```bash
//! breaker /etc/breaker/edge.toml
//! BREAKER_HUB__SLOW_CONSUMER=drop_newest BREAKER_HEARTBEAT__PING_INTERVAL_MS=20000 breaker
//! curl -X POST --data-binary @notice.txt http://127.0.0.1:8080/broadcast
//! ```
//!
//! Log output is controlled by `RUST_LOG`.

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use config::Config;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "breaker=debug";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = match std::env::args_os().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    info!(
        host = %config.host,
        port = config.port,
        max_read_limit = config.hub.max_read_limit,
        slow_consumer = ?config.hub.slow_consumer,
        "Starting breaker"
    );

    metrics::init_metrics();
    handlers::run_server(config).await
}
