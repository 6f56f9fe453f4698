//! Live metrics dashboard client.
//!
//! Connects to a metrics feed, logs every `metrics_update`, subscribes once the channel is
//! open and keeps reconnecting with backoff until interrupted with Ctrl-C.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info,live_channel=debug cargo run --example live_metrics --features tracing -- ws://localhost:8080/live
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use live_channel::config::{Config, HeartbeatConfig, RetryPolicy};
use live_channel::connection::{ConnectionManager, ConnectionState, ErrorInfo, Handlers};
use live_channel::message::{InboundMessage, MessageKind};
use live_channel::transport::WsTransport;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct Metrics {
    active_users: u64,
    #[serde(default)]
    posts_per_minute: f64,
}

struct Dashboard {
    manager: Weak<ConnectionManager<WsTransport>>,
}

impl Handlers for Dashboard {
    fn on_state_change(&self, state: ConnectionState) {
        info!(%state, "Channel state changed");

        if state.is_open()
            && let Some(manager) = self.manager.upgrade()
            && let Err(e) = manager.send(&json!({ "type": "subscribe", "channel": "metrics" }))
        {
            warn!(error = %e, "Failed to subscribe");
        }
    }

    fn on_message(&self, message: InboundMessage) {
        match message.kind {
            MessageKind::MetricsUpdate => match message.payload_as::<Metrics>() {
                Some(metrics) => info!(
                    active_users = metrics.active_users,
                    posts_per_minute = metrics.posts_per_minute,
                    received_at = %message.received_at,
                    "Metrics update"
                ),
                None => warn!(payload = %message.payload, "Malformed metrics update"),
            },
            MessageKind::Ping | MessageKind::Pong => {}
            other => info!(kind = %other, payload = %message.payload, "Other message"),
        }
    }

    fn on_error(&self, error: &ErrorInfo) {
        warn!(%error, terminal = error.reason.is_terminal(), "Channel error");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:8080/live".to_owned());

    let mut config = Config::default();
    config.heartbeat = Some(HeartbeatConfig::new(
        Duration::from_secs(10),
        Duration::from_secs(20),
    ));

    let policy = RetryPolicy::builder()
        .base_delay(Duration::from_millis(500))
        .max_delay(Duration::from_secs(30))
        .jitter_ratio(0.3)
        .build();

    let manager = Arc::new(ConnectionManager::websocket(config));
    let dashboard = Dashboard {
        manager: Arc::downgrade(&manager),
    };

    let generation = manager.open(&endpoint, policy, dashboard)?;
    info!(%endpoint, generation, "Channel opened");

    tokio::signal::ctrl_c().await?;
    manager.close();
    info!(state = %manager.state(), "Shut down");

    Ok(())
}
