use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use carelink_core::config::{Config, DatabaseConfig};
use carelink_core::logging;
use carelink_core::models::{TenantId, UserId};
use carelink_realtime::{
    ChannelKey, MemoryReceiptStore, MemoryTransport, PgReceiptStore, PresenceSpec,
    RealtimeClient, ReceiptStore, RedisTransport, SubscriptionConfig, TableWatch, Transport,
    WatchEvent,
};

#[derive(Parser, Debug)]
#[command(name = "carelink")]
#[command(about = "CareLink realtime sync node", long_about = None)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(long, env = "CARELINK_CONFIG_PATH")]
    config: Option<String>,

    /// Channel to follow (defaults to the tenant's patient-monitoring channel)
    #[arg(long)]
    channel: Option<String>,

    /// Table watched on the followed channel
    #[arg(long, default_value = "vitals")]
    table: String,
}

async fn init_database(config: &DatabaseConfig) -> Result<PgPool> {
    info!("Connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
        .connect(&config.url)
        .await
        .context("Database connection failed")?;

    info!("Running database migrations...");
    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .context("Migration failed")?;
    info!("Migrations completed");

    Ok(pool)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        anyhow::bail!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        );
    }

    // 2. Logging
    logging::init_logging(&config.logging)?;
    info!("CareLink realtime node starting...");

    let user_id = UserId::from(config.identity.user_id.as_str());

    // 3. Transport
    let transport: Arc<dyn Transport> = if config.uses_redis() {
        info!("Using Redis transport");
        Arc::new(RedisTransport::new(
            &config.redis.url,
            &config.redis.key_prefix,
            Duration::from_secs(config.redis.operation_timeout_seconds),
            config.realtime.event_buffer,
            user_id.clone(),
        )?)
    } else {
        info!("Redis not configured, using in-process transport");
        Arc::new(MemoryTransport::with_event_buffer(
            user_id.clone(),
            config.realtime.event_buffer,
        ))
    };

    // 4. Receipt store
    let store: Arc<dyn ReceiptStore> = if config.uses_database() {
        Arc::new(PgReceiptStore::new(init_database(&config.database).await?))
    } else {
        warn!("Database not configured, read receipts are kept in memory only");
        Arc::new(MemoryReceiptStore::new())
    };

    // 5. Realtime client
    let client = RealtimeClient::new(user_id, transport, store, &config.realtime);
    let _status_listener = client.on_connection_change(|status| {
        if status.retries_exhausted {
            error!(
                attempts = status.reconnect_attempts,
                "Automatic reconnection stopped; waiting for network change"
            );
        } else {
            info!(state = %status.state, attempts = status.reconnect_attempts, "Connection status changed");
        }
    });

    let key = args.channel.map_or_else(
        || ChannelKey::patient_monitoring(&TenantId::from(config.identity.tenant_id.as_str())),
        ChannelKey::from,
    );
    let subscription = SubscriptionConfig::new()
        .watch_table(TableWatch::new(args.table, WatchEvent::All, |delivery| {
            for event in delivery.events() {
                info!(table = %event.table, kind = %event.event_type, row = %event.row, "Row change");
            }
        }))
        .with_presence(
            PresenceSpec::new(serde_json::json!({ "role": "monitor" }))
                .on_sync(|entries| info!(present = entries.len(), "Presence synced")),
        );
    client
        .subscribe(key.clone(), subscription)
        .await
        .with_context(|| format!("Failed to subscribe to {key}"))?;

    client.start()?;
    info!(channel = %key, "Following channel, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    client.unsubscribe(&key).await;
    client.shutdown().await;
    Ok(())
}
