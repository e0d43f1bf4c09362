//! # parley-relay
//!
//! Relay binary: loads settings, opens the store and queues, starts the
//! HTTP/WebSocket server and the result-queue bridges, and flushes every
//! session on ctrl-c.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parley_server::bridge::QueueBridge;
use parley_server::config::{BridgeConfig, ManagerConfig, ServerConfig};
use parley_server::manager::{ConnectionManager, DeliveryOutcome};
use parley_server::server::ParleyServer;
use parley_settings::RelaySettings;
use parley_settings::loader::{load_settings_from_path, settings_path};
use parley_store::{
    ConnectionConfig, ConnectionPool, MemoryCache, MemoryCacheConfig, RedrivePolicy, SqliteConversationStore,
    SqliteQueue, SqliteQueueConfig, new_file, run_migrations,
};

/// Parley chat relay.
#[derive(Parser, Debug)]
#[command(name = "parley-relay", about = "Realtime chat relay")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` database (overrides settings).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Settings file (default `~/.parley/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    /// Fold command-line overrides into loaded settings.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(path) = &self.db_path {
            settings.store.database_path.clone_from(path);
        }
    }
}

fn open_database(path: &Path, pool_size: u32) -> Result<ConnectionPool> {
    let config = ConnectionConfig {
        pool_size,
        ..ConnectionConfig::default()
    };
    let pool = new_file(path, &config).with_context(|| format!("Failed to open database {}", path.display()))?;
    let conn = pool.get().context("Failed to get DB connection")?;
    let applied = run_migrations(&conn).context("Failed to run migrations")?;
    tracing::debug!(applied, "migrations applied");
    Ok(pool)
}

fn queue(pool: &ConnectionPool, settings: &RelaySettings, name: &str, redrive: Option<RedrivePolicy>) -> Arc<SqliteQueue> {
    let mut config = SqliteQueueConfig::named(name);
    config.visibility_timeout = settings.queue.visibility_timeout();
    config.redrive = redrive;
    Arc::new(SqliteQueue::new(pool.clone(), config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args.config.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path).context("Failed to load settings")?;
    args.apply(&mut settings);
    parley_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let pool = open_database(&settings.store.database_path, settings.store.pool_size)?;
    let store = Arc::new(SqliteConversationStore::new(pool.clone()));
    let cache = Arc::new(MemoryCache::new(MemoryCacheConfig {
        ttl: settings.cache.ttl(),
        max_entries: settings.cache.max_entries,
    }));

    let queues = &settings.queue;
    let requests = queue(&pool, &settings, &queues.publisher_queue, None);
    let redrive = queues.dead_letter_queue.as_ref().map(|dlq| RedrivePolicy {
        dead_letter_queue: dlq.clone(),
        max_receive_count: queues.max_receive_count,
    });
    let results = queue(&pool, &settings, &queues.result_queue, redrive);
    let dead_letters = queues
        .dead_letter_queue
        .as_ref()
        .map(|dlq| queue(&pool, &settings, dlq, None));

    let manager = Arc::new(ConnectionManager::new(
        store,
        cache,
        requests,
        ManagerConfig::from_settings(&settings),
    ));

    let mut server = ParleyServer::new(ServerConfig::from_settings(&settings), Arc::clone(&manager));
    match parley_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(error) => tracing::warn!(%error, "metrics recorder not installed"),
    }

    let (addr, serve) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("Parley relay listening on http://{addr}");

    let token = server.shutdown().token();
    let bridge_config = BridgeConfig::from_settings(&settings);
    let mut handles = vec![serve];
    handles.push(
        QueueBridge::new(results, Arc::clone(&manager), DeliveryOutcome::Success, bridge_config.clone())
            .spawn(token.clone()),
    );
    if let Some(dead_letters) = dead_letters {
        handles.push(
            QueueBridge::new(dead_letters, Arc::clone(&manager), DeliveryOutcome::Error, bridge_config)
                .spawn(token.clone()),
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().graceful_shutdown(&manager, handles, None).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
