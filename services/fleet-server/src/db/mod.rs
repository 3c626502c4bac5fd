//! Storage layer for fleetd.
//!
//! This module provides:
//! - The shared key-value store (memory or Postgres backed)
//! - Typed stores over it: durable queue, fleet cache, lifecycle actions,
//!   bootstrap secrets, instance builds, autoscaling build progress
//! - Connection management and migrations for the Postgres backend

mod asg_progress;
mod bootstrap;
mod builds;
mod error;
mod fleet_cache;
mod instance_progress;
pub mod kv;
mod lifecycle;
mod queue;

pub use asg_progress::{AsgBuildStep, AsgProgressStore};
pub use bootstrap::{generate_secret, BootstrapStore};
pub use builds::{BuildStore, BuildUpdate};
pub use error::StoreError;
pub use fleet_cache::{FleetCache, Filter};
pub use instance_progress::{InstanceBuildProgress, InstanceProgressStore};
pub use kv::{KvOp, KvStore, MemoryStore, PgStore};
pub use lifecycle::LifecycleStore;
pub use queue::{queue_key, retry_key, QueueStore, DEFAULT_MAX_RETRIES};

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Default TTL for fleet cache snapshots and bootstrap secrets.
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// `memory://` or a `postgres://` connection URL.
    pub url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,

    /// Expiry for fleet cache snapshots and bootstrap secrets.
    pub default_ttl: Duration,

    /// Redeliveries allowed before a failing job is dropped.
    pub max_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "memory://".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            default_ttl: DEFAULT_TTL,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Handle to the shared store and the typed views over it.
#[derive(Clone)]
pub struct Database {
    kv: Arc<dyn KvStore>,
    pool: Option<PgPool>,
    default_ttl: Duration,
    max_retries: u32,
}

impl Database {
    /// Connects to the backend named by `config.url`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        if config.url.starts_with("memory://") {
            info!("Using in-memory store");
            return Ok(Self::with_kv(Arc::new(MemoryStore::new()), config));
        }

        if !(config.url.starts_with("postgres://") || config.url.starts_with("postgresql://")) {
            return Err(StoreError::UnsupportedUrl(config.url.clone()));
        }

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.url)
            .await
            .map_err(StoreError::Connect)?;

        info!("Database connection pool established");

        Ok(Self {
            kv: Arc::new(PgStore::new(pool.clone())),
            pool: Some(pool),
            default_ttl: config.default_ttl,
            max_retries: config.max_retries,
        })
    }

    /// In-memory store with default settings.
    pub fn in_memory() -> Self {
        Self::with_kv(Arc::new(MemoryStore::new()), &StoreConfig::default())
    }

    /// Wraps an existing key-value store.
    pub fn with_kv(kv: Arc<dyn KvStore>, config: &StoreConfig) -> Self {
        Self {
            kv,
            pool: None,
            default_ttl: config.default_ttl,
            max_retries: config.max_retries,
        }
    }

    /// The raw key-value store.
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Check if the store is reachable.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.kv.ping().await
    }

    /// Run pending migrations. A no-op for the in-memory backend.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };

        info!("Running database migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/fleet-server/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator.run(pool).await.map_err(StoreError::Migration)?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(StoreError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Get a durable queue handle.
    pub fn queue(&self) -> QueueStore {
        QueueStore::new(self.kv.clone(), self.max_retries)
    }

    /// Get a fleet cache handle.
    pub fn fleet_cache(&self) -> FleetCache {
        FleetCache::new(self.kv.clone())
    }

    /// Get a lifecycle action store handle.
    pub fn lifecycle_actions(&self) -> LifecycleStore {
        LifecycleStore::new(self.kv.clone())
    }

    /// Get a bootstrap secret store handle.
    pub fn bootstrap(&self) -> BootstrapStore {
        BootstrapStore::new(self.kv.clone(), self.default_ttl)
    }

    /// Get an instance build store handle.
    pub fn builds(&self) -> BuildStore {
        BuildStore::new(self.kv.clone())
    }

    /// Get an instance build progress handle.
    pub fn instance_progress(&self) -> InstanceProgressStore {
        InstanceProgressStore::new(self.kv.clone())
    }

    /// Get an autoscaling build progress handle.
    pub fn asg_progress(&self) -> AsgProgressStore {
        AsgProgressStore::new(self.kv.clone())
    }

    /// Configured snapshot TTL.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.url, "memory://");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.default_ttl, Duration::from_secs(600));
        assert_eq!(config.max_retries, 25);
    }

    #[tokio::test]
    async fn test_connect_memory() {
        let db = Database::connect(&StoreConfig::default()).await.unwrap();
        db.health_check().await.unwrap();
        db.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let config = StoreConfig {
            url: "redis://localhost".to_string(),
            ..Default::default()
        };
        let err = Database::connect(&config).await.err().unwrap();
        assert!(matches!(err, StoreError::UnsupportedUrl(_)));
    }
}
