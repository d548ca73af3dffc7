pub mod error;
pub mod memory;
pub mod package_repository;
pub mod settings_repository;
pub mod task_repository;
pub mod transaction_repository;
pub mod user_repository;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error as log_error, info, warn};

use self::error::DatabaseError;
use self::memory::InMemoryStore;
use self::package_repository::{PackageRepository, PackageStore};
use self::settings_repository::{SettingsRepository, SettingsStore};
use self::task_repository::{TaskRepository, TaskStore};
use self::transaction_repository::{LedgerStore, TransactionRepository};
use self::user_repository::{UserRepository, UserStore};
use crate::config::DatabaseConfig;

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 2,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// Initialize the database connection pool
pub async fn init_pool(
    database_url: &str,
    config: Option<PoolConfig>,
) -> Result<PgPool, DatabaseError> {
    let config = config.unwrap_or_default();

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        connection_timeout = ?config.connection_timeout,
        "Initializing database pool"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connection_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect(database_url)
        .await
        .map_err(|e| {
            log_error!("Failed to initialize database pool: {}", e);
            DatabaseError::from_sqlx(e)
        })?;

    pool.acquire().await.map_err(|e| {
        log_error!("Failed to acquire test connection: {}", e);
        DatabaseError::from_sqlx(e)
    })?;

    info!("Database pool initialized successfully");
    Ok(pool)
}

/// Connection pool health check
pub async fn health_check(pool: &PgPool) -> Result<(), DatabaseError> {
    sqlx::query("SELECT 1").fetch_one(pool).await.map_err(|e| {
        warn!("Health check failed: {}", e);
        DatabaseError::from_sqlx(e)
    })?;

    Ok(())
}

/// Initialize the database pool from application configuration
pub async fn init_pool_from_config(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
    let pool_config = PoolConfig {
        max_connections: config.max_connections,
        min_connections: config.min_connections,
        connection_timeout: Duration::from_secs(config.connection_timeout),
        idle_timeout: Duration::from_secs(config.idle_timeout.unwrap_or(600)),
        max_lifetime: Duration::from_secs(1800),
    };

    init_pool(&config.url, Some(pool_config)).await
}

/// Store handles shared by every service. Postgres and in-memory backends are
/// interchangeable behind the traits.
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn LedgerStore>,
    pub users: Arc<dyn UserStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub packages: Arc<dyn PackageStore>,
    pub settings: Arc<dyn SettingsStore>,
    /// Present only for the Postgres backend
    pub pool: Option<PgPool>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            ledger: Arc::new(TransactionRepository::new(pool.clone())),
            users: Arc::new(UserRepository::new(pool.clone())),
            tasks: Arc::new(TaskRepository::new(pool.clone())),
            packages: Arc::new(PackageRepository::new(pool.clone())),
            settings: Arc::new(SettingsRepository::new(pool.clone())),
            pool: Some(pool),
        }
    }

    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            ledger: store.clone(),
            users: store.clone(),
            tasks: store.clone(),
            packages: store.clone(),
            settings: store,
            pool: None,
        }
    }
}
