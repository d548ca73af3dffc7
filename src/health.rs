//! Health check module
//! Reports liveness plus the state of the database and configured gateways

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info};

use crate::database::{self, error::DatabaseError};
use crate::payments::factory::PaymentProviderFactory;
use crate::payments::types::ProviderName;
use crate::services::settings::SettingsSnapshot;

const DB_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status != HealthState::Unhealthy
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms: None,
            details,
        }
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    db_pool: Option<sqlx::PgPool>,
    factory: Arc<PaymentProviderFactory>,
}

impl HealthChecker {
    pub fn new(db_pool: Option<sqlx::PgPool>, factory: Arc<PaymentProviderFactory>) -> Self {
        Self { db_pool, factory }
    }

    /// Database failures make the service unhealthy. A gateway without
    /// credentials only degrades it.
    pub async fn check_health(&self, snapshot: &SettingsSnapshot) -> HealthStatus {
        let mut health_status = HealthStatus::new();

        match &self.db_pool {
            Some(pool) => match timeout(DB_CHECK_TIMEOUT, check_database_health(pool)).await {
                Ok(Ok(response_time)) => {
                    health_status.checks.insert(
                        "database".to_string(),
                        ComponentHealth::up(Some(response_time)),
                    );
                    info!("Database health check: OK ({}ms)", response_time);
                }
                Ok(Err(e)) => {
                    health_status.status = HealthState::Unhealthy;
                    health_status.checks.insert(
                        "database".to_string(),
                        ComponentHealth::down(Some(e.to_string())),
                    );
                    error!("Database health check failed: {}", e);
                }
                Err(_) => {
                    health_status.status = HealthState::Unhealthy;
                    health_status.checks.insert(
                        "database".to_string(),
                        ComponentHealth::down(Some("Timeout".to_string())),
                    );
                    error!("Database health check timed out");
                }
            },
            None => {
                health_status.checks.insert(
                    "database".to_string(),
                    ComponentHealth::warning(Some("in-memory store".to_string())),
                );
            }
        }

        for provider in ProviderName::ALL {
            let configured = self.factory.webhook_provider(provider, snapshot).is_ok();
            let enabled = snapshot.payment_methods_enabled.is_enabled(provider);
            let component = if !enabled {
                ComponentHealth::warning(Some("disabled".to_string()))
            } else if configured {
                ComponentHealth::up(None)
            } else {
                if health_status.status == HealthState::Healthy {
                    health_status.status = HealthState::Degraded;
                }
                ComponentHealth::warning(Some("credentials missing".to_string()))
            };
            health_status
                .checks
                .insert(format!("gateway:{}", provider.as_str()), component);
        }

        health_status
    }
}

async fn check_database_health(pool: &sqlx::PgPool) -> Result<u128, DatabaseError> {
    let start = Instant::now();
    database::health_check(pool).await?;
    Ok(start.elapsed().as_millis())
}
