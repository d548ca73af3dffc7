use earnify_backend::api::{self, AppState};
use earnify_backend::config::AppConfig;
use earnify_backend::database::memory::InMemoryStore;
use earnify_backend::database::{init_pool_from_config, Stores};
use earnify_backend::logging::init_tracing;
use earnify_backend::payments::factory::PaymentProviderFactory;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        skip_externals = config.skip_externals,
        "Starting Earnify backend service"
    );

    let stores = match &config.database {
        Some(db_config) => {
            info!("Initializing database connection pool");
            let pool = init_pool_from_config(db_config).await.map_err(|e| {
                error!("Failed to initialize database pool: {}", e);
                e
            })?;

            if db_config.run_migrations {
                info!("Running database migrations");
                sqlx::migrate!("./migrations").run(&pool).await?;
            }

            info!(
                max_connections = pool.options().get_max_connections(),
                "Database connection pool initialized"
            );
            Stores::postgres(pool)
        }
        None => {
            warn!("SKIP_EXTERNALS=true, using the in-memory store; data is not persisted");
            Stores::in_memory(Arc::new(InMemoryStore::new()))
        }
    };

    let factory = Arc::new(PaymentProviderFactory::new(config.payments.clone())?);
    let state = AppState::build(stores, factory).await?;

    let snapshot = state.settings.snapshot().await;
    info!(
        app_name = %snapshot.app.app_name,
        currency = %snapshot.app.currency_symbol,
        "Settings snapshot ready"
    );

    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}
