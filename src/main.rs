//! staysync reservation forwarder.
//!
//! Main entry point. Loads configuration, wires storage, the delivery core
//! and the in-process task scheduler, serves HTTP and coordinates graceful
//! shutdown.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use staysync_api::{create_router, shutdown_signal, AppState, Config, WebhookAuthenticator};
use staysync_core::{
    storage::{schema, Storage},
    Clock, RealClock,
};
use staysync_delivery::{
    circuit::CircuitBreakerManager,
    client::HttpTransport,
    dedup::DedupStore,
    dispatcher::Dispatcher,
    integration::{Integration, JsonIntegration},
    pipeline::Pipeline,
    poller::AdaptivePoller,
    rate_limit::RateLimiter,
    retry::RetryQueue,
    source::HttpReservationSource,
    storage::{memory::MemoryStorage, PostgresStorage, ReliabilityStorage},
    tasks::{ScheduledTask, TokioTaskScheduler},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log);

    info!("Starting staysync reservation forwarder");
    info!(
        database_url = ?config.database_url_masked(),
        host = %config.host,
        port = config.port,
        integrations = config.integrations.len(),
        signed_webhooks = config.webhook_signing_secret.is_some(),
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let (storage, pool): (Arc<dyn ReliabilityStorage>, Option<sqlx::PgPool>) = match &config.database_url {
        Some(url) => {
            let pool = create_database_pool(&config, url).await?;
            info!("Database connection pool established");
            schema::apply(&pool).await.context("Failed to apply database schema")?;
            info!("Database schema ready");
            (Arc::new(PostgresStorage::new(Arc::new(Storage::new(pool.clone())))), Some(pool))
        },
        None => {
            warn!("DATABASE_URL not set, using in-memory storage; state is lost on restart");
            (Arc::new(MemoryStorage::new()), None)
        },
    };

    let transport = Arc::new(HttpTransport::new(config.to_client_config())?);
    let source = Arc::new(HttpReservationSource::new(config.to_upstream_config(), transport.clone()));

    let integration_configs = config.to_integration_configs();
    let rate_limits: HashMap<_, _> = integration_configs
        .iter()
        .filter_map(|c| c.rate_limit.map(|limit| (c.name.clone(), limit)))
        .collect();
    let integrations: Vec<Arc<dyn Integration>> = integration_configs
        .into_iter()
        .map(|c| Arc::new(JsonIntegration::new(c)) as Arc<dyn Integration>)
        .collect();

    let circuit = CircuitBreakerManager::new(config.to_circuit_config(), storage.clone(), clock.clone());
    let dedup = DedupStore::new(storage.clone(), clock.clone())
        .with_identifier_fields(config.identifier_fields.clone());
    let dispatcher = Dispatcher::new(
        integrations,
        circuit.clone(),
        RateLimiter::new(storage.clone(), clock.clone()),
        transport.clone(),
        config.to_retry_policy(),
        clock.clone(),
    );
    let retry_queue = RetryQueue::new(
        config.to_retry_queue_config(),
        storage.clone(),
        circuit,
        transport,
        clock.clone(),
    )
    .with_rate_limits(rate_limits);
    let pipeline = Pipeline::standard(dedup, dispatcher, retry_queue.clone(), clock.clone());

    let (scheduler, due_tasks) = TokioTaskScheduler::new(16);
    let poller = Arc::new(AdaptivePoller::new(
        config.to_poller_config(),
        storage.clone(),
        source,
        pipeline,
        retry_queue,
        Arc::new(scheduler.clone()),
        clock.clone(),
    ));

    let (registered, failed) = poller.register_tasks().await;
    info!(?registered, ?failed, "Recurring tasks registered");

    let cancel = CancellationToken::new();
    let task_loop = tokio::spawn(run_task_loop(poller.clone(), due_tasks, cancel.clone()));

    let state = AppState {
        poller,
        storage: storage.clone(),
        authenticator: WebhookAuthenticator::new(config.to_auth_config(), storage, clock.clone()),
        admin_token: config.admin_token.clone(),
        clock,
    };
    let app = create_router(state, Duration::from_secs(config.request_timeout));
    let addr = config.parse_server_addr()?;

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let signal_cancel = server_cancel.clone();
        let shutdown = async move {
            tokio::select! {
                () = shutdown_signal() => {},
                () = signal_cancel.cancelled() => {},
            }
            signal_cancel.cancel();
        };
        if let Err(e) = staysync_api::start_server(app, addr, shutdown).await {
            error!(error = %e, "Server failed");
        }
        server_cancel.cancel();
    });

    info!(%addr, "staysync is ready to receive reservations");

    cancel.cancelled().await;
    info!("Shutdown signal received, starting graceful shutdown");

    scheduler.shutdown().await;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(30)) => {
            warn!("Shutdown grace period expired");
        }
        _ = async { let _ = tokio::join!(server, task_loop); } => {
            info!("Server and task loop stopped");
        }
    }

    if let Some(pool) = pool {
        pool.close().await;
        info!("Database connections closed");
    }

    info!("staysync shutdown complete");
    Ok(())
}

/// Runs due tasks one at a time until cancelled.
///
/// A task that fails is logged and left to its next tick; the health check
/// task restores timers that stop firing.
async fn run_task_loop(
    poller: Arc<AdaptivePoller>,
    mut due_tasks: mpsc::Receiver<ScheduledTask>,
    cancel: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            () = cancel.cancelled() => break,
            task = due_tasks.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        match poller.run_task(task).await {
            Ok(outcome) => tracing::debug!(task = task.key(), ?outcome, "Task completed"),
            Err(e) => error!(task = task.key(), error = %e, category = ?e.category(), "Task failed"),
        }
    }

    info!("Task loop stopped");
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info,staysync=debug,tower_http=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config, url: &str) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
