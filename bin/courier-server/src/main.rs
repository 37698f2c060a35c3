//! Courier Server
//!
//! Runs the dispatch gateway, one consumer group per channel queue, the
//! deferred scheduler and the operational HTTP endpoints in one process.
//!
//! ## Endpoints
//!
//! | Path | Description |
//! |------|-------------|
//! | `/q/health` | Broker and scheduler health |
//! | `/q/health/live` | Liveness |
//! | `/q/health/ready` | Readiness (broker reachable) |
//! | `/q/status` | Queue depths, scheduled count, pending publishes |
//! | `/q/report` | Delivery status report with health, status and alerts |
//! | `/metrics` | Prometheus exposition of the `courier.*` counters and gauges |
//!
//! Configuration comes from `courier.toml` (or `COURIER_CONFIG`) with
//! `COURIER_*` environment overrides.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use courier_broker::amqp::{AmqpBroker, AmqpConfig};
use courier_broker::{Broker, BrokerPublisher, EnvelopeRouter, InMemoryBroker, Topology};
use courier_common::ChannelType;
use courier_config::{AppConfig, BrokerKind, ConfigLoader, LedgerBackend};
use courier_dispatch::{
    ChannelSender, ConsumerGroup, ConsumerSettings, DeadLetterFailureHook, DeliveryProcessor, DispatchGateway,
    FailureHook, GatewayConfig, LogFailureHook, LoggingSender, WorkerPool,
};
use courier_ledger::{InMemoryStatusLedger, SqliteStatusLedger, StatusLedgerRepository, StatusLedgerService};
use courier_scheduler::{DeferredScheduler, DeferredSchedulerConfig, InMemoryDeferredStore};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use serde_json::json;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

// ============================================================================
// Wiring
// ============================================================================

/// Broker as seen by the consumers and by the publishing side
struct BrokerHandles {
    broker: Arc<dyn Broker>,
    publisher: Arc<dyn BrokerPublisher>,
    amqp: Option<Arc<AmqpBroker>>,
}

async fn create_broker(config: &AppConfig, topology: &Topology) -> Result<BrokerHandles> {
    match config.broker.kind {
        BrokerKind::Memory => {
            let broker = Arc::new(InMemoryBroker::new());
            broker.declare_topology(topology).await?;
            info!("Using in-memory broker");
            Ok(BrokerHandles {
                broker: broker.clone(),
                publisher: broker,
                amqp: None,
            })
        }
        BrokerKind::Amqp => {
            let broker = Arc::new(
                AmqpBroker::connect(AmqpConfig {
                    uri: config.broker.uri.clone(),
                    connection_name: config.broker.connection_name.clone(),
                    prefetch_count: config.broker.prefetch_count,
                })
                .await?,
            );
            broker.declare_topology(topology).await?;
            info!(connection = %config.broker.connection_name, "Using AMQP broker");
            Ok(BrokerHandles {
                broker: broker.clone(),
                publisher: broker.clone(),
                amqp: Some(broker),
            })
        }
    }
}

async fn create_ledger(config: &AppConfig) -> Result<Arc<dyn StatusLedgerRepository>> {
    match config.ledger.backend {
        LedgerBackend::Memory => {
            info!("Using in-memory status ledger");
            Ok(Arc::new(InMemoryStatusLedger::new()))
        }
        LedgerBackend::Sqlite => {
            let ledger = SqliteStatusLedger::connect(&config.ledger.sqlite_url).await?;
            ledger.init_schema().await?;
            info!(url = %config.ledger.sqlite_url, "Using SQLite status ledger");
            Ok(Arc::new(ledger))
        }
    }
}

async fn start_consumers(
    config: &AppConfig,
    broker: &dyn Broker,
    router: &EnvelopeRouter,
    ledger: &StatusLedgerService,
) -> Result<ConsumerGroup> {
    let settings = ConsumerSettings {
        workers_per_queue: config.consumer.workers_per_queue,
        batch_size: config.consumer.batch_size,
        poll_interval: config.consumer.poll_interval(),
    };
    let group = ConsumerGroup::new();

    for channel in ChannelType::ALL {
        let hook: Arc<dyn FailureHook> = if config.consumer.dead_letter_failures {
            Arc::new(DeadLetterFailureHook::new(router.clone()))
        } else {
            Arc::new(LogFailureHook)
        };
        let sender: Arc<dyn ChannelSender> = Arc::new(LoggingSender::new(channel));
        let processor = Arc::new(DeliveryProcessor::new(sender, ledger.clone(), hook));
        let queue = &router.topology().route(channel).queue;

        group.spawn(broker, queue, processor, &settings).await?;
        info!(queue = %queue, workers = settings.workers_per_queue, "Channel consumers started");
    }

    Ok(group)
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Clone)]
struct AppState {
    gateway: DispatchGateway,
    ledger: StatusLedgerService,
    scheduler: DeferredScheduler,
    publisher: Arc<dyn BrokerPublisher>,
    scheduler_enabled: bool,
    metrics: Option<PrometheusHandle>,
}

struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "Request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    broker_healthy: bool,
    scheduler_running: bool,
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let broker_healthy = state.publisher.is_healthy();
    let scheduler_running = state.scheduler.is_running().await;
    let up = broker_healthy && (scheduler_running || !state.scheduler_enabled);

    let code = if up { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        code,
        Json(HealthResponse {
            status: if up { "UP" } else { "DOWN" },
            broker_healthy,
            scheduler_running,
        }),
    )
}

async fn ready_handler(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    if state.publisher.is_healthy() {
        (StatusCode::OK, Json(json!({ "status": "UP" })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "DOWN" })))
    }
}

async fn status_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.gateway.get_queue_status().await?;
    Ok(Json(serde_json::to_value(status)?))
}

async fn report_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let report = state.ledger.report(Utc::now()).await?;
    Ok(Json(json!({
        "report": report,
        "health": report.health(),
        "status": report.status(),
        "healthy": report.is_healthy(),
        "alerts": report.alerts(),
    })))
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.as_ref().map(PrometheusHandle::render).unwrap_or_default()
}

fn http_routes(state: AppState) -> Router {
    Router::new()
        .route("/q/health", get(health_handler))
        .route("/q/health/live", get(|| async { Json(json!({ "status": "UP" })) }))
        .route("/q/health/ready", get(ready_handler))
        .route("/q/status", get(status_handler))
        .route("/q/report", get(report_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    courier_common::logging::init_logging("courier-server");

    info!("Starting Courier server");

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Metrics recorder not installed, /metrics will be empty");
            None
        }
    };

    let config = ConfigLoader::new().load()?;
    info!(
        broker = ?config.broker.kind,
        ledger = ?config.ledger.backend,
        scheduler_enabled = config.scheduler.enabled,
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );

    let topology = Arc::new(Topology::standard());
    let handles = create_broker(&config, &topology).await?;
    let router = EnvelopeRouter::new(handles.publisher.clone(), topology.clone());
    let ledger = StatusLedgerService::new(create_ledger(&config).await?);

    let scheduler = DeferredScheduler::new(
        DeferredSchedulerConfig {
            enabled: config.scheduler.enabled,
            sweep_interval: config.scheduler.sweep_interval(),
            expiry_interval: config.scheduler.expiry_interval(),
            stale_after: config.scheduler.stale_after(),
            max_promotion_attempts: config.scheduler.max_promotion_attempts,
        },
        Arc::new(InMemoryDeferredStore::new()),
        router.clone(),
        ledger.clone(),
    );
    scheduler.start().await;

    let pool = Arc::new(WorkerPool::new(config.dispatch.workers, config.dispatch.queue_capacity));
    let gateway = DispatchGateway::new(
        GatewayConfig {
            default_owner: config.dispatch.default_owner.clone(),
            default_sms_sender: config.dispatch.default_sms_sender.clone(),
            broker_horizon: config.scheduler.broker_horizon(),
        },
        handles.broker.clone(),
        router.clone(),
        ledger.clone(),
        scheduler.clone(),
        pool.clone(),
    );

    let consumers = start_consumers(&config, handles.broker.as_ref(), &router, &ledger).await?;

    let state = AppState {
        gateway,
        ledger,
        scheduler: scheduler.clone(),
        publisher: handles.publisher.clone(),
        scheduler_enabled: config.scheduler.enabled,
        metrics,
    };

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(?addr, "HTTP server starting");

    axum::serve(listener, http_routes(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown signal received, draining");
    let drain = async {
        scheduler.stop().await;
        consumers.stop().await;
        pool.shutdown().await;
        if let Some(amqp) = &handles.amqp {
            amqp.close().await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        error!("Shutdown timed out");
    }

    info!("Courier server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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
}
