// Main entry point for the lens pipeline server

use lens_pipeline::{
    broker::{declare_topology, AmqpBroker, Broker, InMemoryBroker, StageTopology},
    core::{
        config::{BrokerBackend, BrokerConfig},
        errors::ErrorKind,
        types::Stage,
        Config, PipelineError,
    },
    orchestration::PipelineOrchestrator,
    services::{
        CosmicTextPainter, GlyphPainter, HttpDetector, HttpTranslator, ResultCache,
        TextLayoutRenderer,
    },
    utils::Metrics,
    workers::{DetectionHandler, TranslationHandler, WorkerShell},
};

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<PipelineOrchestrator>,
    metrics: Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::new().context("Failed to load configuration")?;

    // Initialize logging; RUST_LOG wins over LOG_LEVEL
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("lens_pipeline={}", level_name(config.log_level())))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== LENS PIPELINE ===");
    info!(
        "Config: role={:?} broker={:?} budget={:?} cache={}({:?}) ttl={:?} report_failures={}",
        config.role,
        config.broker.backend,
        config.orchestrator.stage_budget(),
        config.cache.capacity,
        config.cache.eviction,
        config.broker.message_ttl,
        config.worker.report_failures
    );

    let metrics = Metrics::new();

    let broker = BrokerHandle::connect(&config.broker).await?;
    let shared = broker.shared();

    // Queue topology; every role declares it, declaration is idempotent
    let topologies = [Stage::Detection, Stage::Translation].map(|stage| {
        StageTopology::for_stage(stage, config.broker.message_ttl)
            .with_dead_letter_limit(config.broker.dead_letter_limit)
    });
    for topology in &topologies {
        declare_topology(shared.as_ref(), topology).await?;
    }
    let [detection_topology, translation_topology] = topologies;

    // Workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let capabilities = &config.capabilities;
    let mut workers = Vec::new();

    if config.role.runs_detection() {
        let detector = Arc::new(HttpDetector::new(
            capabilities.detector_url.clone(),
            capabilities.timeout,
        )?);
        let detection_worker = WorkerShell::new(
            DetectionHandler::new(detector, config.reconstruction.clone()),
            shared.clone(),
            detection_topology,
            ResultCache::new(config.cache.capacity, config.cache.eviction)?,
            config.worker.clone(),
            metrics.clone(),
        );
        workers.push(tokio::spawn(
            detection_worker.run_until(wait_for_shutdown(shutdown_rx.clone())),
        ));
    }

    if config.role.runs_translation() {
        let translator = Arc::new(HttpTranslator::new(
            capabilities.translator_url.clone(),
            capabilities.source_lang.clone(),
            capabilities.target_lang.clone(),
            capabilities.timeout,
        )?);
        let translation_worker = WorkerShell::new(
            TranslationHandler::new(translator),
            shared.clone(),
            translation_topology,
            ResultCache::new(config.cache.capacity, config.cache.eviction)?,
            config.worker.clone(),
            metrics.clone(),
        );
        workers.push(tokio::spawn(
            translation_worker.run_until(wait_for_shutdown(shutdown_rx.clone())),
        ));
    }

    let orchestrator = if config.role.runs_gateway() {
        let orchestrator = serve(&config, shared.clone(), metrics).await?;
        Some(orchestrator)
    } else {
        info!("Worker-only role {:?}, press Ctrl+C to stop", config.role);
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
        None
    };

    // Stop workers, then the broker and the demultiplexers
    let _ = shutdown_tx.send(true);
    for result in futures::future::join_all(workers).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Worker exited with error: {}", e),
            Err(e) => error!("Worker task panicked: {}", e),
        }
    }
    broker.close().await;
    if let Some(orchestrator) = orchestrator {
        orchestrator.shutdown();
    }

    info!("✓ Shutdown complete");
    Ok(())
}

/// Broker chosen by BROKER_BACKEND, kept concrete for shutdown
enum BrokerHandle {
    Amqp(Arc<AmqpBroker>),
    Memory(Arc<InMemoryBroker>),
}

impl BrokerHandle {
    const CONNECT_ATTEMPTS: u32 = 10;

    async fn connect(config: &BrokerConfig) -> Result<Self> {
        match config.backend {
            BrokerBackend::Memory => {
                info!("Using in-process broker");
                Ok(Self::Memory(Arc::new(InMemoryBroker::new())))
            }
            BrokerBackend::Amqp => {
                // RabbitMQ may still be starting next to us
                let mut delay = Duration::from_secs(1);
                let mut attempt = 1;
                loop {
                    match AmqpBroker::connect(config).await {
                        Ok(broker) => return Ok(Self::Amqp(Arc::new(broker))),
                        Err(e) if attempt < Self::CONNECT_ATTEMPTS => {
                            warn!(
                                "RabbitMQ at {}:{} unavailable (attempt {}/{}): {}",
                                config.host,
                                config.port,
                                attempt,
                                Self::CONNECT_ATTEMPTS,
                                e
                            );
                            tokio::time::sleep(delay).await;
                            delay = delay.saturating_mul(2).min(Duration::from_secs(10));
                            attempt += 1;
                        }
                        Err(e) => {
                            return Err(e).context("Failed to connect to RabbitMQ");
                        }
                    }
                }
            }
        }
    }

    fn shared(&self) -> Arc<dyn Broker> {
        match self {
            Self::Amqp(broker) => broker.clone() as Arc<dyn Broker>,
            Self::Memory(broker) => broker.clone() as Arc<dyn Broker>,
        }
    }

    async fn close(&self) {
        match self {
            Self::Amqp(broker) => {
                if let Err(e) = broker.close().await {
                    warn!("Failed to close RabbitMQ connection: {}", e);
                }
            }
            Self::Memory(broker) => broker.close(),
        }
    }
}

/// Run the HTTP gateway until Ctrl+C
async fn serve(
    config: &Config,
    broker: Arc<dyn Broker>,
    metrics: Metrics,
) -> Result<Arc<PipelineOrchestrator>> {
    // Renderer
    let painter: Arc<dyn GlyphPainter> =
        match CosmicTextPainter::from_font_file(&config.rendering.font_path) {
            Ok(painter) => Arc::new(painter),
            Err(e) => {
                warn!("{}, falling back to system fonts", e);
                Arc::new(CosmicTextPainter::with_system_fonts())
            }
        };
    let renderer = TextLayoutRenderer::new(painter, config.rendering.clone());

    let orchestrator = PipelineOrchestrator::start(broker, config, renderer, metrics.clone());
    let state = AppState {
        orchestrator: orchestrator.clone(),
        metrics,
    };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/lens", post(lens))
        .with_state(state)
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024))
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(60));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(60));
    info!("Endpoints:");
    info!("  GET  /        - Root endpoint");
    info!("  GET  /health  - Health check");
    info!("  GET  /metrics - Prometheus metrics");
    info!("  GET  /stats   - Detailed statistics");
    info!("  POST /lens    - Translate an image (multipart field \"file\")");
    info!("{}", "=".repeat(60));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    Ok(orchestrator)
}

fn level_name(level: tracing::Level) -> &'static str {
    match level {
        tracing::Level::TRACE => "trace",
        tracing::Level::DEBUG => "debug",
        tracing::Level::INFO => "info",
        tracing::Level::WARN => "warn",
        tracing::Level::ERROR => "error",
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn root() -> &'static str {
    "Lens Pipeline - detect, translate, re-render"
}

/// Degraded while a stage's result queue cannot be consumed
async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let healthy = state.orchestrator.is_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "in_flight": state.orchestrator.in_flight(),
            "pending_results": state.orchestrator.pending_results(),
        })),
    )
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let snapshot = state.metrics.snapshot();
    serde_json::to_value(snapshot).map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {}", e),
        )
    })
}

/// Translate one image
///
/// # Request Format:
/// - multipart/form-data
/// - Field "file": the image (PNG/JPEG)
///
/// # Response:
/// - The re-rendered image, JPEG unless OUTPUT_FORMAT=png
async fn lens(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, (StatusCode, String)> {
    let mut image = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        if field.name() == Some("file") {
            let data = field
                .bytes()
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, format!("Read error: {}", e)))?;
            image = Some(data.to_vec());
        }
    }

    let image = image.ok_or_else(|| (StatusCode::BAD_REQUEST, "No file provided".to_string()))?;
    info!("Received lens request ({} bytes)", image.len());

    let artifact = state
        .orchestrator
        .submit(image)
        .await
        .map_err(|e| (status_for(&e), e.to_string()))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, artifact.format.content_type())],
        artifact.bytes,
    )
        .into_response())
}

fn status_for(err: &PipelineError) -> StatusCode {
    match err.kind() {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::CorrelationTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::CapabilityFailure | ErrorKind::ContractViolation => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
