use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use bandscore_api::{
    config::Config,
    create_router,
    services::{
        notifier::TracingNotifier, scorer_client::RemoteScorerClient,
        scoring_worker::ScoringWorker, storage::MemoryStorage, AppState, Backends,
    },
    store::MemoryPipelineStore,
};

#[tokio::main]
async fn main() {
    let _tracer = init_telemetry();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bandscore_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer())
        .init();

    tracing::info!("Starting BandScore API");

    let config = Config::load().expect("Failed to load configuration");
    let app_env = std::env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());
    tracing::info!("Configuration loaded for environment: {:?}", app_env);

    let app_state = if app_env == "memory" {
        Arc::new(memory_state(config))
    } else {
        let mongo_client = mongodb::Client::with_uri_str(&config.mongo_uri)
            .await
            .expect("Failed to connect to MongoDB");
        tracing::info!("MongoDB connected");

        let redis_client =
            redis::Client::open(config.redis_uri.clone()).expect("Failed to create Redis client");

        Arc::new(
            AppState::new(config, mongo_client, redis_client)
                .await
                .expect("Failed to initialize application state"),
        )
    };

    let app = create_router(app_state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8081").await.unwrap();

    tracing::info!("Server listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();

    shutdown_telemetry();
}

/// Single-process mode: in-memory store and storage, jobs run on this runtime and an
/// embedded worker sweeps anything left QUEUED.
fn memory_state(config: Config) -> AppState {
    tracing::warn!("Running with in-memory backends, data is lost on restart");

    let scorer = Arc::new(RemoteScorerClient::new(config.scorer.clone()));
    let pipeline = config.pipeline.clone();
    let state = AppState::with_backends(
        config,
        Backends {
            store: Arc::new(MemoryPipelineStore::new()),
            storage: Arc::new(MemoryStorage::new()),
            scorer,
            notifier: Arc::new(TracingNotifier),
            redis: None,
            dispatcher: None,
        },
    );

    let worker = ScoringWorker::new(state.orchestrator.clone(), None, pipeline);
    tokio::spawn(async move {
        if let Err(e) = worker.run().await {
            tracing::error!("Embedded scoring worker stopped: {:#}", e);
        }
    });

    state
}

fn init_telemetry() -> opentelemetry_sdk::trace::Tracer {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use opentelemetry_sdk::Resource;

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4318".to_string());

    tracing::info!(
        "Initializing OpenTelemetry with OTLP endpoint: {}",
        otlp_endpoint
    );

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(otlp_endpoint)
        .build()
        .expect("Failed to create OTLP exporter");

    let resource = Resource::builder_empty()
        .with_service_name("bandscore-api")
        .with_attributes(vec![KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION"),
        )])
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build();

    let tracer = provider.tracer("bandscore-api");

    opentelemetry::global::set_tracer_provider(provider);

    tracer
}

fn shutdown_telemetry() {
    tracing::info!("Shutting down OpenTelemetry");
}
