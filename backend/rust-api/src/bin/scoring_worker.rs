use tracing_subscriber::fmt::init;

use bandscore_api::{
    config::Config,
    services::{scoring_worker::ScoringWorker, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();

    let config = Config::load().expect("Failed to load configuration");
    let pipeline = config.pipeline.clone();

    let mongo_client = mongodb::Client::with_uri_str(&config.mongo_uri)
        .await
        .expect("Failed to connect to MongoDB");

    let redis_client =
        redis::Client::open(config.redis_uri.clone()).expect("Failed to create Redis client");

    let app_state = AppState::new(config, mongo_client, redis_client)
        .await
        .expect("Failed to initialize app state");

    let worker = ScoringWorker::new(
        app_state.orchestrator.clone(),
        app_state.redis.clone(),
        pipeline,
    );

    worker.run().await?;

    Ok(())
}
