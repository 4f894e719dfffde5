use std::sync::Arc;

use anyhow::Context;
use mongodb::Client as MongoClient;
use redis::aio::ConnectionManager;

use crate::config::Config;
use crate::middlewares::auth::JwtService;
use crate::store::{MongoPipelineStore, PipelineStore};

use attempt_service::AttemptService;
use dispatch::{InProcessDispatcher, JobDispatcher, RedisJobDispatcher};
use media_service::MediaService;
use notifier::{Notifier, TracingNotifier};
use object_storage::ObjectStorageClient;
use scorer_client::{RemoteScorerClient, Scorer};
use scoring_orchestrator::ScoringOrchestrator;
use scoring_queue::ScoringQueue;
use storage::{MemoryStorage, StorageProvider};
use submission_gateway::SubmissionGateway;

/// Collaborators the pipeline runs against. `dispatcher: None` picks Redis when a
/// connection is present and the in-process runner otherwise.
pub struct Backends {
    pub store: Arc<dyn PipelineStore>,
    pub storage: Arc<dyn StorageProvider>,
    pub scorer: Arc<dyn Scorer>,
    pub notifier: Arc<dyn Notifier>,
    pub redis: Option<ConnectionManager>,
    pub dispatcher: Option<Arc<dyn JobDispatcher>>,
}

pub struct AppState {
    pub config: Config,
    pub jwt: JwtService,
    pub store: Arc<dyn PipelineStore>,
    pub redis: Option<ConnectionManager>,
    pub scorer: Arc<dyn Scorer>,
    pub attempts: Arc<AttemptService>,
    pub media: Arc<MediaService>,
    pub orchestrator: Arc<ScoringOrchestrator>,
    pub gateway: Arc<SubmissionGateway>,
}

impl AppState {
    pub async fn new(
        config: Config,
        mongo_client: MongoClient,
        redis_client: redis::Client,
    ) -> anyhow::Result<Self> {
        let store = MongoPipelineStore::new(mongo_client, &config.mongo_database);
        store
            .ensure_indexes()
            .await
            .context("Failed to create MongoDB indexes")?;

        tracing::info!("Attempting to connect to Redis...");

        let redis = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            ConnectionManager::new(redis_client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        tracing::info!("Redis ConnectionManager created, testing with PING...");

        let mut conn = redis.clone();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        let storage: Arc<dyn StorageProvider> = match config.object_storage.clone() {
            Some(settings) => Arc::new(ObjectStorageClient::new(settings)?),
            None => {
                tracing::warn!("Object storage not configured, recordings are kept in memory");
                Arc::new(MemoryStorage::new())
            }
        };
        let scorer = Arc::new(RemoteScorerClient::new(config.scorer.clone()));

        Ok(Self::with_backends(
            config,
            Backends {
                store: Arc::new(store),
                storage,
                scorer,
                notifier: Arc::new(TracingNotifier),
                redis: Some(redis),
                dispatcher: None,
            },
        ))
    }

    pub fn with_backends(config: Config, backends: Backends) -> Self {
        let Backends {
            store,
            storage,
            scorer,
            notifier,
            redis,
            dispatcher,
        } = backends;
        let pipeline = &config.pipeline;

        let attempts = Arc::new(AttemptService::new(store.clone()));
        let media = Arc::new(MediaService::new(
            store.clone(),
            storage.clone(),
            attempts.clone(),
        ));
        let queue = Arc::new(ScoringQueue::new(store.clone(), pipeline.max_retries));
        let orchestrator = Arc::new(ScoringOrchestrator::new(
            store.clone(),
            queue,
            scorer.clone(),
            storage,
            notifier,
            pipeline.speaking_fallback_enabled,
        ));

        let dispatcher: Arc<dyn JobDispatcher> = match (dispatcher, redis.clone()) {
            (Some(dispatcher), _) => dispatcher,
            (None, Some(conn)) => Arc::new(RedisJobDispatcher::new(
                conn,
                pipeline.dispatch_queue.clone(),
            )),
            (None, None) => Arc::new(InProcessDispatcher::new(
                orchestrator.clone(),
                pipeline.worker_concurrency,
            )),
        };

        let gateway = Arc::new(SubmissionGateway::new(
            store.clone(),
            attempts.clone(),
            orchestrator.clone(),
            dispatcher,
        ));

        Self {
            jwt: JwtService::new(&config.jwt_secret),
            config,
            store,
            redis,
            scorer,
            attempts,
            media,
            orchestrator,
            gateway,
        }
    }
}

pub mod attempt_service;
pub mod dispatch;
pub mod media_service;
pub mod notifier;
pub mod object_storage;
pub mod scorer_client;
pub mod scoring_feedback;
pub mod scoring_orchestrator;
pub mod scoring_queue;
pub mod scoring_worker;
pub mod storage;
pub mod submission_gateway;
