#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

use bandscore_api::{
    config::Config,
    create_router,
    error::StoreError,
    middlewares::auth::{JwtClaims, JwtService},
    models::{
        Attempt, AttemptMedia, AttemptStatus, AttemptTransition, DetailedFeedback, Prompt, Score,
        ScoringJob, SkillType, SubScores, TaskType,
    },
    services::{
        dispatch::JobDispatcher,
        notifier::{Notifier, ScoringNotification, TracingNotifier},
        scorer_client::{AudioInput, Scorer, ScorerError, ScoringOutcome},
        storage::MemoryStorage,
        AppState, Backends,
    },
    store::{Abandonment, JobResolution, MemoryPipelineStore, PipelineStore, ResolvedJob},
};

pub const JWT_SECRET: &str = "integration-test-secret";
pub const WRITING_PROMPT: &str = "writing-task2";
pub const SPEAKING_PROMPT: &str = "speaking-part2";

/// One scripted scorer reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Band(f64),
    Unavailable(&'static str),
    Unintelligible(&'static str),
}

/// Scorer double that replays a script, then answers `Band(6.5)`.
pub struct ScriptedScorer {
    script: Mutex<VecDeque<Reply>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedScorer {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn reply(&self) -> Result<ScoringOutcome, ScorerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Band(6.5));
        match next {
            Reply::Band(band) => Ok(outcome(band)),
            Reply::Unavailable(msg) => Err(ScorerError::Unavailable(msg.to_string())),
            Reply::Unintelligible(msg) => Err(ScorerError::Unintelligible(msg.to_string())),
        }
    }
}

fn outcome(band: f64) -> ScoringOutcome {
    ScoringOutcome {
        overall_band: band,
        confidence: Some(0.8),
        sub_scores: SubScores {
            lexical_resource: band,
            grammatical_range: band,
            ..SubScores::default()
        },
        feedback: "Vocabulary: Good range of vocabulary.".to_string(),
        detailed_feedback: DetailedFeedback {
            strengths: vec!["Good range of vocabulary.".to_string()],
            ..DetailedFeedback::default()
        },
        transcript: None,
        raw_response: json!({ "overall_band": band }),
    }
}

#[async_trait]
impl Scorer for ScriptedScorer {
    async fn score_writing(
        &self,
        _prompt: Option<&str>,
        _essay: &str,
    ) -> Result<ScoringOutcome, ScorerError> {
        self.reply().await
    }

    async fn score_speaking_text(&self, _answer_text: &str) -> Result<ScoringOutcome, ScorerError> {
        self.reply().await
    }

    async fn score_speaking_audio(
        &self,
        _audio: AudioInput,
    ) -> Result<ScoringOutcome, ScorerError> {
        self.reply().await
    }

    async fn health(&self) -> Result<Value, ScorerError> {
        Ok(json!({ "status": "ok" }))
    }
}

/// Records dispatched job ids so tests decide when jobs run.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub jobs: Mutex<Vec<String>>,
}

impl RecordingDispatcher {
    pub fn dispatched(&self) -> Vec<String> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobDispatcher for RecordingDispatcher {
    async fn dispatch(&self, job_id: &str) -> anyhow::Result<()> {
        self.jobs.lock().unwrap().push(job_id.to_string());
        Ok(())
    }
}

/// Dispatcher whose push always fails, like an unreachable Redis.
pub struct FailingDispatcher;

#[async_trait]
impl JobDispatcher for FailingDispatcher {
    async fn dispatch(&self, _job_id: &str) -> anyhow::Result<()> {
        anyhow::bail!("redis down")
    }
}

/// Notifier that counts calls and always fails.
#[derive(Default)]
pub struct FailingNotifier {
    calls: AtomicUsize,
}

impl FailingNotifier {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify_scored(&self, _notification: &ScoringNotification) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("push gateway unavailable")
    }
}

/// Memory store with injectable faults.
pub struct FlakyStore {
    inner: Arc<MemoryPipelineStore>,
    find_attempt_failures: AtomicUsize,
    resolve_failures: AtomicUsize,
    resubmit_after_read: Mutex<Option<String>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryPipelineStore>) -> Self {
        Self {
            inner,
            find_attempt_failures: AtomicUsize::new(0),
            resolve_failures: AtomicUsize::new(0),
            resubmit_after_read: Mutex::new(None),
        }
    }

    /// The next `count` attempt lookups fail with a backend error.
    pub fn fail_find_attempt(&self, count: usize) {
        self.find_attempt_failures.store(count, Ordering::SeqCst);
    }

    /// The next `count` job resolutions fail with a backend error before writing.
    pub fn fail_resolve(&self, count: usize) {
        self.resolve_failures.store(count, Ordering::SeqCst);
    }

    /// Right after the next read of `attempt_id`, the learner resubmits it: the attempt
    /// moves IN_PROGRESS -> PROCESSING and its job is enqueued again.
    pub fn resubmit_after_next_read(&self, attempt_id: &str) {
        *self.resubmit_after_read.lock().unwrap() = Some(attempt_id.to_string());
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PipelineStore for FlakyStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    async fn upsert_prompt(&self, prompt: &Prompt) -> Result<(), StoreError> {
        self.inner.upsert_prompt(prompt).await
    }

    async fn find_prompt(&self, prompt_id: &str) -> Result<Option<Prompt>, StoreError> {
        self.inner.find_prompt(prompt_id).await
    }

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<(), StoreError> {
        self.inner.insert_attempt(attempt).await
    }

    async fn find_attempt(&self, attempt_id: &str) -> Result<Option<Attempt>, StoreError> {
        if Self::take_failure(&self.find_attempt_failures) {
            return Err(StoreError::Backend("transient".into()));
        }
        let found = self.inner.find_attempt(attempt_id).await?;

        let resubmit = {
            let mut pending = self.resubmit_after_read.lock().unwrap();
            if pending.as_deref() == Some(attempt_id) {
                pending.take()
            } else {
                None
            }
        };
        if resubmit.is_some() {
            let now = Utc::now();
            self.inner
                .transition_attempt(
                    attempt_id,
                    &[AttemptStatus::InProgress],
                    &AttemptTransition::to(AttemptStatus::Processing).submitted(now),
                )
                .await?;
            self.inner.enqueue_job(attempt_id, now).await?;
        }

        Ok(found)
    }

    async fn save_writing_content(
        &self,
        attempt_id: &str,
        content: &str,
        word_count: u32,
        saved_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner
            .save_writing_content(attempt_id, content, word_count, saved_at)
            .await
    }

    async fn transition_attempt(
        &self,
        attempt_id: &str,
        from: &[AttemptStatus],
        change: &AttemptTransition,
    ) -> Result<Option<Attempt>, StoreError> {
        self.inner.transition_attempt(attempt_id, from, change).await
    }

    async fn insert_media(&self, media: &AttemptMedia) -> Result<(), StoreError> {
        self.inner.insert_media(media).await
    }

    async fn find_media(&self, media_id: &str) -> Result<Option<AttemptMedia>, StoreError> {
        self.inner.find_media(media_id).await
    }

    async fn list_media(&self, attempt_id: &str) -> Result<Vec<AttemptMedia>, StoreError> {
        self.inner.list_media(attempt_id).await
    }

    async fn delete_media(&self, media_id: &str) -> Result<bool, StoreError> {
        self.inner.delete_media(media_id).await
    }

    async fn enqueue_job(
        &self,
        attempt_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ScoringJob, StoreError> {
        self.inner.enqueue_job(attempt_id, now).await
    }

    async fn find_job(&self, job_id: &str) -> Result<Option<ScoringJob>, StoreError> {
        self.inner.find_job(job_id).await
    }

    async fn find_job_for_attempt(
        &self,
        attempt_id: &str,
    ) -> Result<Option<ScoringJob>, StoreError> {
        self.inner.find_job_for_attempt(attempt_id).await
    }

    async fn claim_job(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScoringJob>, StoreError> {
        self.inner.claim_job(job_id, now).await
    }

    async fn list_queued_jobs(&self, limit: usize) -> Result<Vec<ScoringJob>, StoreError> {
        self.inner.list_queued_jobs(limit).await
    }

    async fn abandon_job(
        &self,
        job_id: &str,
        attempt_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Abandonment, StoreError> {
        self.inner.abandon_job(job_id, attempt_id, reason, now).await
    }

    async fn resolve_job(&self, resolution: &JobResolution) -> Result<ResolvedJob, StoreError> {
        if Self::take_failure(&self.resolve_failures) {
            return Err(StoreError::Backend("transaction aborted".into()));
        }
        self.inner.resolve_job(resolution).await
    }

    async fn find_score(&self, attempt_id: &str) -> Result<Option<Score>, StoreError> {
        self.inner.find_score(attempt_id).await
    }

    async fn delete_score(&self, attempt_id: &str) -> Result<bool, StoreError> {
        self.inner.delete_score(attempt_id).await
    }
}

/// Replacements for the default test collaborators.
#[derive(Default)]
pub struct Doubles {
    pub dispatcher: Option<Arc<dyn JobDispatcher>>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub store: Arc<MemoryPipelineStore>,
    pub storage: Arc<MemoryStorage>,
    pub scorer: Arc<ScriptedScorer>,
    pub dispatcher: Arc<RecordingDispatcher>,
}

pub async fn create_test_app(scorer: ScriptedScorer) -> TestApp {
    create_test_app_with(scorer, |_| {}).await
}

pub async fn create_test_app_with(
    scorer: ScriptedScorer,
    configure: impl FnOnce(&mut Config),
) -> TestApp {
    let store = Arc::new(MemoryPipelineStore::new());
    build_test_app(scorer, configure, store, None, Doubles::default()).await
}

pub async fn create_test_app_with_doubles(scorer: ScriptedScorer, doubles: Doubles) -> TestApp {
    let store = Arc::new(MemoryPipelineStore::new());
    build_test_app(scorer, |_| {}, store, None, doubles).await
}

/// Test app running on a `FlakyStore` that wraps the app's memory store.
pub async fn create_flaky_test_app(
    scorer: ScriptedScorer,
    doubles: Doubles,
) -> (TestApp, Arc<FlakyStore>) {
    let store = Arc::new(MemoryPipelineStore::new());
    let flaky = Arc::new(FlakyStore::new(store.clone()));
    let app = build_test_app(scorer, |_| {}, store, Some(flaky.clone()), doubles).await;
    (app, flaky)
}

async fn build_test_app(
    scorer: ScriptedScorer,
    configure: impl FnOnce(&mut Config),
    store: Arc<MemoryPipelineStore>,
    flaky: Option<Arc<FlakyStore>>,
    doubles: Doubles,
) -> TestApp {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let mut config = Config::for_memory(JWT_SECRET);
    configure(&mut config);

    let storage = Arc::new(MemoryStorage::new());
    let scorer = Arc::new(scorer);
    let dispatcher = Arc::new(RecordingDispatcher::default());

    seed_prompts(store.as_ref()).await;

    let pipeline_store: Arc<dyn PipelineStore> = match flaky {
        Some(flaky) => flaky as Arc<dyn PipelineStore>,
        None => store.clone() as Arc<dyn PipelineStore>,
    };
    let notifier = doubles
        .notifier
        .unwrap_or_else(|| Arc::new(TracingNotifier) as Arc<dyn Notifier>);
    let job_dispatcher = doubles
        .dispatcher
        .unwrap_or_else(|| dispatcher.clone() as Arc<dyn JobDispatcher>);
    let state = Arc::new(AppState::with_backends(
        config,
        Backends {
            store: pipeline_store,
            storage: storage.clone(),
            scorer: scorer.clone(),
            notifier,
            redis: None,
            dispatcher: Some(job_dispatcher),
        },
    ));

    TestApp {
        router: create_router(state.clone()),
        state,
        store,
        storage,
        scorer,
        dispatcher,
    }
}

async fn seed_prompts(store: &MemoryPipelineStore) {
    store
        .upsert_prompt(&Prompt {
            id: WRITING_PROMPT.to_string(),
            skill_type: SkillType::Writing,
            task_type: TaskType::WritingTask2,
            title: "Public transport".to_string(),
            text: "Some people think public transport should be free. Discuss.".to_string(),
        })
        .await
        .unwrap();
    store
        .upsert_prompt(&Prompt {
            id: SPEAKING_PROMPT.to_string(),
            skill_type: SkillType::Speaking,
            task_type: TaskType::SpeakingPart2,
            title: "A memorable journey".to_string(),
            text: "Describe a journey you remember well.".to_string(),
        })
        .await
        .unwrap();
}

pub fn token(user_id: &str, role: &str) -> String {
    JwtService::new(JWT_SECRET)
        .generate_token(&JwtClaims::new(user_id, role, 3600))
        .unwrap()
}

pub fn words(count: usize) -> String {
    vec!["word"; count].join(" ")
}

/// Sends one request through `router`; usable from spawned tasks.
pub async fn call(
    router: Router,
    method: &str,
    uri: &str,
    token: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", token));
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = router.oneshot(builder.body(body).unwrap()).await.unwrap();
    read_json(response).await
}

impl TestApp {
    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        token: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        call(self.router.clone(), method, uri, token, body).await
    }

    pub async fn upload(
        &self,
        token: &str,
        attempt_id: &str,
        file_name: &str,
        duration_seconds: f64,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> (StatusCode, Value) {
        let uri = format!(
            "/api/v1/attempts/{}/media?file_name={}&duration_seconds={}",
            attempt_id, file_name, duration_seconds
        );
        let response = self
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("authorization", format!("Bearer {}", token))
                    .header("content-type", mime_type)
                    .body(Body::from(bytes))
                    .unwrap(),
            )
            .await
            .unwrap();
        read_json(response).await
    }

    /// Creates an attempt over HTTP and returns its id.
    pub async fn start_attempt(&self, token: &str, prompt_id: &str, skill: &str) -> String {
        let (status, body) = self
            .send(
                "POST",
                "/api/v1/attempts",
                token,
                Some(json!({ "prompt_id": prompt_id, "skill_type": skill })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create attempt failed: {}", body);
        body["_id"].as_str().unwrap().to_string()
    }

    /// Writing attempt with `word_count` saved words, submitted; returns (attempt, job).
    pub async fn submitted_writing(&self, token: &str, word_count: usize) -> (String, String) {
        let attempt_id = self.start_attempt(token, WRITING_PROMPT, "writing").await;
        let (status, _) = self
            .send(
                "PUT",
                &format!("/api/v1/attempts/{}/content", attempt_id),
                token,
                Some(json!({ "content": words(word_count), "is_auto_save": false })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = self
            .send(
                "POST",
                &format!("/api/v1/attempts/{}/submit/writing", attempt_id),
                token,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED, "submit failed: {}", body);
        (attempt_id, body["job_id"].as_str().unwrap().to_string())
    }
}

async fn read_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).to_string())
        })
    };
    (status, json)
}
