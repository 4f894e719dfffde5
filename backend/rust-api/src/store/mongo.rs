use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{self, doc, Bson, Document},
    error::{ErrorKind, WriteFailure},
    options::{IndexOptions, ReturnDocument},
    Client, ClientSession, Collection, Database, IndexModel,
};

use super::{
    failed_pass_status, Abandonment, JobResolution, PipelineStore, ResolutionOutcome, ResolvedJob,
};
use crate::error::StoreError;
use crate::metrics::track_db_operation;
use crate::models::{
    Attempt, AttemptMedia, AttemptStatus, AttemptTransition, JobStatus, Prompt, Score,
    ScoringJob,
};
use crate::utils::time::{self, chrono_to_bson};

const PROMPTS: &str = "prompts";
const ATTEMPTS: &str = "attempts";
const MEDIA: &str = "attempt_media";
const JOBS: &str = "scoring_jobs";
const SCORES: &str = "scores";

#[derive(Clone)]
pub struct MongoPipelineStore {
    client: Client,
    mongo: Database,
}

impl MongoPipelineStore {
    pub fn new(client: Client, database: &str) -> Self {
        Self {
            mongo: client.database(database),
            client,
        }
    }

    pub fn database(&self) -> &Database {
        &self.mongo
    }

    fn prompts(&self) -> Collection<Prompt> {
        self.mongo.collection(PROMPTS)
    }

    fn attempts(&self) -> Collection<Attempt> {
        self.mongo.collection(ATTEMPTS)
    }

    fn media(&self) -> Collection<AttemptMedia> {
        self.mongo.collection(MEDIA)
    }

    fn jobs(&self) -> Collection<ScoringJob> {
        self.mongo.collection(JOBS)
    }

    fn scores(&self) -> Collection<Score> {
        self.mongo.collection(SCORES)
    }

    /// Creates the unique and partial indexes the pipeline invariants depend on.
    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let unique = || IndexOptions::builder().unique(true).build();

        self.jobs()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "attempt_id": 1 })
                    .options(unique())
                    .build(),
            )
            .await?;
        self.jobs()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "status": 1, "created_at": 1 })
                    .build(),
            )
            .await?;
        self.scores()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "attempt_id": 1 })
                    .options(unique())
                    .build(),
            )
            .await?;
        self.media()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "attempt_id": 1, "uploaded_at": -1 })
                    .build(),
            )
            .await?;
        // One open writing attempt per learner.
        self.attempts()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "learner_id": 1 })
                    .options(
                        IndexOptions::builder()
                            .unique(true)
                            .name("one_open_writing_attempt".to_string())
                            .partial_filter_expression(doc! {
                                "skill_type": "writing",
                                "status": AttemptStatus::InProgress.as_str(),
                            })
                            .build(),
                    )
                    .build(),
            )
            .await?;

        tracing::info!("MongoDB indexes ensured for scoring pipeline");
        Ok(())
    }

    async fn start_transaction(&self) -> Result<ClientSession, StoreError> {
        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;
        Ok(session)
    }

    async fn resolve_in_session(
        &self,
        session: &mut ClientSession,
        resolution: &JobResolution,
    ) -> Result<ResolvedJob, StoreError> {
        let job = self
            .jobs()
            .find_one(doc! { "_id": &resolution.job_id })
            .session(&mut *session)
            .await?
            .ok_or_else(|| StoreError::Missing(format!("scoring job {}", resolution.job_id)))?;
        if job.status != JobStatus::Processing {
            return Err(StoreError::Conflict(format!(
                "scoring job {} is {}, expected PROCESSING",
                job.id,
                job.status.as_str()
            )));
        }

        let at = chrono_to_bson(resolution.at);
        let (job_set, attempt_set, next_attempt_status) = match &resolution.outcome {
            ResolutionOutcome::Completed { score, note } => {
                self.scores()
                    .delete_many(doc! { "attempt_id": &resolution.attempt_id })
                    .session(&mut *session)
                    .await?;
                self.scores()
                    .insert_one(score.as_ref())
                    .session(&mut *session)
                    .await?;
                (
                    doc! {
                        "status": JobStatus::Completed.as_str(),
                        "error_message": note.clone().map(Bson::String).unwrap_or(Bson::Null),
                        "completed_at": at,
                    },
                    doc! {
                        "status": AttemptStatus::Scored.as_str(),
                        "scored_at": at,
                    },
                    AttemptStatus::Scored,
                )
            }
            ResolutionOutcome::Failed { error, max_retries } => {
                let retry_count = job.retry_count + 1;
                let status = failed_pass_status(retry_count, *max_retries);
                let mut job_set = doc! {
                    "status": status.as_str(),
                    "retry_count": retry_count as i64,
                    "error_message": error,
                };
                if status == JobStatus::Failed {
                    job_set.insert("completed_at", at);
                    (
                        job_set,
                        doc! { "status": AttemptStatus::Failed.as_str() },
                        AttemptStatus::Failed,
                    )
                } else {
                    job_set.insert("started_at", Bson::Null);
                    (
                        job_set,
                        doc! { "status": AttemptStatus::Processing.as_str() },
                        AttemptStatus::Processing,
                    )
                }
            }
        };

        let attempt = self
            .attempts()
            .find_one_and_update(
                doc! {
                    "_id": &resolution.attempt_id,
                    "status": AttemptStatus::Processing.as_str(),
                },
                doc! { "$set": attempt_set },
            )
            .session(&mut *session)
            .await?;
        if attempt.is_none() {
            return Err(StoreError::Conflict(format!(
                "attempt {} is no longer PROCESSING",
                resolution.attempt_id
            )));
        }

        let updated = self
            .jobs()
            .find_one_and_update(
                doc! {
                    "_id": &resolution.job_id,
                    "status": JobStatus::Processing.as_str(),
                },
                doc! { "$set": job_set },
            )
            .return_document(ReturnDocument::After)
            .session(&mut *session)
            .await?
            .ok_or_else(|| {
                StoreError::Conflict(format!("scoring job {} changed concurrently", job.id))
            })?;

        Ok(ResolvedJob {
            job: updated,
            attempt_status: next_attempt_status,
        })
    }

    async fn abandon_in_session(
        &self,
        session: &mut ClientSession,
        job_id: &str,
        attempt_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Abandonment, StoreError> {
        // Writing the attempt puts it in this transaction's write set, so a resubmit
        // racing this check conflicts instead of slipping past it.
        let still_open = self
            .attempts()
            .find_one_and_update(
                doc! {
                    "_id": attempt_id,
                    "status": { "$ne": AttemptStatus::Processing.as_str() },
                },
                doc! { "$set": { "job_released_at": chrono_to_bson(now) } },
            )
            .session(&mut *session)
            .await?;
        let resubmitted = still_open.is_none()
            && self
                .attempts()
                .find_one(doc! { "_id": attempt_id })
                .session(&mut *session)
                .await?
                .is_some();

        let (update, outcome) = if resubmitted {
            (
                doc! { "$set": {
                    "status": JobStatus::Queued.as_str(),
                    "started_at": Bson::Null,
                }},
                Abandonment::Requeued,
            )
        } else {
            (
                doc! { "$set": {
                    "status": JobStatus::Failed.as_str(),
                    "error_message": reason,
                    "completed_at": chrono_to_bson(now),
                }},
                Abandonment::Abandoned,
            )
        };

        let result = self
            .jobs()
            .update_one(
                doc! { "_id": job_id, "status": JobStatus::Processing.as_str() },
                update,
            )
            .session(&mut *session)
            .await?;
        if result.modified_count == 1 {
            Ok(outcome)
        } else {
            Ok(Abandonment::Skipped)
        }
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match *err.kind {
        ErrorKind::Write(WriteFailure::WriteError(ref we)) => we.code == 11000,
        ErrorKind::Command(ref ce) => ce.code == 11000,
        _ => false,
    }
}

fn transition_update(change: &AttemptTransition) -> Document {
    let mut set = doc! { "status": change.to.as_str() };
    if change.reopen {
        set.insert("submitted_at", Bson::Null);
        set.insert("selected_media_id", Bson::Null);
    }
    if let Some(at) = change.submitted_at {
        set.insert("submitted_at", chrono_to_bson(at));
    }
    if let Some(ref media_id) = change.selected_media_id {
        set.insert("selected_media_id", media_id);
    }
    if let Some(ref evaluation) = change.evaluation {
        set.insert("teacher_score", evaluation.score);
        set.insert(
            "teacher_comment",
            evaluation
                .comment
                .clone()
                .map(Bson::String)
                .unwrap_or(Bson::Null),
        );
        set.insert("evaluated_by", &evaluation.teacher_id);
        set.insert("evaluated_at", chrono_to_bson(evaluation.evaluated_at));
    }
    doc! { "$set": set }
}

fn statuses(from: &[AttemptStatus]) -> Vec<&'static str> {
    from.iter().map(|status| status.as_str()).collect()
}

#[async_trait]
impl PipelineStore for MongoPipelineStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.mongo.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn upsert_prompt(&self, prompt: &Prompt) -> Result<(), StoreError> {
        self.prompts()
            .replace_one(doc! { "_id": &prompt.id }, prompt)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn find_prompt(&self, prompt_id: &str) -> Result<Option<Prompt>, StoreError> {
        Ok(self.prompts().find_one(doc! { "_id": prompt_id }).await?)
    }

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<(), StoreError> {
        let result = track_db_operation("insert", ATTEMPTS, async {
            self.attempts().insert_one(attempt).await.map_err(StoreError::from)
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(StoreError::Mongo(err)) if is_duplicate_key(&err) => Err(StoreError::Conflict(
                "learner already has a writing attempt in progress".into(),
            )),
            Err(err) => Err(err),
        }
    }

    async fn find_attempt(&self, attempt_id: &str) -> Result<Option<Attempt>, StoreError> {
        Ok(self.attempts().find_one(doc! { "_id": attempt_id }).await?)
    }

    async fn save_writing_content(
        &self,
        attempt_id: &str,
        content: &str,
        word_count: u32,
        saved_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = self
            .attempts()
            .update_one(
                doc! {
                    "_id": attempt_id,
                    "status": AttemptStatus::InProgress.as_str(),
                },
                doc! { "$set": {
                    "writing_content": content,
                    "word_count": word_count as i64,
                    "last_saved_at": chrono_to_bson(saved_at),
                }},
            )
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn transition_attempt(
        &self,
        attempt_id: &str,
        from: &[AttemptStatus],
        change: &AttemptTransition,
    ) -> Result<Option<Attempt>, StoreError> {
        track_db_operation("transition", ATTEMPTS, async {
            self.attempts()
                .find_one_and_update(
                    doc! { "_id": attempt_id, "status": { "$in": statuses(from) } },
                    transition_update(change),
                )
                .return_document(ReturnDocument::After)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn insert_media(&self, media: &AttemptMedia) -> Result<(), StoreError> {
        self.media().insert_one(media).await?;
        Ok(())
    }

    async fn find_media(&self, media_id: &str) -> Result<Option<AttemptMedia>, StoreError> {
        Ok(self.media().find_one(doc! { "_id": media_id }).await?)
    }

    async fn list_media(&self, attempt_id: &str) -> Result<Vec<AttemptMedia>, StoreError> {
        let cursor = self
            .media()
            .find(doc! { "attempt_id": attempt_id })
            .sort(doc! { "uploaded_at": -1, "_id": -1 })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn delete_media(&self, media_id: &str) -> Result<bool, StoreError> {
        let Some(media) = self.find_media(media_id).await? else {
            return Ok(false);
        };

        // Touching the attempt under the status guard makes a concurrent submit
        // conflict with this transaction instead of racing past it.
        let mut session = self.start_transaction().await?;
        let guard = self
            .attempts()
            .find_one_and_update(
                doc! {
                    "_id": &media.attempt_id,
                    "status": AttemptStatus::InProgress.as_str(),
                },
                doc! { "$set": { "media_changed_at": chrono_to_bson(time::now()) } },
            )
            .session(&mut session)
            .await?;
        if guard.is_none() {
            session.abort_transaction().await?;
            return Ok(false);
        }

        let deleted = self
            .media()
            .delete_one(doc! { "_id": media_id })
            .session(&mut session)
            .await?;
        session.commit_transaction().await?;
        Ok(deleted.deleted_count == 1)
    }

    async fn enqueue_job(
        &self,
        attempt_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ScoringJob, StoreError> {
        let reset = self
            .jobs()
            .find_one_and_update(
                doc! {
                    "attempt_id": attempt_id,
                    "status": { "$in": [JobStatus::Failed.as_str(), JobStatus::Completed.as_str()] },
                },
                doc! { "$set": {
                    "status": JobStatus::Queued.as_str(),
                    "error_message": Bson::Null,
                    "started_at": Bson::Null,
                    "completed_at": Bson::Null,
                }},
            )
            .return_document(ReturnDocument::After)
            .await?;
        if let Some(job) = reset {
            return Ok(job);
        }

        let mut fresh = bson::to_document(&ScoringJob::queued(attempt_id, now))
            .map_err(|e| StoreError::Backend(format!("failed to encode scoring job: {}", e)))?;
        fresh.remove("attempt_id");

        let upserted = self
            .jobs()
            .find_one_and_update(
                doc! { "attempt_id": attempt_id },
                doc! { "$setOnInsert": fresh },
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await;

        match upserted {
            Ok(Some(job)) => Ok(job),
            // A concurrent upsert won the unique index race; its job is the live one.
            Err(err) if is_duplicate_key(&err) => self
                .find_job_for_attempt(attempt_id)
                .await?
                .ok_or_else(|| StoreError::Missing(format!("job for attempt {}", attempt_id))),
            Ok(None) => Err(StoreError::Backend(format!(
                "upsert returned no job for attempt {}",
                attempt_id
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn find_job(&self, job_id: &str) -> Result<Option<ScoringJob>, StoreError> {
        Ok(self.jobs().find_one(doc! { "_id": job_id }).await?)
    }

    async fn find_job_for_attempt(
        &self,
        attempt_id: &str,
    ) -> Result<Option<ScoringJob>, StoreError> {
        Ok(self
            .jobs()
            .find_one(doc! { "attempt_id": attempt_id })
            .await?)
    }

    async fn claim_job(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScoringJob>, StoreError> {
        track_db_operation("claim", JOBS, async {
            self.jobs()
                .find_one_and_update(
                    doc! { "_id": job_id, "status": JobStatus::Queued.as_str() },
                    doc! { "$set": {
                        "status": JobStatus::Processing.as_str(),
                        "started_at": chrono_to_bson(now),
                    }},
                )
                .return_document(ReturnDocument::After)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn list_queued_jobs(&self, limit: usize) -> Result<Vec<ScoringJob>, StoreError> {
        let cursor = self
            .jobs()
            .find(doc! { "status": JobStatus::Queued.as_str() })
            .sort(doc! { "created_at": 1, "_id": 1 })
            .limit(limit as i64)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn abandon_job(
        &self,
        job_id: &str,
        attempt_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Abandonment, StoreError> {
        let mut session = self.start_transaction().await?;
        match self
            .abandon_in_session(&mut session, job_id, attempt_id, reason, now)
            .await
        {
            Ok(Abandonment::Skipped) => {
                session.abort_transaction().await?;
                Ok(Abandonment::Skipped)
            }
            Ok(outcome) => {
                session.commit_transaction().await?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(abort_err) = session.abort_transaction().await {
                    tracing::warn!(error = %abort_err, "failed to abort abandon transaction");
                }
                Err(err)
            }
        }
    }

    async fn resolve_job(&self, resolution: &JobResolution) -> Result<ResolvedJob, StoreError> {
        let mut session = self.start_transaction().await?;
        match self.resolve_in_session(&mut session, resolution).await {
            Ok(resolved) => {
                track_db_operation("commit", JOBS, async {
                    session.commit_transaction().await.map_err(StoreError::from)
                })
                .await?;
                Ok(resolved)
            }
            Err(err) => {
                if let Err(abort_err) = session.abort_transaction().await {
                    tracing::warn!(error = %abort_err, "failed to abort scoring transaction");
                }
                Err(err)
            }
        }
    }

    async fn find_score(&self, attempt_id: &str) -> Result<Option<Score>, StoreError> {
        Ok(self
            .scores()
            .find_one(doc! { "attempt_id": attempt_id })
            .await?)
    }

    async fn delete_score(&self, attempt_id: &str) -> Result<bool, StoreError> {
        let result = self
            .scores()
            .delete_many(doc! { "attempt_id": attempt_id })
            .await?;
        Ok(result.deleted_count > 0)
    }
}
