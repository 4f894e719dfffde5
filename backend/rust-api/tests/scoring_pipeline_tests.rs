use axum::http::StatusCode;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use bandscore_api::{
    middlewares::auth::ROLE_LEARNER,
    models::{AttemptStatus, JobStatus},
    services::{
        scoring_orchestrator::{ProcessOutcome, FALLBACK_CONFIDENCE},
        scoring_worker::ScoringWorker,
    },
    store::PipelineStore,
};

mod common;

use common::{
    create_flaky_test_app, create_test_app, create_test_app_with, create_test_app_with_doubles,
    token, words, Doubles, FailingDispatcher, FailingNotifier, Reply, ScriptedScorer, TestApp,
    SPEAKING_PROMPT, WRITING_PROMPT,
};

/// Speaking attempt with one 45 s recording, submitted; returns (attempt, job).
async fn submitted_speaking(app: &TestApp, learner: &str) -> (String, String) {
    let attempt_id = app.start_attempt(learner, SPEAKING_PROMPT, "speaking").await;
    let (status, media) = app
        .upload(learner, &attempt_id, "answer.webm", 45.0, "audio/webm", vec![3; 4096])
        .await;
    assert_eq!(status, StatusCode::CREATED, "upload failed: {}", media);

    let (status, body) = app
        .send(
            "POST",
            &format!("/api/v1/attempts/{}/submit/speaking", attempt_id),
            learner,
            Some(json!({ "selected_media_id": media["_id"] })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED, "submit failed: {}", body);
    (attempt_id, body["job_id"].as_str().unwrap().to_string())
}

#[tokio::test]
async fn speaking_attempt_is_scored() {
    let app = create_test_app(ScriptedScorer::new(vec![Reply::Band(6.5)])).await;
    let learner = token("learner-speaks", ROLE_LEARNER);
    let (attempt_id, job_id) = submitted_speaking(&app, &learner).await;

    let outcome = app.state.orchestrator.process_job(&job_id).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Scored { overall_band: 6.5 });

    let attempt = app.store.find_attempt(&attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Scored);
    assert!(attempt.scored_at.is_some());

    let score = app.store.find_score(&attempt_id).await.unwrap().unwrap();
    assert_eq!(score.overall_band, 6.5);

    let job = app.store.find_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());

    let (status, body) = app
        .send(
            "GET",
            &format!("/api/v1/attempts/{}/result", attempt_id),
            &learner,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "SCORED");
    assert_eq!(body["score"]["overall_band"], 6.5);
    assert_eq!(body["job_status"], "COMPLETED");
}

#[tokio::test]
async fn three_timeouts_fail_the_attempt_and_rescore_requeues() {
    let app = create_test_app(ScriptedScorer::new(vec![
        Reply::Unavailable("timed out after 60s"),
        Reply::Unavailable("timed out after 60s"),
        Reply::Unavailable("timed out after 60s"),
    ]))
    .await;
    let learner = token("learner-unlucky", ROLE_LEARNER);
    let (attempt_id, job_id) = app.submitted_writing(&learner, 280).await;
    let orchestrator = &app.state.orchestrator;

    for expected in 1..=2 {
        match orchestrator.process_job(&job_id).await.unwrap() {
            ProcessOutcome::Requeued { retry_count, .. } => assert_eq!(retry_count, expected),
            other => panic!("expected requeue, got {:?}", other),
        }
        let attempt = app.store.find_attempt(&attempt_id).await.unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Processing);
    }

    match orchestrator.process_job(&job_id).await.unwrap() {
        ProcessOutcome::Failed { retry_count, .. } => assert_eq!(retry_count, 3),
        other => panic!("expected failure, got {:?}", other),
    }

    let job = app.store.find_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 3);
    let attempt = app.store.find_attempt(&attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert!(app.store.find_score(&attempt_id).await.unwrap().is_none());

    let (status, body) = app
        .send(
            "GET",
            &format!("/api/v1/attempts/{}/result", attempt_id),
            &learner,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "FAILED");
    assert_eq!(body["can_rescore"], true);

    let (status, body) = app
        .send(
            "POST",
            &format!("/api/v1/attempts/{}/rescore", attempt_id),
            &learner,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["job_id"], job_id.as_str());

    let attempt = app.store.find_attempt(&attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Processing);
    let job = app.store.find_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(app.dispatcher.dispatched().contains(&job_id));

    // The scorer has recovered.
    assert_eq!(
        orchestrator.process_job(&job_id).await.unwrap(),
        ProcessOutcome::Scored { overall_band: 6.5 }
    );
}

#[tokio::test]
async fn rescore_is_refused_unless_failed() {
    let app = create_test_app(ScriptedScorer::new(vec![])).await;
    let learner = token("learner-impatient", ROLE_LEARNER);
    let (attempt_id, _) = app.submitted_writing(&learner, 300).await;

    let (status, body) = app
        .send(
            "POST",
            &format!("/api/v1/attempts/{}/rescore", attempt_id),
            &learner,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "CONFLICT");

    let attempt = app.store.find_attempt(&attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Processing);
}

#[tokio::test]
async fn unintelligible_audio_completes_with_zero_band() {
    let app = create_test_app(ScriptedScorer::new(vec![Reply::Unintelligible(
        "Could not extract meaningful text from audio",
    )]))
    .await;
    let learner = token("learner-mumbles", ROLE_LEARNER);
    let (attempt_id, job_id) = submitted_speaking(&app, &learner).await;

    let outcome = app.state.orchestrator.process_job(&job_id).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::CompletedWithIssues { .. }));

    let attempt = app.store.find_attempt(&attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Scored);

    let score = app.store.find_score(&attempt_id).await.unwrap().unwrap();
    assert_eq!(score.overall_band, 0.0);
    assert!(!score.detailed_feedback.areas_for_improvement.is_empty());

    let job = app.store.find_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job
        .error_message
        .as_deref()
        .is_some_and(|msg| msg.contains("meaningful")));
}

#[tokio::test]
async fn unavailable_speaking_scorer_falls_back_to_duration_band() {
    let app = create_test_app(ScriptedScorer::new(vec![Reply::Unavailable(
        "connection refused",
    )]))
    .await;
    let learner = token("learner-offline", ROLE_LEARNER);
    let (attempt_id, job_id) = submitted_speaking(&app, &learner).await;

    let outcome = app.state.orchestrator.process_job(&job_id).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Scored { overall_band: 5.0 });

    let score = app.store.find_score(&attempt_id).await.unwrap().unwrap();
    assert_eq!(score.confidence, Some(FALLBACK_CONFIDENCE));
    assert_eq!(score.raw_scorer_response["source"], "local_fallback");
}

#[tokio::test]
async fn speaking_failures_retry_when_fallback_is_disabled() {
    let app = create_test_app_with(
        ScriptedScorer::new(vec![Reply::Unavailable("connection refused")]),
        |config| config.pipeline.speaking_fallback_enabled = false,
    )
    .await;
    let learner = token("learner-strict", ROLE_LEARNER);
    let (attempt_id, job_id) = submitted_speaking(&app, &learner).await;

    match app.state.orchestrator.process_job(&job_id).await.unwrap() {
        ProcessOutcome::Requeued { retry_count, .. } => assert_eq!(retry_count, 1),
        other => panic!("expected requeue, got {:?}", other),
    }
    let attempt = app.store.find_attempt(&attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Processing);
}

#[tokio::test]
async fn missing_recording_falls_back() {
    let app = create_test_app(ScriptedScorer::new(vec![])).await;
    let learner = token("learner-lost", ROLE_LEARNER);
    let (attempt_id, job_id) = submitted_speaking(&app, &learner).await;

    let media = app.store.list_media(&attempt_id).await.unwrap();
    assert!(app.storage.remove(&media[0].storage_key));

    let outcome = app.state.orchestrator.process_job(&job_id).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Scored { overall_band: 5.0 });
    assert_eq!(app.scorer.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_score_a_job_once() {
    let app = create_test_app(
        ScriptedScorer::new(vec![]).with_delay(Duration::from_millis(50)),
    )
    .await;
    let learner = token("learner-popular", ROLE_LEARNER);
    let (attempt_id, job_id) = app.submitted_writing(&learner, 300).await;

    let first = {
        let orchestrator = app.state.orchestrator.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move { orchestrator.process_job(&job_id).await })
    };
    let second = {
        let orchestrator = app.state.orchestrator.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move { orchestrator.process_job(&job_id).await })
    };

    let mut outcomes = vec![
        first.await.unwrap().unwrap(),
        second.await.unwrap().unwrap(),
    ];
    outcomes.sort_by_key(|outcome| matches!(outcome, ProcessOutcome::AlreadyClaimed));

    assert_eq!(outcomes[0], ProcessOutcome::Scored { overall_band: 6.5 });
    assert_eq!(outcomes[1], ProcessOutcome::AlreadyClaimed);
    assert_eq!(app.scorer.calls(), 1);

    let attempt = app.store.find_attempt(&attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Scored);
}

#[tokio::test]
async fn enqueue_returns_the_live_job() {
    let app = create_test_app(ScriptedScorer::new(vec![])).await;
    let learner = token("learner-idem", ROLE_LEARNER);
    let (attempt_id, job_id) = app.submitted_writing(&learner, 300).await;

    let queue = app.state.orchestrator.queue();
    let again = queue.enqueue(&attempt_id).await.unwrap();
    assert_eq!(again.id, job_id);
    assert_eq!(again.status, JobStatus::Queued);
    assert_eq!(queue.list_pending(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn worker_sweep_processes_queued_jobs() {
    let app = create_test_app(ScriptedScorer::new(vec![])).await;
    let (first, _) = app
        .submitted_writing(&token("learner-a", ROLE_LEARNER), 300)
        .await;
    let (second, _) = app
        .submitted_writing(&token("learner-b", ROLE_LEARNER), 300)
        .await;

    let worker = ScoringWorker::new(
        app.state.orchestrator.clone(),
        None,
        app.state.config.pipeline.clone(),
    );
    assert_eq!(worker.sweep().await.unwrap(), 2);
    assert_eq!(worker.sweep().await.unwrap(), 0);

    for attempt_id in [first, second] {
        let attempt = app.store.find_attempt(&attempt_id).await.unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Scored);
    }
}

#[tokio::test]
async fn attempt_lookup_error_after_claim_requeues_the_job() {
    let (app, flaky) =
        create_flaky_test_app(ScriptedScorer::new(vec![Reply::Band(6.0)]), Doubles::default())
            .await;
    let learner = token("learner-flaky-read", ROLE_LEARNER);
    let (attempt_id, job_id) = app.submitted_writing(&learner, 260).await;

    flaky.fail_find_attempt(1);
    let outcome = app.state.orchestrator.process_job(&job_id).await.unwrap();
    match outcome {
        ProcessOutcome::Requeued { retry_count, error } => {
            assert_eq!(retry_count, 1);
            assert!(error.contains("failed to load attempt"), "{}", error);
        }
        other => panic!("expected requeue, got {:?}", other),
    }

    let job = app.store.find_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    let attempt = app.store.find_attempt(&attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Processing);
    let pending = app.state.orchestrator.queue().list_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(app.scorer.calls(), 0);

    let outcome = app.state.orchestrator.process_job(&job_id).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Scored { overall_band: 6.0 });
    let attempt = app.store.find_attempt(&attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Scored);
}

#[tokio::test]
async fn failed_result_write_goes_through_retry() {
    let (app, flaky) = create_flaky_test_app(
        ScriptedScorer::new(vec![Reply::Band(6.5), Reply::Band(7.0)]),
        Doubles::default(),
    )
    .await;
    let learner = token("learner-flaky-write", ROLE_LEARNER);
    let (attempt_id, job_id) = app.submitted_writing(&learner, 260).await;

    flaky.fail_resolve(1);
    let outcome = app.state.orchestrator.process_job(&job_id).await.unwrap();
    assert!(
        matches!(outcome, ProcessOutcome::Requeued { retry_count: 1, .. }),
        "{:?}",
        outcome
    );
    assert!(app.store.find_score(&attempt_id).await.unwrap().is_none());

    let outcome = app.state.orchestrator.process_job(&job_id).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Scored { overall_band: 7.0 });
    assert_eq!(app.scorer.calls(), 2);

    let job = app.store.find_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
}

#[tokio::test]
async fn resubmit_while_orphaned_job_is_claimed_requeues_it() {
    let (app, flaky) = create_flaky_test_app(
        ScriptedScorer::new(vec![Reply::Band(7.0)]),
        Doubles {
            dispatcher: Some(Arc::new(FailingDispatcher)),
            ..Doubles::default()
        },
    )
    .await;
    let learner = token("learner-resubmits", ROLE_LEARNER);
    let attempt_id = app.start_attempt(&learner, WRITING_PROMPT, "writing").await;
    let (status, _) = app
        .send(
            "PUT",
            &format!("/api/v1/attempts/{}/content", attempt_id),
            &learner,
            Some(json!({ "content": words(260) })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // Dispatch fails: attempt back to IN_PROGRESS, its job left QUEUED.
    let (status, _) = app
        .send(
            "POST",
            &format!("/api/v1/attempts/{}/submit/writing", attempt_id),
            &learner,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let job = app.store.find_job_for_attempt(&attempt_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    // A sweep claims the job and reads the attempt as IN_PROGRESS; the learner
    // resubmits before the sweep settles the job.
    flaky.resubmit_after_next_read(&attempt_id);
    let outcome = app.state.orchestrator.process_job(&job.id).await.unwrap();
    assert!(
        matches!(outcome, ProcessOutcome::Requeued { retry_count: 0, .. }),
        "{:?}",
        outcome
    );

    let attempt = app.store.find_attempt(&attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Processing);
    let requeued = app.store.find_job(&job.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);

    let outcome = app.state.orchestrator.process_job(&job.id).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Scored { overall_band: 7.0 });
    let attempt = app.store.find_attempt(&attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Scored);
}

#[tokio::test]
async fn notification_failure_does_not_fail_the_job() {
    let notifier = Arc::new(FailingNotifier::default());
    let app = create_test_app_with_doubles(
        ScriptedScorer::new(vec![Reply::Band(6.5)]),
        Doubles {
            notifier: Some(notifier.clone()),
            ..Doubles::default()
        },
    )
    .await;
    let learner = token("learner-unreachable", ROLE_LEARNER);
    let (attempt_id, job_id) = app.submitted_writing(&learner, 260).await;

    let outcome = app.state.orchestrator.process_job(&job_id).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Scored { overall_band: 6.5 });

    for _ in 0..100 {
        if notifier.calls() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(notifier.calls(), 1);

    let job = app.store.find_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let attempt = app.store.find_attempt(&attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Scored);
}
