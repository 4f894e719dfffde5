use anyhow::Result;
use async_trait::async_trait;

use crate::models::SkillType;

/// Sent once a job completes, including completed-with-issues.
#[derive(Debug, Clone)]
pub struct ScoringNotification {
    pub learner_id: String,
    pub attempt_id: String,
    pub skill_type: SkillType,
    pub overall_band: f64,
    pub completed_with_issues: bool,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_scored(&self, notification: &ScoringNotification) -> Result<()>;
}

/// Default sink: records the event in the log stream.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify_scored(&self, notification: &ScoringNotification) -> Result<()> {
        tracing::info!(
            learner = %notification.learner_id,
            attempt = %notification.attempt_id,
            skill = notification.skill_type.as_str(),
            band = notification.overall_band,
            with_issues = notification.completed_with_issues,
            "Learner notified of scoring result"
        );
        Ok(())
    }
}
