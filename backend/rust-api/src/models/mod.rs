pub mod attempt;
pub mod media;
pub mod prompt;
pub mod requests;
pub mod score;
pub mod scoring_job;

pub use attempt::{Attempt, AttemptStatus, AttemptTransition, SkillType, TeacherEvaluation};
pub use media::AttemptMedia;
pub use prompt::{Prompt, TaskType};
pub use score::{DetailedFeedback, Score, SubScores};
pub use scoring_job::{JobStatus, ScoringJob};
