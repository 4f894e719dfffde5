use serde::{Deserialize, Serialize};

use super::SkillType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    WritingTask1,
    WritingTask2,
    SpeakingPart1,
    SpeakingPart2,
    SpeakingPart3,
}

impl TaskType {
    pub fn skill(&self) -> SkillType {
        match self {
            TaskType::WritingTask1 | TaskType::WritingTask2 => SkillType::Writing,
            _ => SkillType::Speaking,
        }
    }

    /// Short-form writing needs 150 words, long-form 250. Speaking has no minimum.
    pub fn min_word_count(&self) -> u32 {
        match self {
            TaskType::WritingTask1 => 150,
            TaskType::WritingTask2 => 250,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    #[serde(rename = "_id")]
    pub id: String,
    pub skill_type: SkillType,
    pub task_type: TaskType,
    pub title: String,
    pub text: String,
}
