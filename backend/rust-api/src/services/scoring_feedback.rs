//! Band normalisation and the keyword heuristics that turn per-criterion feedback text
//! into criterion bands and learner-facing strengths/weaknesses.
//!
//! The remote scorer only returns an overall band plus one feedback paragraph per
//! criterion (English or Vietnamese). Criterion bands are the overall band nudged by half
//! a band when the paragraph reads clearly positive or clearly negative.

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::{DetailedFeedback, SkillType, SubScores};

pub const MIN_BAND: f64 = 0.0;
pub const MAX_BAND: f64 = 9.0;

lazy_static! {
    static ref POSITIVE: Regex = keyword_regex(&[
        // en
        "excellent", "good", "great", "clear", "clearly", "fluent", "fluently", "rich",
        "varied", "accurate", "accurately", "natural", "naturally", "strong", "effective",
        "effectively", "logical", "coherent", "impressive", "well organised", "well organized",
        // vi
        "tốt", "xuất sắc", "rõ ràng", "trôi chảy", "phong phú", "chính xác", "tự nhiên",
        "hoàn hảo", "hợp lý", "thành thạo", "hiệu quả", "tuyệt vời", "chặt chẽ", "mượt mà",
    ]);

    static ref NEGATIVE: Regex = keyword_regex(&[
        // en
        "limited", "error", "errors", "mistake", "mistakes", "weak", "poor", "unclear",
        "inaccurate", "repetitive", "hesitant", "hesitation", "lacks", "lacking",
        "insufficient", "basic", "unintelligible",
        // vi
        "hạn chế", "lỗi", "chưa", "khó hiểu", "chậm", "lặp lại", "cơ bản", "cải thiện",
        "do dự", "thiếu", "yếu",
    ]);

    static ref ADVICE: Regex = keyword_regex(&[
        // en
        "should", "try", "practice", "practise", "consider", "focus on", "work on", "learn",
        // vi
        "hãy", "cần", "luyện", "nên", "tập trung", "học thêm", "thử",
    ]);

    static ref SENTENCE_END: Regex = Regex::new(r"[.!?]+(?:\s+|$)").unwrap();
}

fn keyword_regex(words: &[&str]) -> Regex {
    let alternation = words
        .iter()
        .map(|word| regex::escape(word).replace(' ', r"\s+"))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentiment {
    Positive,
    Negative,
    Mixed,
    Neutral,
}

pub fn sentiment(text: &str) -> Sentiment {
    match (POSITIVE.is_match(text), NEGATIVE.is_match(text)) {
        (true, false) => Sentiment::Positive,
        (false, true) => Sentiment::Negative,
        (true, true) => Sentiment::Mixed,
        (false, false) => Sentiment::Neutral,
    }
}

/// Rounds to the nearest half band and clamps into 0..=9. Non-finite input maps to 0.
pub fn normalize_band(raw: f64) -> f64 {
    if !raw.is_finite() {
        return MIN_BAND;
    }
    ((raw * 2.0).round() / 2.0).clamp(MIN_BAND, MAX_BAND)
}

pub fn clamp_confidence(raw: f64) -> f64 {
    if raw.is_finite() {
        raw.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Criterion band: overall band nudged +0.5 for positive-only feedback, -0.5 for
/// negative-only feedback.
pub fn criterion_band(overall: f64, feedback: &str) -> f64 {
    let nudge = match sentiment(feedback) {
        Sentiment::Positive => 0.5,
        Sentiment::Negative => -0.5,
        Sentiment::Mixed | Sentiment::Neutral => 0.0,
    };
    normalize_band(overall + nudge)
}

/// One criterion's feedback paragraph.
#[derive(Debug, Clone, Copy)]
pub struct Criterion<'a> {
    pub label: &'static str,
    pub text: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct WritingCriteria<'a> {
    pub task_response: &'a str,
    pub coherence_cohesion: &'a str,
    pub vocabulary: &'a str,
    pub grammar: &'a str,
}

impl<'a> WritingCriteria<'a> {
    pub fn labelled(&self) -> [Criterion<'a>; 4] {
        [
            Criterion { label: "Task response", text: self.task_response },
            Criterion { label: "Coherence and cohesion", text: self.coherence_cohesion },
            Criterion { label: "Vocabulary", text: self.vocabulary },
            Criterion { label: "Grammar", text: self.grammar },
        ]
    }

    pub fn sub_scores(&self, overall: f64) -> SubScores {
        SubScores {
            task_achievement: Some(criterion_band(overall, self.task_response)),
            coherence_cohesion: Some(criterion_band(overall, self.coherence_cohesion)),
            lexical_resource: criterion_band(overall, self.vocabulary),
            grammatical_range: criterion_band(overall, self.grammar),
            ..SubScores::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpeakingCriteria<'a> {
    pub fluency_coherence: &'a str,
    pub vocabulary: &'a str,
    pub grammar: &'a str,
    pub pronunciation: &'a str,
}

impl<'a> SpeakingCriteria<'a> {
    pub fn labelled(&self) -> [Criterion<'a>; 4] {
        [
            Criterion { label: "Fluency and coherence", text: self.fluency_coherence },
            Criterion { label: "Vocabulary", text: self.vocabulary },
            Criterion { label: "Grammar", text: self.grammar },
            Criterion { label: "Pronunciation", text: self.pronunciation },
        ]
    }

    pub fn sub_scores(&self, overall: f64) -> SubScores {
        SubScores {
            fluency_coherence: Some(criterion_band(overall, self.fluency_coherence)),
            pronunciation: Some(criterion_band(overall, self.pronunciation)),
            lexical_resource: criterion_band(overall, self.vocabulary),
            grammatical_range: criterion_band(overall, self.grammar),
            ..SubScores::default()
        }
    }
}

/// Flat "Label: text" summary, one criterion per line.
pub fn summary(criteria: &[Criterion<'_>]) -> String {
    criteria
        .iter()
        .filter(|criterion| !criterion.text.trim().is_empty())
        .map(|criterion| format!("{}: {}", criterion.label, criterion.text.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Sorts every feedback sentence into suggestions (advice), strengths (positive only)
/// or areas for improvement (any negative marker).
pub fn detailed_feedback(criteria: &[Criterion<'_>]) -> DetailedFeedback {
    let mut detailed = DetailedFeedback::default();

    for criterion in criteria {
        for sentence in sentences(criterion.text) {
            let line = format!("{}: {}", criterion.label, sentence);
            if ADVICE.is_match(sentence) {
                detailed.suggestions.push(line);
                continue;
            }
            match sentiment(sentence) {
                Sentiment::Positive => detailed.strengths.push(line),
                Sentiment::Negative | Sentiment::Mixed => {
                    detailed.areas_for_improvement.push(line)
                }
                Sentiment::Neutral => {}
            }
        }
    }

    detailed
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    SENTENCE_END
        .split(text)
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
}

/// Fixed feedback for input the scorer could not read.
pub fn unintelligible_feedback(skill: SkillType, reason: &str) -> (String, DetailedFeedback) {
    let (what, suggestion) = match skill {
        SkillType::Speaking => (
            "The recording could not be understood",
            "Record again in a quiet place, speak clearly and keep the microphone close.",
        ),
        SkillType::Writing => (
            "The essay could not be assessed",
            "Write complete sentences in English that answer the prompt.",
        ),
    };

    let detailed = DetailedFeedback {
        strengths: Vec::new(),
        areas_for_improvement: vec![format!("{}: {}", what, reason)],
        suggestions: vec![suggestion.to_string()],
    };
    (format!("{}. {}", what, suggestion), detailed)
}
