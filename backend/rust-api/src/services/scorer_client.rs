use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::ScorerSettings;
use crate::metrics::track_scorer_request;
use crate::models::{DetailedFeedback, SubScores};
use crate::services::scoring_feedback::{
    clamp_confidence, detailed_feedback, normalize_band, summary, SpeakingCriteria,
    WritingCriteria,
};

const UNINTELLIGIBLE_MARKER: &str = "could not extract meaningful";

#[derive(Debug, Error)]
pub enum ScorerError {
    /// Transport failure, timeout, non-2xx or undecodable body. Retryable.
    #[error("scoring unavailable: {0}")]
    Unavailable(String),

    /// The scorer read the input and found nothing to score. Not retryable.
    #[error("unintelligible input: {0}")]
    Unintelligible(String),
}

/// Canonical scorer result, independent of which endpoint produced it.
#[derive(Debug, Clone)]
pub struct ScoringOutcome {
    pub overall_band: f64,
    pub confidence: Option<f64>,
    pub sub_scores: SubScores,
    pub feedback: String,
    pub detailed_feedback: DetailedFeedback,
    pub transcript: Option<String>,
    pub raw_response: Value,
}

#[derive(Debug, Clone)]
pub struct AudioInput {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
}

#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score_writing(
        &self,
        prompt: Option<&str>,
        essay: &str,
    ) -> Result<ScoringOutcome, ScorerError>;

    async fn score_speaking_text(&self, answer_text: &str) -> Result<ScoringOutcome, ScorerError>;

    async fn score_speaking_audio(&self, audio: AudioInput)
        -> Result<ScoringOutcome, ScorerError>;

    async fn health(&self) -> Result<Value, ScorerError>;
}

#[derive(Debug, Default, Deserialize)]
struct WritingFeedbackBody {
    #[serde(default)]
    task_response: String,
    #[serde(default)]
    coherence_cohesion: String,
    #[serde(default)]
    vocabulary: String,
    #[serde(default)]
    grammar: String,
}

#[derive(Debug, Deserialize)]
struct WritingScoreBody {
    overall_band: f64,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    feedback: WritingFeedbackBody,
}

#[derive(Debug, Default, Deserialize)]
struct SpeakingFeedbackBody {
    #[serde(default)]
    fluency_coherence: String,
    #[serde(default)]
    vocabulary: String,
    #[serde(default)]
    grammar: String,
    #[serde(default)]
    pronunciation: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptInfoBody {
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SpeakingScoreBody {
    approx_ielts_band: f64,
    #[serde(default)]
    feedback: SpeakingFeedbackBody,
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default)]
    transcript_info: Option<TranscriptInfoBody>,
}

/// HTTP client for the remote band scorer.
#[derive(Clone)]
pub struct RemoteScorerClient {
    http: Client,
    base_url: String,
    settings: ScorerSettings,
}

impl RemoteScorerClient {
    pub fn new(settings: ScorerSettings) -> Self {
        Self {
            http: Client::new(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            settings,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<Value, ScorerError> {
        let response = request.timeout(timeout).send().await.map_err(|err| {
            if err.is_timeout() {
                ScorerError::Unavailable(format!("scorer timed out after {:?}", timeout))
            } else {
                ScorerError::Unavailable(format!("scorer request failed: {}", err))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ScorerError::Unavailable(format!("failed to read body: {}", err)))?;

        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|err| ScorerError::Unavailable(format!("invalid scorer response: {}", err)))
    }

    fn speaking_outcome(raw: Value) -> Result<ScoringOutcome, ScorerError> {
        let body: SpeakingScoreBody = decode(&raw)?;
        let criteria = SpeakingCriteria {
            fluency_coherence: &body.feedback.fluency_coherence,
            vocabulary: &body.feedback.vocabulary,
            grammar: &body.feedback.grammar,
            pronunciation: &body.feedback.pronunciation,
        };
        let overall_band = normalize_band(body.approx_ielts_band);

        Ok(ScoringOutcome {
            overall_band,
            confidence: body
                .transcript_info
                .as_ref()
                .and_then(|info| info.confidence)
                .map(clamp_confidence),
            sub_scores: criteria.sub_scores(overall_band),
            feedback: summary(&criteria.labelled()),
            detailed_feedback: detailed_feedback(&criteria.labelled()),
            transcript: body.transcript.clone(),
            raw_response: raw,
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(raw: &Value) -> Result<T, ScorerError> {
    serde_json::from_value(raw.clone())
        .map_err(|err| ScorerError::Unavailable(format!("unexpected scorer payload: {}", err)))
}

fn classify_failure(status: StatusCode, body: &str) -> ScorerError {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("detail")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string());

    if detail.to_lowercase().contains(UNINTELLIGIBLE_MARKER) {
        ScorerError::Unintelligible(detail)
    } else {
        ScorerError::Unavailable(format!("scorer returned {}: {}", status, detail))
    }
}

#[async_trait]
impl Scorer for RemoteScorerClient {
    async fn score_writing(
        &self,
        prompt: Option<&str>,
        essay: &str,
    ) -> Result<ScoringOutcome, ScorerError> {
        let request = self
            .http
            .post(self.url("/api/writing/score"))
            .json(&json!({ "prompt": prompt, "essay": essay }));

        let raw = track_scorer_request(
            "writing",
            self.send(request, self.settings.writing_timeout()),
        )
        .await?;

        let body: WritingScoreBody = decode(&raw)?;
        let criteria = WritingCriteria {
            task_response: &body.feedback.task_response,
            coherence_cohesion: &body.feedback.coherence_cohesion,
            vocabulary: &body.feedback.vocabulary,
            grammar: &body.feedback.grammar,
        };
        let overall_band = normalize_band(body.overall_band);

        Ok(ScoringOutcome {
            overall_band,
            confidence: body.confidence.map(clamp_confidence),
            sub_scores: criteria.sub_scores(overall_band),
            feedback: summary(&criteria.labelled()),
            detailed_feedback: detailed_feedback(&criteria.labelled()),
            transcript: None,
            raw_response: raw,
        })
    }

    async fn score_speaking_text(&self, answer_text: &str) -> Result<ScoringOutcome, ScorerError> {
        let request = self
            .http
            .post(self.url("/api/speaking/score-text"))
            .json(&json!({ "answer_text": answer_text }));

        let raw = track_scorer_request(
            "speaking_text",
            self.send(request, self.settings.speaking_timeout()),
        )
        .await?;

        Self::speaking_outcome(raw)
    }

    async fn score_speaking_audio(
        &self,
        audio: AudioInput,
    ) -> Result<ScoringOutcome, ScorerError> {
        let part = multipart::Part::bytes(audio.bytes)
            .file_name(audio.file_name)
            .mime_str(&audio.mime_type)
            .map_err(|err| ScorerError::Unavailable(format!("invalid audio part: {}", err)))?;

        let request = self
            .http
            .post(self.url("/api/speaking/score-audio"))
            .query(&[("language", self.settings.language.as_str())])
            .multipart(multipart::Form::new().part("audio", part));

        let raw = track_scorer_request(
            "speaking_audio",
            self.send(request, self.settings.audio_timeout()),
        )
        .await?;

        Self::speaking_outcome(raw)
    }

    async fn health(&self) -> Result<Value, ScorerError> {
        let request = self.http.get(self.url("/health"));
        track_scorer_request("health", self.send(request, Duration::from_secs(5))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RemoteScorerClient {
        RemoteScorerClient::new(ScorerSettings {
            base_url: format!("{}/", server.uri()),
            writing_timeout_secs: 2,
            speaking_timeout_secs: 1,
            transcription_timeout_secs: 1,
            language: "en".to_string(),
        })
    }

    #[tokio::test]
    async fn writing_score_is_normalised_and_kept_verbatim() {
        let server = MockServer::start().await;
        let payload = json!({
            "overall_band": 6.7,
            "confidence": 0.41,
            "top_predictions": [{"band": 6.5, "probability": 0.41}],
            "feedback": {
                "task_response": "Good position throughout.",
                "coherence_cohesion": "Paragraphing is unclear.",
                "vocabulary": "Adequate range. Try less common collocations.",
                "grammar": "Ngữ pháp khá tốt với một số lỗi nhỏ."
            }
        });
        Mock::given(method("POST"))
            .and(path("/api/writing/score"))
            .and(body_partial_json(json!({"essay": "My essay", "prompt": "Topic"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(payload.clone()))
            .mount(&server)
            .await;

        let outcome = client(&server)
            .score_writing(Some("Topic"), "My essay")
            .await
            .unwrap();

        assert_eq!(outcome.overall_band, 6.5);
        assert_eq!(outcome.confidence, Some(0.41));
        assert_eq!(outcome.sub_scores.task_achievement, Some(7.0));
        assert_eq!(outcome.sub_scores.coherence_cohesion, Some(6.0));
        assert_eq!(outcome.sub_scores.grammatical_range, 6.5);
        assert_eq!(outcome.raw_response, payload);
        assert!(!outcome.detailed_feedback.suggestions.is_empty());
        assert!(outcome.feedback.starts_with("Task response: Good position"));
    }

    #[tokio::test]
    async fn audio_score_uses_transcript_confidence() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/speaking/score-audio"))
            .and(query_param("language", "en"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "transcript": "I usually spend weekends with my family.",
                "transcript_info": {
                    "language": "en",
                    "duration_seconds": 45.0,
                    "word_count": 7,
                    "confidence": 1.4
                },
                "cefr_level": "B2",
                "approx_ielts_band": 6.5,
                "feedback": {
                    "fluency_coherence": "Bạn có thể duy trì bài nói.",
                    "vocabulary": "Vốn từ tốt.",
                    "grammar": "Kiểm soát tốt các cấu trúc đơn giản.",
                    "pronunciation": "Phát âm khá rõ ràng."
                }
            })))
            .mount(&server)
            .await;

        let outcome = client(&server)
            .score_speaking_audio(AudioInput {
                bytes: vec![0u8; 16],
                file_name: "answer.webm".to_string(),
                mime_type: "audio/webm".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(outcome.overall_band, 6.5);
        assert_eq!(outcome.confidence, Some(1.0));
        assert_eq!(
            outcome.transcript.as_deref(),
            Some("I usually spend weekends with my family.")
        );
        assert_eq!(outcome.sub_scores.lexical_resource, 7.0);
        assert!(outcome.sub_scores.fluency_coherence.is_some());
    }

    #[tokio::test]
    async fn text_score_has_no_confidence() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/speaking/score-text"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cefr_level": "B1",
                "approx_ielts_band": 5.0,
                "feedback": {}
            })))
            .mount(&server)
            .await;

        let outcome = client(&server)
            .score_speaking_text("Well I think so")
            .await
            .unwrap();
        assert_eq!(outcome.overall_band, 5.0);
        assert_eq!(outcome.confidence, None);
        assert_eq!(outcome.feedback, "");
    }

    #[tokio::test]
    async fn meaningless_audio_is_unintelligible() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/speaking/score-audio"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "detail": "Could not extract meaningful text from audio. Please ensure clear speech."
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .score_speaking_audio(AudioInput {
                bytes: vec![1, 2, 3],
                file_name: "silence.wav".to_string(),
                mime_type: "audio/wav".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ScorerError::Unintelligible(_)));
    }

    #[tokio::test]
    async fn server_errors_and_bad_bodies_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/writing/score"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": "Internal Server Error",
                "detail": "CUDA out of memory"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/speaking/score-text"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let scorer = client(&server);
        let err = scorer.score_writing(None, "essay").await.unwrap_err();
        assert!(matches!(err, ScorerError::Unavailable(ref msg) if msg.contains("CUDA")));

        let err = scorer.score_speaking_text("answer").await.unwrap_err();
        assert!(matches!(err, ScorerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn slow_scorer_times_out_as_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/speaking/score-text"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(3))
                    .set_body_json(json!({"approx_ielts_band": 6.0})),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .score_speaking_text("answer")
            .await
            .unwrap_err();
        assert!(matches!(err, ScorerError::Unavailable(ref msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn health_returns_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "healthy"})))
            .mount(&server)
            .await;

        let health = client(&server).health().await.unwrap();
        assert_eq!(health["status"], "healthy");
    }

    #[test]
    fn unintelligible_marker_is_case_insensitive() {
        let err = classify_failure(StatusCode::BAD_REQUEST, "COULD NOT EXTRACT MEANINGFUL text");
        assert!(matches!(err, ScorerError::Unintelligible(_)));
        let err = classify_failure(StatusCode::BAD_REQUEST, r#"{"detail":"Empty audio file"}"#);
        assert!(matches!(err, ScorerError::Unavailable(_)));
    }
}
