//! Answer scoring collaborator.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MIN_KEYWORD_CHARS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Public struct `ScoringRequest` used across orchestrator and scorer components.
pub struct ScoringRequest {
    pub question: String,
    pub response: String,
    pub ideal_answer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoringError {
    #[error("no ideal answer configured for question")]
    MissingIdealAnswer,
    #[error("scoring backend unavailable: {0}")]
    Unavailable(String),
    #[error("scoring backend returned out-of-range score {0}")]
    OutOfRange(i64),
}

#[async_trait]
/// Trait contract for `ScoringProvider` behavior.
pub trait ScoringProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Returns a score in `0..=100`.
    async fn evaluate(&self, request: ScoringRequest) -> Result<u8, ScoringError>;
}

/// Scores a response by the share of ideal-answer keywords it mentions.
#[derive(Debug, Clone, Default)]
pub struct KeywordOverlapScorer;

#[async_trait]
impl ScoringProvider for KeywordOverlapScorer {
    fn provider_name(&self) -> &'static str {
        "keyword-overlap"
    }

    async fn evaluate(&self, request: ScoringRequest) -> Result<u8, ScoringError> {
        let ideal = request
            .ideal_answer
            .as_deref()
            .map(keywords)
            .filter(|set| !set.is_empty())
            .ok_or(ScoringError::MissingIdealAnswer)?;
        let answered = keywords(&request.response);
        let hits = ideal.intersection(&answered).count();
        let score = hits.saturating_mul(100) / ideal.len();
        u8::try_from(score.min(100)).map_err(|_| ScoringError::OutOfRange(score as i64))
    }
}

fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| word.chars().count() >= MIN_KEYWORD_CHARS)
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(response: &str, ideal: Option<&str>) -> ScoringRequest {
        ScoringRequest {
            question: "Which tools do you use?".to_string(),
            response: response.to_string(),
            ideal_answer: ideal.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn unit_keyword_overlap_scores_share_of_ideal_keywords() {
        let scorer = KeywordOverlapScorer;
        let score = scorer
            .evaluate(request("I use Excel and SQL daily", Some("excel, sql, python, tableau")))
            .await
            .expect("score");
        assert_eq!(score, 50);
        let full = scorer
            .evaluate(request("PYTHON tableau excel sql", Some("excel sql python tableau")))
            .await
            .expect("score");
        assert_eq!(full, 100);
    }

    #[tokio::test]
    async fn regression_missing_ideal_answer_is_reported_not_zeroed() {
        let scorer = KeywordOverlapScorer;
        assert_eq!(
            scorer.evaluate(request("anything", None)).await,
            Err(ScoringError::MissingIdealAnswer)
        );
        assert_eq!(
            scorer.evaluate(request("anything", Some("a b"))).await,
            Err(ScoringError::MissingIdealAnswer)
        );
    }
}
