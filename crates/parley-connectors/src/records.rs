//! Interview record persistence contract and in-memory backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_types::{InterviewStatus, RecordedResponse};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors returned by interview record stores.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("interview record '{0}' not found")]
    RecordNotFound(String),
    #[error("interview record '{record_id}' is already {status}")]
    RecordClosed {
        record_id: String,
        status: InterviewStatus,
    },
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Fields needed to open a record when a session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewRecordDraft {
    pub tenant_id: String,
    pub contact_id: String,
    pub candidate_id: String,
    pub interview_id: String,
    pub question_count: usize,
    pub started_at: DateTime<Utc>,
}

/// Persisted interview record as exported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewRecord {
    pub record_id: String,
    pub tenant_id: String,
    pub contact_id: String,
    pub candidate_id: String,
    pub interview_id: String,
    pub question_count: usize,
    pub status: InterviewStatus,
    pub responses: Vec<RecordedResponse>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
/// Async record contract invoked by the interview effect executor.
pub trait InterviewRecordStore: Send + Sync {
    async fn create_interview_record(
        &self,
        draft: InterviewRecordDraft,
    ) -> Result<String, PersistenceError>;

    async fn append_response(
        &self,
        record_id: &str,
        response: &RecordedResponse,
    ) -> Result<(), PersistenceError>;

    async fn update_interview_status(
        &self,
        record_id: &str,
        status: InterviewStatus,
    ) -> Result<(), PersistenceError>;
}

static RECORD_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// In-memory implementation for tests, replay runs and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryInterviewRecordStore {
    records: RwLock<BTreeMap<String, InterviewRecord>>,
}

impl InMemoryInterviewRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, record_id: &str) -> Option<InterviewRecord> {
        self.records.read().await.get(record_id).cloned()
    }

    /// All records ordered by id.
    pub async fn records(&self) -> Vec<InterviewRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn records_for_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Vec<InterviewRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|record| record.tenant_id == tenant_id && record.contact_id == contact_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl InterviewRecordStore for InMemoryInterviewRecordStore {
    async fn create_interview_record(
        &self,
        draft: InterviewRecordDraft,
    ) -> Result<String, PersistenceError> {
        let sequence = RECORD_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let record_id = format!("interview-{sequence:06}");
        let record = InterviewRecord {
            record_id: record_id.clone(),
            tenant_id: draft.tenant_id,
            contact_id: draft.contact_id,
            candidate_id: draft.candidate_id,
            interview_id: draft.interview_id,
            question_count: draft.question_count,
            status: InterviewStatus::AwaitingResponse { question_index: 0 },
            responses: Vec::new(),
            started_at: draft.started_at,
            updated_at: draft.started_at,
        };
        self.records.write().await.insert(record_id.clone(), record);
        Ok(record_id)
    }

    async fn append_response(
        &self,
        record_id: &str,
        response: &RecordedResponse,
    ) -> Result<(), PersistenceError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(record_id)
            .ok_or_else(|| PersistenceError::RecordNotFound(record_id.to_string()))?;
        if record.status.is_terminal() {
            return Err(PersistenceError::RecordClosed {
                record_id: record_id.to_string(),
                status: record.status,
            });
        }
        record.responses.push(response.clone());
        record.updated_at = response.recorded_at;
        Ok(())
    }

    async fn update_interview_status(
        &self,
        record_id: &str,
        status: InterviewStatus,
    ) -> Result<(), PersistenceError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(record_id)
            .ok_or_else(|| PersistenceError::RecordNotFound(record_id.to_string()))?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> InterviewRecordDraft {
        InterviewRecordDraft {
            tenant_id: "acme".to_string(),
            contact_id: "+100".to_string(),
            candidate_id: "cand-1".to_string(),
            interview_id: "int-1".to_string(),
            question_count: 2,
            started_at: Utc::now(),
        }
    }

    fn response(question_index: usize) -> RecordedResponse {
        RecordedResponse {
            question_index,
            text: format!("answer {question_index}"),
            pending_transcription: false,
            audio_ref: None,
            score: None,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn functional_record_lifecycle_appends_and_updates_status() {
        let store = InMemoryInterviewRecordStore::new();
        let record_id = store.create_interview_record(draft()).await.expect("create");
        store
            .append_response(&record_id, &response(0))
            .await
            .expect("append");
        store
            .update_interview_status(&record_id, InterviewStatus::Completed)
            .await
            .expect("status");

        let record = store.get(&record_id).await.expect("record");
        assert_eq!(record.responses.len(), 1);
        assert_eq!(record.status, InterviewStatus::Completed);
        assert_eq!(store.records_for_contact("acme", "+100").await.len(), 1);
        assert!(store.records_for_contact("globex", "+100").await.is_empty());
    }

    #[tokio::test]
    async fn regression_append_to_closed_or_unknown_record_fails() {
        let store = InMemoryInterviewRecordStore::new();
        assert_eq!(
            store.append_response("missing", &response(0)).await,
            Err(PersistenceError::RecordNotFound("missing".to_string()))
        );
        let record_id = store.create_interview_record(draft()).await.expect("create");
        store
            .update_interview_status(&record_id, InterviewStatus::Cancelled)
            .await
            .expect("cancel");
        assert!(matches!(
            store.append_response(&record_id, &response(0)).await,
            Err(PersistenceError::RecordClosed { .. })
        ));
    }
}
