//! Candidate directory contract: tenant resolution and interview lookup.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parley_types::{CandidateProfile, InterviewDefinition};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("contact '{contact_id}' is registered under several tenants: {tenants:?}")]
    AmbiguousTenant {
        contact_id: String,
        tenants: Vec<String>,
    },
    #[error("candidate directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
/// Trait contract for `CandidateDirectory` behavior.
pub trait CandidateDirectory: Send + Sync {
    /// Finds the tenant owning `contact_id`; `Ok(None)` when unknown.
    async fn resolve_tenant(&self, contact_id: &str) -> Result<Option<String>, DirectoryError>;

    async fn find_candidate(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Option<CandidateProfile>, DirectoryError>;

    /// The tenant's currently open job interview, if any.
    async fn active_interview(
        &self,
        tenant_id: &str,
    ) -> Result<Option<InterviewDefinition>, DirectoryError>;
}

#[derive(Debug, Default)]
struct DirectoryState {
    candidates: BTreeMap<String, HashMap<String, CandidateProfile>>,
    interviews: HashMap<String, InterviewDefinition>,
}

/// In-memory candidate directory loaded from a tenant roster.
#[derive(Debug, Default)]
pub struct InMemoryCandidateDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryCandidateDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_candidate(&self, tenant_id: &str, candidate: CandidateProfile) {
        self.state
            .write()
            .await
            .candidates
            .entry(tenant_id.to_string())
            .or_default()
            .insert(candidate.contact_id.clone(), candidate);
    }

    pub async fn set_active_interview(&self, tenant_id: &str, interview: InterviewDefinition) {
        self.state
            .write()
            .await
            .interviews
            .insert(tenant_id.to_string(), interview);
    }

    pub async fn clear_active_interview(&self, tenant_id: &str) {
        self.state.write().await.interviews.remove(tenant_id);
    }
}

#[async_trait]
impl CandidateDirectory for InMemoryCandidateDirectory {
    async fn resolve_tenant(&self, contact_id: &str) -> Result<Option<String>, DirectoryError> {
        let state = self.state.read().await;
        let tenants = state
            .candidates
            .iter()
            .filter(|(_, contacts)| contacts.contains_key(contact_id))
            .map(|(tenant_id, _)| tenant_id.clone())
            .collect::<Vec<_>>();
        match tenants.len() {
            0 => Ok(None),
            1 => Ok(tenants.into_iter().next()),
            _ => Err(DirectoryError::AmbiguousTenant {
                contact_id: contact_id.to_string(),
                tenants,
            }),
        }
    }

    async fn find_candidate(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Option<CandidateProfile>, DirectoryError> {
        Ok(self
            .state
            .read()
            .await
            .candidates
            .get(tenant_id)
            .and_then(|contacts| contacts.get(contact_id))
            .cloned())
    }

    async fn active_interview(
        &self,
        tenant_id: &str,
    ) -> Result<Option<InterviewDefinition>, DirectoryError> {
        Ok(self.state.read().await.interviews.get(tenant_id).cloned())
    }
}
