//! Tenant roster file: slots, gateway tokens, candidates, active interview,
//! invitation lists and replayable audio media.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use parley_connectors::{InMemoryAudioStore, InMemoryCandidateDirectory};
use parley_orchestrator::InterviewEngine;
use parley_types::{CandidateProfile, InterviewDefinition};
use serde::{Deserialize, Serialize};

pub(crate) const ROSTER_SCHEMA_VERSION: u32 = 1;
const DEFAULT_AUDIO_MIME_TYPE: &str = "audio/ogg";

fn roster_schema_version() -> u32 {
    ROSTER_SCHEMA_VERSION
}

fn default_slot_connected() -> bool {
    true
}

fn default_audio_mime_type() -> String {
    DEFAULT_AUDIO_MIME_TYPE.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct RosterFile {
    #[serde(default = "roster_schema_version")]
    pub(crate) schema_version: u32,
    #[serde(default)]
    pub(crate) tenants: Vec<RosterTenant>,
    #[serde(default)]
    pub(crate) media: Vec<RosterMedia>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct RosterTenant {
    pub(crate) tenant_id: String,
    #[serde(default)]
    pub(crate) gateway_token: Option<String>,
    #[serde(default)]
    pub(crate) slots: Vec<RosterSlot>,
    #[serde(default)]
    pub(crate) candidates: Vec<CandidateProfile>,
    #[serde(default)]
    pub(crate) interview: Option<InterviewDefinition>,
    #[serde(default)]
    pub(crate) invitations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct RosterSlot {
    pub(crate) slot_number: u32,
    pub(crate) identity: String,
    #[serde(default = "default_slot_connected")]
    pub(crate) connected: bool,
}

/// Channel media an `audio_ref` in the inbound log points at. The transcript
/// text stands in for the audio bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct RosterMedia {
    pub(crate) audio_ref: String,
    pub(crate) transcript: String,
    #[serde(default = "default_audio_mime_type")]
    pub(crate) mime_type: String,
}

impl RosterFile {
    pub(crate) fn tenant(&self, tenant_id: &str) -> Option<&RosterTenant> {
        self.tenants
            .iter()
            .find(|tenant| tenant.tenant_id == tenant_id)
    }

    pub(crate) fn gateway_tokens(&self) -> BTreeMap<String, String> {
        self.tenants
            .iter()
            .filter_map(|tenant| {
                tenant
                    .gateway_token
                    .as_deref()
                    .map(str::trim)
                    .filter(|token| !token.is_empty())
                    .map(|token| (tenant.tenant_id.clone(), token.to_string()))
            })
            .collect()
    }

    fn validate(&self, path: &Path) -> Result<()> {
        if self.schema_version != ROSTER_SCHEMA_VERSION {
            bail!(
                "unsupported roster schema_version {} in {} (expected {})",
                self.schema_version,
                path.display(),
                ROSTER_SCHEMA_VERSION
            );
        }
        let mut tenant_ids = BTreeSet::new();
        for tenant in &self.tenants {
            let tenant_id = tenant.tenant_id.trim();
            if tenant_id.is_empty() {
                bail!("roster {} contains a tenant with an empty id", path.display());
            }
            if !tenant_ids.insert(tenant_id) {
                bail!(
                    "roster {} declares tenant '{}' more than once",
                    path.display(),
                    tenant_id
                );
            }
            let mut slot_numbers = BTreeSet::new();
            for slot in &tenant.slots {
                if !slot_numbers.insert(slot.slot_number) {
                    bail!(
                        "tenant '{}' declares slot {} more than once",
                        tenant_id,
                        slot.slot_number
                    );
                }
                if slot.identity.trim().is_empty() {
                    bail!(
                        "tenant '{}' slot {} has an empty identity",
                        tenant_id,
                        slot.slot_number
                    );
                }
            }
            for candidate in &tenant.candidates {
                if candidate.contact_id.trim().is_empty() {
                    bail!(
                        "tenant '{}' candidate '{}' has an empty contact id",
                        tenant_id,
                        candidate.candidate_id
                    );
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn load_roster(path: &Path) -> Result<RosterFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read tenant roster {}", path.display()))?;
    let parsed = serde_json::from_str::<RosterFile>(&raw)
        .with_context(|| format!("failed to parse tenant roster {}", path.display()))?;
    parsed.validate(path)?;
    Ok(parsed)
}

/// Loads candidates and active interviews into the directory.
pub(crate) async fn seed_directory(roster: &RosterFile, directory: &InMemoryCandidateDirectory) {
    for tenant in &roster.tenants {
        for candidate in &tenant.candidates {
            directory
                .upsert_candidate(&tenant.tenant_id, candidate.clone())
                .await;
        }
        if let Some(interview) = &tenant.interview {
            directory
                .set_active_interview(&tenant.tenant_id, interview.clone())
                .await;
        }
    }
}

pub(crate) async fn seed_audio_store(roster: &RosterFile, store: &InMemoryAudioStore) {
    for media in &roster.media {
        store
            .insert_media(
                &media.audio_ref,
                media.transcript.as_bytes().to_vec(),
                &media.mime_type,
            )
            .await;
    }
}

/// Connects every slot marked connected; returns the number bound.
pub(crate) fn connect_roster_slots(roster: &RosterFile, engine: &InterviewEngine) -> Result<usize> {
    let mut connected = 0_usize;
    for tenant in &roster.tenants {
        for slot in tenant.slots.iter().filter(|slot| slot.connected) {
            engine
                .connect_slot(&tenant.tenant_id, slot.slot_number, &slot.identity)
                .with_context(|| {
                    format!(
                        "failed to connect slot {} for tenant '{}'",
                        slot.slot_number, tenant.tenant_id
                    )
                })?;
            connected = connected.saturating_add(1);
        }
    }
    Ok(connected)
}

#[cfg(test)]
mod tests {
    use super::{load_roster, RosterFile, ROSTER_SCHEMA_VERSION};

    const SAMPLE_ROSTER: &str = r#"{
        "tenants": [
            {
                "tenant_id": "acme",
                "gateway_token": " token-acme ",
                "slots": [
                    { "slot_number": 1, "identity": "+5511000000001" },
                    { "slot_number": 2, "identity": "+5511000000002", "connected": false }
                ],
                "candidates": [
                    { "candidate_id": "cand-1", "contact_id": "5511999990001", "name": "Ana" }
                ],
                "interview": {
                    "interview_id": "int-1",
                    "questions": [{ "text": "Tell us about yourself" }]
                },
                "invitations": ["5511999990001"],
                "unknown_field": true
            },
            { "tenant_id": "globex", "gateway_token": "  " }
        ],
        "media": [{ "audio_ref": "media-1", "transcript": "hello" }]
    }"#;

    #[test]
    fn unit_roster_defaults_schema_version_and_slot_connection() {
        let roster: RosterFile = serde_json::from_str(SAMPLE_ROSTER).expect("parse");
        assert_eq!(roster.schema_version, ROSTER_SCHEMA_VERSION);
        let acme = roster.tenant("acme").expect("acme");
        assert!(acme.slots[0].connected);
        assert!(!acme.slots[1].connected);
        assert_eq!(roster.media[0].mime_type, "audio/ogg");
    }

    #[test]
    fn functional_gateway_tokens_skip_blank_entries() {
        let roster: RosterFile = serde_json::from_str(SAMPLE_ROSTER).expect("parse");
        let tokens = roster.gateway_tokens();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens.get("acme").map(String::as_str), Some("token-acme"));
    }

    #[test]
    fn functional_load_roster_reads_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("roster.json");
        std::fs::write(&path, SAMPLE_ROSTER).expect("write");
        let roster = load_roster(&path).expect("load");
        assert_eq!(roster.tenants.len(), 2);
    }

    #[test]
    fn regression_load_roster_rejects_duplicate_slots_and_schema() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("roster.json");
        std::fs::write(
            &path,
            r#"{"tenants":[{"tenant_id":"acme","slots":[
                {"slot_number":1,"identity":"a"},{"slot_number":1,"identity":"b"}]}]}"#,
        )
        .expect("write");
        let error = load_roster(&path).expect_err("duplicate slot");
        assert!(error.to_string().contains("more than once"));

        std::fs::write(&path, r#"{"schema_version":9}"#).expect("write");
        let error = load_roster(&path).expect_err("schema");
        assert!(error.to_string().contains("unsupported roster schema_version 9"));
    }
}
