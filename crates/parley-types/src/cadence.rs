use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `CadenceMode` values.
pub enum CadenceMode {
    Batch,
    Immediate,
}

impl CadenceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Immediate => "immediate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `DistributionPriority` values.
pub enum DistributionPriority {
    #[default]
    Normal,
    Urgent,
    Immediate,
}

impl DistributionPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Urgent => "urgent",
            Self::Immediate => "immediate",
        }
    }

    pub fn cadence_mode(self) -> CadenceMode {
        match self {
            Self::Immediate => CadenceMode::Immediate,
            Self::Normal | Self::Urgent => CadenceMode::Batch,
        }
    }
}

/// Contacts assigned to one slot of one tenant for one batch plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub tenant_id: String,
    pub slot_number: u32,
    pub contacts: Vec<String>,
    pub priority: DistributionPriority,
    pub pacing_delay_ms: u64,
    /// `contacts.len() * pacing_delay_ms`.
    pub estimated_completion_ms: u64,
    pub estimated_completion_at: DateTime<Utc>,
}

/// Public view of a tenant's cadence batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CadenceBatch {
    pub batch_id: u64,
    pub tenant_id: String,
    pub active: bool,
    pub mode: CadenceMode,
    pub started_at: DateTime<Utc>,
    pub contacts: Vec<String>,
    pub pacing_delay_ms: u64,
    pub sent: u64,
    pub errors: u64,
}

impl CadenceBatch {
    pub fn contains(&self, contact_id: &str) -> bool {
        self.contacts.iter().any(|existing| existing == contact_id)
    }

    /// Share of finished dispatches that succeeded; 1.0 before any dispatch.
    pub fn success_rate(&self) -> f64 {
        let finished = self.sent.saturating_add(self.errors);
        if finished == 0 {
            return 1.0;
        }
        self.sent as f64 / finished as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_success_rate_handles_empty_and_mixed_counters() {
        let mut batch = CadenceBatch {
            batch_id: 1,
            tenant_id: "acme".to_string(),
            active: true,
            mode: CadenceMode::Batch,
            started_at: Utc::now(),
            contacts: vec!["a".to_string()],
            pacing_delay_ms: 10,
            sent: 0,
            errors: 0,
        };
        assert_eq!(batch.success_rate(), 1.0);
        batch.sent = 3;
        batch.errors = 1;
        assert!((batch.success_rate() - 0.75).abs() < f64::EPSILON);
        assert!(batch.contains("a"));
        assert!(!batch.contains("b"));
    }
}
