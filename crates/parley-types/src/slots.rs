use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `RateLimitStatus` values.
pub enum RateLimitStatus {
    #[default]
    Normal,
    Throttled,
    Blocked,
}

impl RateLimitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Throttled => "throttled",
            Self::Blocked => "blocked",
        }
    }
}

/// One messaging identity connected by a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSlot {
    pub tenant_id: String,
    pub slot_number: u32,
    pub connected: bool,
    /// Bound phone number or account handle.
    pub identity: String,
    /// Contacts currently assigned to this slot and not yet dispatched.
    #[serde(default)]
    pub load: usize,
    #[serde(default)]
    pub rate_limit: RateLimitStatus,
}

impl ConnectionSlot {
    pub fn is_sendable(&self) -> bool {
        self.connected && self.rate_limit != RateLimitStatus::Blocked
    }
}
