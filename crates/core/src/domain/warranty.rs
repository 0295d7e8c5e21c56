use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Repair windows at or below this many hours flag the run as urgent.
pub const REPAIR_URGENCY_THRESHOLD_HOURS: u32 = 48;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarrantyStatus {
    Valid,
    Expired,
    NotFound,
}

impl WarrantyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Expired => "expired",
            Self::NotFound => "not_found",
        }
    }
}

/// Entitlement lookup result for one serial number.
///
/// An unknown serial is the `NotFound` status, not an error; the lookup
/// itself succeeded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarrantyRecord {
    pub status: WarrantyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair_window_hours: Option<u32>,
}

impl WarrantyRecord {
    pub fn not_found() -> Self {
        Self { status: WarrantyStatus::NotFound, expires_at: None, repair_window_hours: None }
    }

    /// Derived urgency flag: a short remaining repair window means the
    /// customer has to act now to stay inside it.
    pub fn repair_urgent(&self) -> bool {
        matches!(self.repair_window_hours, Some(hours) if hours <= REPAIR_URGENCY_THRESHOLD_HOURS)
    }
}

#[cfg(test)]
mod tests {
    use super::{WarrantyRecord, WarrantyStatus};

    #[test]
    fn short_repair_window_is_urgent() {
        let record = WarrantyRecord {
            status: WarrantyStatus::Valid,
            expires_at: None,
            repair_window_hours: Some(24),
        };
        assert!(record.repair_urgent());
    }

    #[test]
    fn long_or_absent_repair_window_is_not_urgent() {
        let roomy = WarrantyRecord {
            status: WarrantyStatus::Valid,
            expires_at: None,
            repair_window_hours: Some(240),
        };
        assert!(!roomy.repair_urgent());
        assert!(!WarrantyRecord::not_found().repair_urgent());
    }

    #[test]
    fn status_serializes_snake_case() {
        let encoded = serde_json::to_string(&WarrantyStatus::NotFound).expect("serialize");
        assert_eq!(encoded, "\"not_found\"");
    }
}
