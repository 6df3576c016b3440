//! Phone numbers and their persisted activation records.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::traits::{RecordId, SlotId};

/// A phone number qualified by its country calling code.
///
/// Serves as the key for per-number serialization and for the subscriber
/// channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhoneNumber {
    /// Subscriber number as stored.
    pub phone: String,
    /// Country calling code (1..=999).
    pub country_code: u16,
}

impl PhoneNumber {
    /// Create a new phone number.
    #[must_use]
    pub fn new(phone: impl Into<String>, country_code: u16) -> Self {
        Self {
            phone: phone.into(),
            country_code,
        }
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{}:{}", self.country_code, self.phone)
    }
}

/// Persisted phone-number record.
///
/// `active == true` means `slot` names a live pooled session for this number;
/// `active == false` means `slot` is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneNumberRecord {
    /// Unique record identifier.
    pub id: RecordId,
    /// Subscriber number.
    pub phone: String,
    /// Country calling code.
    pub country_code: u16,
    /// Pool slot of the live session, if any.
    pub slot: Option<SlotId>,
    /// Whether a session is bound to this number.
    pub active: bool,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

impl PhoneNumberRecord {
    /// The number this record describes.
    #[must_use]
    pub fn number(&self) -> PhoneNumber {
        PhoneNumber::new(self.phone.clone(), self.country_code)
    }

    /// Whether this record describes `number`.
    #[must_use]
    pub fn matches(&self, number: &PhoneNumber) -> bool {
        self.phone == number.phone && self.country_code == number.country_code
    }
}

/// Activation fields written back to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationUpdate {
    /// Slot to store, or `None` to clear it.
    pub slot: Option<SlotId>,
    /// New activation flag.
    pub active: bool,
}

impl ActivationUpdate {
    /// Mark a record active on `slot`.
    #[must_use]
    pub const fn active(slot: SlotId) -> Self {
        Self {
            slot: Some(slot),
            active: true,
        }
    }

    /// Mark a record inactive and clear its slot.
    #[must_use]
    pub const fn inactive() -> Self {
        Self {
            slot: None,
            active: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_country_code() {
        let number = PhoneNumber::new("6281234567890", 62);
        assert_eq!(number.to_string(), "+62:6281234567890");
    }

    #[test]
    fn test_record_matches_number() {
        let record = PhoneNumberRecord {
            id: uuid::Uuid::new_v4(),
            phone: "6281234567890".to_string(),
            country_code: 62,
            slot: None,
            active: false,
            created_at: 0,
            updated_at: 0,
        };
        assert!(record.matches(&PhoneNumber::new("6281234567890", 62)));
        assert!(!record.matches(&PhoneNumber::new("6281234567890", 1)));
        assert_eq!(record.number(), PhoneNumber::new("6281234567890", 62));
    }
}
