//! In-memory phone-record storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use phonelink_core::{
    ActivationUpdate, PhoneNumber, PhoneNumberRecord, PhoneRecordStore, RecordId, StoreError,
};
use uuid::Uuid;

use super::now;

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryPhoneStore {
    records: RwLock<HashMap<RecordId, PhoneNumberRecord>>,
}

impl MemoryPhoneStore {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Insert an inactive record for a number.
    ///
    /// # Errors
    /// Returns error if the number is already stored.
    pub fn create(&self, phone: &str, country_code: u16) -> Result<PhoneNumberRecord, StoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let number = PhoneNumber::new(phone, country_code);
        if records.values().any(|r| r.matches(&number)) {
            return Err(StoreError::AlreadyExists(number.to_string()));
        }

        let timestamp = now();
        let record = PhoneNumberRecord {
            id: Uuid::new_v4(),
            phone: phone.to_string(),
            country_code,
            slot: None,
            active: false,
            created_at: timestamp,
            updated_at: timestamp,
        };
        records.insert(record.id, record.clone());

        Ok(record)
    }

    /// Get a record by ID.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn get(&self, id: RecordId) -> Result<Option<PhoneNumberRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(&id)
            .cloned())
    }
}

impl Default for MemoryPhoneStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PhoneRecordStore for MemoryPhoneStore {
    async fn find_by_phone_and_country_code(
        &self,
        phone: &str,
        country_code: u16,
    ) -> Result<Option<PhoneNumberRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .values()
            .find(|r| r.phone == phone && r.country_code == country_code)
            .cloned())
    }

    async fn update_activation(
        &self,
        id: RecordId,
        update: ActivationUpdate,
    ) -> Result<PhoneNumberRecord, StoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let record = records
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        record.slot = update.slot;
        record.active = update.active;
        record.updated_at = now();

        Ok(record.clone())
    }

    async fn list_active(&self) -> Result<Vec<PhoneNumberRecord>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut result: Vec<PhoneNumberRecord> =
            records.values().filter(|r| r.active).cloned().collect();

        // Sort by created_at ascending
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use phonelink_core::SlotId;

    use super::*;

    #[tokio::test]
    async fn test_create_and_find() {
        let store = MemoryPhoneStore::new();
        let created = store.create("6281234567890", 62).unwrap();

        let found = store
            .find_by_phone_and_country_code("6281234567890", 62)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, created);
        assert!(!found.active);
        assert!(found.slot.is_none());

        assert!(
            store
                .find_by_phone_and_country_code("6281234567890", 1)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_duplicate_number_rejected() {
        let store = MemoryPhoneStore::new();
        store.create("6281234567890", 62).unwrap();
        assert!(matches!(
            store.create("6281234567890", 62),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_update_activation_and_list_active() {
        let store = MemoryPhoneStore::new();
        let a = store.create("1000", 62).unwrap();
        store.create("2000", 62).unwrap();

        let updated = store
            .update_activation(a.id, ActivationUpdate::active(SlotId::new(3)))
            .await
            .unwrap();
        assert!(updated.active);
        assert_eq!(updated.slot, Some(SlotId::new(3)));

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);

        store
            .update_activation(a.id, ActivationUpdate::inactive())
            .await
            .unwrap();
        assert!(store.list_active().await.unwrap().is_empty());
        assert_eq!(store.get(a.id).unwrap().unwrap().slot, None);
    }

    #[tokio::test]
    async fn test_update_unknown_record() {
        let store = MemoryPhoneStore::new();
        let result = store
            .update_activation(Uuid::new_v4(), ActivationUpdate::inactive())
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
