//! SQLite phone-record storage (feature-gated).

use async_trait::async_trait;
use phonelink_core::{
    ActivationUpdate, PhoneNumber, PhoneNumberRecord, PhoneRecordStore, RecordId, SlotId,
    StoreError,
};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use uuid::Uuid;

use super::now;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS phone_number (
    id              TEXT PRIMARY KEY NOT NULL,
    phone           TEXT NOT NULL,
    country_code    INTEGER NOT NULL CHECK(country_code BETWEEN 1 AND 999),
    slot            INTEGER,
    active          INTEGER NOT NULL DEFAULT 0 CHECK(active IN (0, 1)),
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    UNIQUE(phone, country_code),
    CHECK(active = 1 OR slot IS NULL)
)";

const COLUMNS: &str = "id, phone, country_code, slot, active, created_at, updated_at";

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct PhoneRow {
    id: String,
    phone: String,
    country_code: i64,
    slot: Option<i64>,
    active: i64,
    created_at: i64,
    updated_at: i64,
}

impl PhoneRow {
    fn into_record(self) -> Result<PhoneNumberRecord, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Internal(format!("invalid id {}: {e}", self.id)))?;
        let country_code = u16::try_from(self.country_code)
            .map_err(|e| StoreError::Internal(format!("invalid country_code: {e}")))?;
        let slot = self
            .slot
            .map(|raw| u64::try_from(raw).map(SlotId::new))
            .transpose()
            .map_err(|e| StoreError::Internal(format!("invalid slot: {e}")))?;

        Ok(PhoneNumberRecord {
            id,
            phone: self.phone,
            country_code,
            slot,
            active: self.active != 0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn internal(err: sqlx::Error) -> StoreError {
    StoreError::Internal(err.to_string())
}

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqlitePhoneStore {
    pool: SqlitePool,
}

impl SqlitePhoneStore {
    /// Connect to `database_url` and bootstrap the schema.
    ///
    /// # Errors
    /// Returns error if database connection or schema creation fails.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(internal)?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and bootstrap the schema.
    ///
    /// # Errors
    /// Returns error if schema creation fails.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(internal)?;
        Ok(Self { pool })
    }

    /// Insert an inactive record for a number.
    ///
    /// # Errors
    /// Returns error if the number is already stored or the insert fails.
    pub async fn create(
        &self,
        phone: &str,
        country_code: u16,
    ) -> Result<PhoneNumberRecord, StoreError> {
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

        sqlx::query(
            "INSERT INTO phone_number (id, phone, country_code, slot, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, NULL, 0, ?4, ?5)",
        )
        .bind(record.id.to_string())
        .bind(&record.phone)
        .bind(i64::from(country_code))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::AlreadyExists(PhoneNumber::new(phone, country_code).to_string())
            }
            other => internal(other),
        })?;

        Ok(record)
    }

    /// Get a record by ID.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub async fn get(&self, id: RecordId) -> Result<Option<PhoneNumberRecord>, StoreError> {
        sqlx::query_as::<_, PhoneRow>(&format!(
            "SELECT {COLUMNS} FROM phone_number WHERE id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?
        .map(PhoneRow::into_record)
        .transpose()
    }
}

#[async_trait]
impl PhoneRecordStore for SqlitePhoneStore {
    async fn find_by_phone_and_country_code(
        &self,
        phone: &str,
        country_code: u16,
    ) -> Result<Option<PhoneNumberRecord>, StoreError> {
        sqlx::query_as::<_, PhoneRow>(&format!(
            "SELECT {COLUMNS} FROM phone_number WHERE phone = ?1 AND country_code = ?2"
        ))
        .bind(phone)
        .bind(i64::from(country_code))
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?
        .map(PhoneRow::into_record)
        .transpose()
    }

    async fn update_activation(
        &self,
        id: RecordId,
        update: ActivationUpdate,
    ) -> Result<PhoneNumberRecord, StoreError> {
        let slot = update
            .slot
            .map(|s| i64::try_from(s.get()))
            .transpose()
            .map_err(|e| StoreError::Internal(format!("slot out of range: {e}")))?;

        let result = sqlx::query(
            "UPDATE phone_number SET slot = ?1, active = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(slot)
        .bind(i64::from(update.active))
        .bind(now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list_active(&self) -> Result<Vec<PhoneNumberRecord>, StoreError> {
        sqlx::query_as::<_, PhoneRow>(&format!(
            "SELECT {COLUMNS} FROM phone_number WHERE active = 1 ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?
        .into_iter()
        .map(PhoneRow::into_record)
        .collect()
    }
}
