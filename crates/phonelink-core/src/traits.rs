//! Core identifiers, events, and collaborator traits.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::phone::{ActivationUpdate, PhoneNumber, PhoneNumberRecord};

/// Persisted phone-number record identifier.
pub type RecordId = Uuid;

/// Stable identifier of a session registered in a pool.
///
/// Slots are issued monotonically and never reused, so evicting one session
/// never changes the identifier of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(u64);

impl SlotId {
    /// Wrap a raw slot number.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw slot number, as persisted.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle event published to subscribers of a phone number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Out-of-band code the subscriber must present (e.g. render as QR).
    HandshakeCode { code: String },
    /// The handshake was accepted.
    Authenticated,
    /// The session is usable.
    Ready,
    /// The session failed and will not recover on its own.
    Failed { reason: String },
}

/// Raw lifecycle signal emitted by an underlying messaging client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSignal {
    /// A (possibly refreshed) handshake code is available.
    Qr(String),
    /// Authentication was rejected.
    AuthFailure(String),
    /// Authentication succeeded.
    Authenticated,
    /// The client finished loading.
    Ready,
}

/// Channel on which a client reports its lifecycle signals.
pub type SignalSender = mpsc::UnboundedSender<ClientSignal>;

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Phone number record not found: {0}")]
    NotFound(String),
    #[error("Phone number record already exists: {0}")]
    AlreadyExists(String),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for phone-number record backends.
#[async_trait]
pub trait PhoneRecordStore: Send + Sync {
    /// Look up a record by its phone number and country code.
    async fn find_by_phone_and_country_code(
        &self,
        phone: &str,
        country_code: u16,
    ) -> Result<Option<PhoneNumberRecord>, StoreError>;

    /// Persist the activation fields of a record and return the updated record.
    async fn update_activation(
        &self,
        id: RecordId,
        update: ActivationUpdate,
    ) -> Result<PhoneNumberRecord, StoreError>;

    /// List every record currently marked active.
    async fn list_active(&self) -> Result<Vec<PhoneNumberRecord>, StoreError>;
}

#[async_trait]
impl<T> PhoneRecordStore for Arc<T>
where
    T: PhoneRecordStore + ?Sized,
{
    async fn find_by_phone_and_country_code(
        &self,
        phone: &str,
        country_code: u16,
    ) -> Result<Option<PhoneNumberRecord>, StoreError> {
        (**self).find_by_phone_and_country_code(phone, country_code).await
    }

    async fn update_activation(
        &self,
        id: RecordId,
        update: ActivationUpdate,
    ) -> Result<PhoneNumberRecord, StoreError> {
        (**self).update_activation(id, update).await
    }

    async fn list_active(&self) -> Result<Vec<PhoneNumberRecord>, StoreError> {
        (**self).list_active().await
    }
}

/// Messaging client error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Client initialization failed: {0}")]
    Initialize(String),
    #[error("Client teardown failed: {0}")]
    Destroy(String),
}

/// Opaque capability of the third-party messaging client.
///
/// Lifecycle signals are not returned from these calls; they arrive on the
/// [`SignalSender`] handed to [`ClientFactory::create`].
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Open the connection. May emit signals before it resolves.
    async fn initialize(&self) -> Result<(), ClientError>;

    /// Release the connection.
    async fn destroy(&self) -> Result<(), ClientError>;
}

/// Builds one messaging client per phone number.
pub trait ClientFactory: Send + Sync {
    /// Create a client bound to `phone` that reports on `signals`.
    fn create(&self, phone: &PhoneNumber, signals: SignalSender) -> Arc<dyn MessagingClient>;
}

/// Subscriber channel keyed by phone number.
///
/// Delivery and acknowledgement are the implementor's concern.
pub trait EventPublisher: Send + Sync {
    /// Publish an event to every subscriber of `phone`.
    fn publish(&self, phone: &PhoneNumber, event: SessionEvent);

    /// A new session is starting for `phone`; events retained from earlier
    /// sessions no longer apply.
    fn begin(&self, _phone: &PhoneNumber) {}
}
