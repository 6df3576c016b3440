//! Core abstractions for phone-number messaging sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `PhoneNumber` / `PhoneNumberRecord` - Persisted activation state
//! - `EventHub` - Broadcast + history subscriber channel per number
//! - Store, client, and publisher traits
//! - `MockClientFactory` - Scriptable messaging client

pub mod event_hub;
pub mod mock;
pub mod phone;
pub mod traits;

pub use event_hub::EventHub;
pub use phone::{ActivationUpdate, PhoneNumber, PhoneNumberRecord};
pub use traits::{
    ClientError, ClientFactory, ClientSignal, EventPublisher, MessagingClient, PhoneRecordStore,
    RecordId, SessionEvent, SignalSender, SlotId, StoreError,
};
