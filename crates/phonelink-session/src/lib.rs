//! Session pool and activation workflow for phone-number messaging sessions.
//!
//! Provides:
//! - `MessagingSession` - One client connection and its handshake state machine
//! - `SessionPool` - Registry of live sessions keyed by stable slot
//! - `ActivationWorkflow` - Activate/deactivate numbers with rollback
//! - Storage implementations (memory, SQLite)

pub mod config;
pub mod pool;
pub mod session;
pub mod storage;
pub mod workflow;

pub use config::{ConfigError, WorkflowConfig};
pub use pool::{PoolError, SessionHandle, SessionPool};
pub use session::{MessagingSession, SessionError, SessionState};
pub use workflow::{Activation, ActivationError, ActivationWorkflow, PhoneStatus, ShutdownReport};
