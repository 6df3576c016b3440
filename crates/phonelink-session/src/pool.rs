//! Registry of live messaging sessions keyed by stable slot.

use std::{collections::HashMap, sync::Arc};

use phonelink_core::{PhoneNumber, SlotId};
use tokio::sync::RwLock;

use crate::session::{MessagingSession, SessionState};

/// Pool error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("No session registered in slot {0}")]
    NotFound(SlotId),
    #[error("Slot {slot} is bound to {owner}")]
    BoundElsewhere { slot: SlotId, owner: PhoneNumber },
}

/// A registered session together with its slot.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    slot: SlotId,
    session: Arc<MessagingSession>,
}

impl SessionHandle {
    /// Slot the session is registered under.
    #[must_use]
    pub const fn slot(&self) -> SlotId {
        self.slot
    }

    /// The session itself.
    #[must_use]
    pub const fn session(&self) -> &Arc<MessagingSession> {
        &self.session
    }

    /// Phone number of the session.
    #[must_use]
    pub fn phone(&self) -> &PhoneNumber {
        self.session.phone()
    }

    /// Current state of the session.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state()
    }
}

#[derive(Default)]
struct Inner {
    next_slot: u64,
    sessions: HashMap<SlotId, Arc<MessagingSession>>,
}

/// Synchronized registry of active sessions.
///
/// Slots are handed out monotonically and never reused, so removing one
/// entry leaves every other slot valid.
#[derive(Default)]
pub struct SessionPool {
    inner: RwLock<Inner>,
}

impl SessionPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under a fresh slot.
    pub async fn register(&self, session: Arc<MessagingSession>) -> SlotId {
        let mut inner = self.inner.write().await;
        inner.next_slot += 1;
        let slot = SlotId::new(inner.next_slot);
        inner.sessions.insert(slot, session);
        tracing::debug!(%slot, live = inner.sessions.len(), "session registered");
        slot
    }

    /// Look up the session in `slot`.
    ///
    /// # Errors
    /// Returns error if nothing is registered there.
    pub async fn get(&self, slot: SlotId) -> Result<SessionHandle, PoolError> {
        self.inner
            .read()
            .await
            .sessions
            .get(&slot)
            .map(|session| SessionHandle {
                slot,
                session: Arc::clone(session),
            })
            .ok_or(PoolError::NotFound(slot))
    }

    /// Remove and return the session in `slot`.
    ///
    /// # Errors
    /// Returns error if nothing is registered there.
    pub async fn remove(&self, slot: SlotId) -> Result<SessionHandle, PoolError> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.remove(&slot).ok_or(PoolError::NotFound(slot))?;
        tracing::debug!(%slot, live = inner.sessions.len(), "session removed");
        Ok(SessionHandle { slot, session })
    }

    /// Remove the session in `slot` only if it is bound to `phone`.
    ///
    /// # Errors
    /// Returns `NotFound` if the slot is empty and `BoundElsewhere` if it
    /// holds another number's session, which stays registered.
    pub async fn remove_bound_to(
        &self,
        slot: SlotId,
        phone: &PhoneNumber,
    ) -> Result<SessionHandle, PoolError> {
        let mut inner = self.inner.write().await;
        let owner = inner
            .sessions
            .get(&slot)
            .map(|session| session.phone())
            .ok_or(PoolError::NotFound(slot))?;
        if owner != phone {
            return Err(PoolError::BoundElsewhere {
                slot,
                owner: owner.clone(),
            });
        }
        let session = inner.sessions.remove(&slot).ok_or(PoolError::NotFound(slot))?;
        tracing::debug!(%slot, live = inner.sessions.len(), "session removed");
        Ok(SessionHandle { slot, session })
    }

    /// Remove every session, in slot order. Performs no I/O: the caller
    /// stops the returned sessions.
    pub async fn drain(&self) -> Vec<SessionHandle> {
        let mut handles: Vec<SessionHandle> = self
            .inner
            .write()
            .await
            .sessions
            .drain()
            .map(|(slot, session)| SessionHandle { slot, session })
            .collect();
        handles.sort_by_key(SessionHandle::slot);
        handles
    }

    /// Find the live (not stopped or failed) session bound to `phone`.
    pub async fn find_live_by_phone(&self, phone: &PhoneNumber) -> Option<SessionHandle> {
        self.inner
            .read()
            .await
            .sessions
            .iter()
            .find(|(_, session)| session.phone() == phone && !session.state().is_terminal())
            .map(|(slot, session)| SessionHandle {
                slot: *slot,
                session: Arc::clone(session),
            })
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Whether the pool is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sessions.is_empty()
    }
}
