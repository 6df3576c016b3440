//! Activation workflow binding persisted phone-number records to pooled sessions.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use phonelink_core::{
    ActivationUpdate, ClientFactory, EventPublisher, PhoneNumber, PhoneNumberRecord,
    PhoneRecordStore, RecordId, SessionEvent, SlotId, StoreError,
};
use tokio::sync::OwnedMutexGuard;

use crate::{
    config::WorkflowConfig,
    pool::{PoolError, SessionPool},
    session::{MessagingSession, SessionError, SessionState},
};

/// Activation workflow error.
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error("Phone number not found: {0}")]
    NotFound(PhoneNumber),
    #[error("Phone number {phone} already active in slot {slot}")]
    AlreadyActive { phone: PhoneNumber, slot: SlotId },
    #[error("Phone number not active: {0}")]
    NotActive(PhoneNumber),
    #[error("Failed to persist activation state: {0}")]
    PersistenceFailure(#[source] StoreError),
    #[error("Handshake failed: {0}")]
    HandshakeFailure(String),
    #[error("Record {id} still references stopped slot {slot:?}: {source}")]
    Reconciliation {
        id: RecordId,
        slot: Option<SlotId>,
        source: StoreError,
    },
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Storage error: {0}")]
    Store(#[source] StoreError),
}

/// Result of a successful activation.
#[derive(Debug, Clone)]
pub struct Activation {
    /// Slot of the new session.
    pub slot: SlotId,
    /// Record as persisted, with `active == true` and `slot == Some(slot)`.
    pub record: PhoneNumberRecord,
}

/// Persisted and live view of one phone number.
#[derive(Debug, Clone)]
pub struct PhoneStatus {
    /// Persisted record.
    pub record: PhoneNumberRecord,
    /// State of the session in the record's slot, if one is registered.
    pub session: Option<SessionState>,
}

/// Outcome of [`ActivationWorkflow::shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Sessions drained and stopped.
    pub stopped: usize,
    /// Records that could not be marked inactive.
    pub failures: Vec<ActivationError>,
}

/// Per-number async locks serializing activation, deactivation and eviction.
#[derive(Default)]
struct PhoneLocks {
    locks: Mutex<HashMap<PhoneNumber, Arc<tokio::sync::Mutex<()>>>>,
}

impl PhoneLocks {
    async fn acquire(&self, phone: &PhoneNumber) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(phone.clone())
                .or_default(),
        );
        lock.lock_owned().await
    }
}

enum Eviction {
    Failed,
    TimedOut(Duration),
}

struct Inner<S> {
    store: S,
    pool: Arc<SessionPool>,
    clients: Arc<dyn ClientFactory>,
    publisher: Arc<dyn EventPublisher>,
    config: WorkflowConfig,
    locks: PhoneLocks,
}

/// Orchestrates activation and deactivation of phone numbers.
///
/// Operations on one number are serialized; distinct numbers proceed in
/// parallel. `activate` returns once the session is registered and the record
/// persisted; handshake progress is published out-of-band.
pub struct ActivationWorkflow<S>
where
    S: PhoneRecordStore,
{
    inner: Arc<Inner<S>>,
}

impl<S> Clone for ActivationWorkflow<S>
where
    S: PhoneRecordStore,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> ActivationWorkflow<S>
where
    S: PhoneRecordStore + 'static,
{
    /// Create a new workflow over an injected pool.
    #[must_use]
    pub fn new(
        store: S,
        pool: Arc<SessionPool>,
        clients: Arc<dyn ClientFactory>,
        publisher: Arc<dyn EventPublisher>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                pool,
                clients,
                publisher,
                config,
                locks: PhoneLocks::default(),
            }),
        }
    }

    /// The session pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.inner.pool
    }

    /// The phone-record store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &WorkflowConfig {
        &self.inner.config
    }

    /// Bind a live session to the number's record.
    ///
    /// # Errors
    /// Returns `NotFound` with no side effects if the record is absent,
    /// `AlreadyActive` if a live session is bound, and `PersistenceFailure`
    /// after stopping and evicting the new session if the record cannot be
    /// updated.
    pub async fn activate(
        &self,
        phone: &str,
        country_code: u16,
    ) -> Result<Activation, ActivationError> {
        let number = PhoneNumber::new(phone, country_code);
        let _guard = self.inner.locks.acquire(&number).await;
        let inner = &self.inner;

        let record = inner.find(&number).await?;
        if let Some(slot) = inner.live_slot(&record).await {
            tracing::info!(phone = %number, %slot, "activation rejected, already active");
            return Err(ActivationError::AlreadyActive {
                phone: number,
                slot,
            });
        }
        if record.active {
            tracing::warn!(
                phone = %number,
                slot = ?record.slot,
                "record marked active without a live session, replacing"
            );
        }

        let session = MessagingSession::new(
            number.clone(),
            inner.clients.as_ref(),
            Arc::clone(&inner.publisher),
        );
        let slot = inner.pool.register(Arc::clone(&session)).await;
        inner.publisher.begin(&number);

        if let Err(e) = session.start() {
            inner.rollback(slot, &session).await;
            return Err(e.into());
        }

        match inner
            .store
            .update_activation(record.id, ActivationUpdate::active(slot))
            .await
        {
            Ok(record) => {
                tracing::info!(phone = %number, %slot, "phone number activated");
                self.spawn_monitor(number, slot, &session);
                Ok(Activation { slot, record })
            }
            Err(e) => {
                tracing::error!(
                    phone = %number,
                    %slot,
                    error = %e,
                    "failed to persist activation, rolling back"
                );
                inner.rollback(slot, &session).await;
                Err(ActivationError::PersistenceFailure(e))
            }
        }
    }

    /// Stop the number's session and mark its record inactive.
    ///
    /// # Errors
    /// Returns `NotActive` if the record is not active. If the session was
    /// stopped but the record could not be updated, returns `Reconciliation`:
    /// the record still references a dead slot until [`Self::repair`] runs.
    pub async fn deactivate(
        &self,
        phone: &str,
        country_code: u16,
    ) -> Result<PhoneNumberRecord, ActivationError> {
        let number = PhoneNumber::new(phone, country_code);
        let _guard = self.inner.locks.acquire(&number).await;
        let inner = &self.inner;

        let record = inner.find(&number).await?;
        if !record.active {
            return Err(ActivationError::NotActive(number));
        }

        if let Some(slot) = record.slot {
            inner.stop_slot(&number, slot).await;
        }

        match inner
            .store
            .update_activation(record.id, ActivationUpdate::inactive())
            .await
        {
            Ok(updated) => {
                tracing::info!(phone = %number, slot = ?record.slot, "phone number deactivated");
                Ok(updated)
            }
            Err(source) => {
                tracing::error!(
                    phone = %number,
                    slot = ?record.slot,
                    error = %source,
                    "session stopped but record still marked active, repair required"
                );
                Err(ActivationError::Reconciliation {
                    id: record.id,
                    slot: record.slot,
                    source,
                })
            }
        }
    }

    /// Bring one record back in line with the pool.
    ///
    /// An active record without a live session is marked inactive; a live
    /// session the record does not reference is written back to it.
    ///
    /// # Errors
    /// Returns error if the record is absent or cannot be updated.
    pub async fn repair(
        &self,
        phone: &str,
        country_code: u16,
    ) -> Result<PhoneNumberRecord, ActivationError> {
        let number = PhoneNumber::new(phone, country_code);
        let _guard = self.inner.locks.acquire(&number).await;

        let record = self.inner.find(&number).await?;
        self.inner.repair_record(record).await
    }

    /// Repair every record the store lists as active. Returns the records
    /// that changed.
    ///
    /// Run at startup: a fresh pool holds no sessions, so every active
    /// record is stale.
    ///
    /// # Errors
    /// Returns error on the first store failure.
    pub async fn reconcile(&self) -> Result<Vec<PhoneNumberRecord>, ActivationError> {
        let active = self
            .inner
            .store
            .list_active()
            .await
            .map_err(ActivationError::Store)?;

        let mut repaired = Vec::new();
        for stale in active {
            let number = stale.number();
            let _guard = self.inner.locks.acquire(&number).await;

            let current = self.inner.find(&number).await?;
            let fixed = self.inner.repair_record(current.clone()).await?;
            if fixed != current {
                repaired.push(fixed);
            }
        }

        tracing::info!(repaired = repaired.len(), "activation records reconciled");
        Ok(repaired)
    }

    /// Persisted record and live session state for a number.
    ///
    /// # Errors
    /// Returns error if the record is absent.
    pub async fn status(
        &self,
        phone: &str,
        country_code: u16,
    ) -> Result<PhoneStatus, ActivationError> {
        let number = PhoneNumber::new(phone, country_code);
        let record = self.inner.find(&number).await?;

        let session = match record.slot {
            Some(slot) => self.inner.pool.get(slot).await.ok().map(|h| h.state()),
            None => None,
        };

        Ok(PhoneStatus { record, session })
    }

    /// Wait until the number's live session is `Ready`.
    ///
    /// Applies no deadline of its own.
    ///
    /// # Errors
    /// Returns `NotActive` if no live session exists and `HandshakeFailure`
    /// if the session fails first.
    pub async fn wait_until_ready(
        &self,
        phone: &str,
        country_code: u16,
    ) -> Result<SlotId, ActivationError> {
        let number = PhoneNumber::new(phone, country_code);
        let handle = self
            .inner
            .pool
            .find_live_by_phone(&number)
            .await
            .ok_or_else(|| ActivationError::NotActive(number.clone()))?;

        match handle.session().wait_for_ready().await {
            Ok(()) => Ok(handle.slot()),
            Err(SessionError::Ended(SessionState::Failed)) => {
                Err(ActivationError::HandshakeFailure(
                    handle
                        .session()
                        .failure_reason()
                        .unwrap_or_else(|| "unknown".to_string()),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drain the pool, stop every session, and mark each record inactive.
    pub async fn shutdown(&self) -> ShutdownReport {
        let inner = &self.inner;
        let handles = inner.pool.drain().await;
        let mut report = ShutdownReport::default();

        tracing::info!(sessions = handles.len(), "shutting down session pool");

        for handle in handles {
            let number = handle.phone().clone();
            let _guard = inner.locks.acquire(&number).await;

            if let Err(e) = handle.session().stop().await {
                tracing::warn!(phone = %number, slot = %handle.slot(), error = %e, "session teardown failed");
            }
            report.stopped += 1;

            let record = match inner.find(&number).await {
                Ok(record) => record,
                Err(e) => {
                    report.failures.push(e);
                    continue;
                }
            };
            if record.slot != Some(handle.slot()) {
                continue;
            }
            if let Err(source) = inner
                .store
                .update_activation(record.id, ActivationUpdate::inactive())
                .await
            {
                tracing::error!(phone = %number, error = %source, "failed to clear record on shutdown");
                report.failures.push(ActivationError::Reconciliation {
                    id: record.id,
                    slot: record.slot,
                    source,
                });
            }
        }

        report
    }

    fn spawn_monitor(&self, number: PhoneNumber, slot: SlotId, session: &MessagingSession) {
        let inner = Arc::clone(&self.inner);
        let mut states = session.subscribe_state();
        let deadline = inner.config.handshake_timeout();

        tokio::spawn(async move {
            let settled = |s: &SessionState| *s == SessionState::Ready || s.is_terminal();

            let first = match deadline {
                Some(after) => {
                    // Copy the state out before awaiting again; watch::Ref is !Send.
                    let waited = tokio::time::timeout(after, states.wait_for(settled))
                        .await
                        .map(|state| state.map(|s| *s));
                    match waited {
                        Ok(state) => state,
                        Err(_) => {
                            inner.evict(&number, slot, Eviction::TimedOut(after)).await;
                            return;
                        }
                    }
                }
                None => states.wait_for(settled).await.map(|s| *s),
            };

            let ended = match first {
                Ok(SessionState::Ready) => states.wait_for(|s| s.is_terminal()).await.map(|s| *s),
                other => other,
            };

            if matches!(ended, Ok(SessionState::Failed)) {
                inner.evict(&number, slot, Eviction::Failed).await;
            }
        });
    }
}

impl<S> Inner<S>
where
    S: PhoneRecordStore,
{
    async fn find(&self, number: &PhoneNumber) -> Result<PhoneNumberRecord, ActivationError> {
        self.store
            .find_by_phone_and_country_code(&number.phone, number.country_code)
            .await
            .map_err(ActivationError::Store)?
            .ok_or_else(|| ActivationError::NotFound(number.clone()))
    }

    /// Slot of a live session bound to the record's number, if any.
    async fn live_slot(&self, record: &PhoneNumberRecord) -> Option<SlotId> {
        if let Some(slot) = record.slot {
            if let Ok(handle) = self.pool.get(slot).await {
                if record.matches(handle.phone()) && !handle.state().is_terminal() {
                    return Some(slot);
                }
            }
        }
        self.pool
            .find_live_by_phone(&record.number())
            .await
            .map(|h| h.slot())
    }

    async fn rollback(&self, slot: SlotId, session: &MessagingSession) {
        if let Err(e) = session.stop().await {
            tracing::warn!(phone = %session.phone(), %slot, error = %e, "rollback teardown failed");
        }
        if let Err(e) = self.pool.remove(slot).await {
            tracing::warn!(phone = %session.phone(), error = %e, "rollback found no pool entry");
        }
    }

    async fn stop_slot(&self, number: &PhoneNumber, slot: SlotId) {
        match self.pool.remove_bound_to(slot, number).await {
            Ok(handle) => {
                if let Err(e) = handle.session().stop().await {
                    tracing::warn!(phone = %number, %slot, error = %e, "session teardown failed");
                }
            }
            Err(PoolError::BoundElsewhere { owner, .. }) => {
                tracing::warn!(
                    phone = %number,
                    %slot,
                    %owner,
                    "record slot belongs to another number, leaving it"
                );
            }
            Err(PoolError::NotFound(_)) => {
                tracing::warn!(phone = %number, %slot, "record slot has no live session");
            }
        }
    }

    async fn repair_record(
        &self,
        record: PhoneNumberRecord,
    ) -> Result<PhoneNumberRecord, ActivationError> {
        let number = record.number();
        let update = match self.live_slot(&record).await {
            Some(live) if record.active && record.slot == Some(live) => return Ok(record),
            Some(live) => ActivationUpdate::active(live),
            None if !record.active && record.slot.is_none() => return Ok(record),
            None => ActivationUpdate::inactive(),
        };

        tracing::warn!(
            phone = %number,
            stored_slot = ?record.slot,
            new_slot = ?update.slot,
            "repairing activation record"
        );
        self.store
            .update_activation(record.id, update)
            .await
            .map_err(ActivationError::PersistenceFailure)
    }

    async fn evict(&self, number: &PhoneNumber, slot: SlotId, cause: Eviction) {
        let _guard = self.locks.acquire(number).await;

        let Ok(handle) = self.pool.remove(slot).await else {
            tracing::debug!(phone = %number, %slot, "session already evicted");
            return;
        };

        match cause {
            Eviction::Failed => {
                tracing::warn!(
                    phone = %number,
                    %slot,
                    reason = ?handle.session().failure_reason(),
                    "evicting failed session"
                );
            }
            Eviction::TimedOut(after) => {
                tracing::warn!(phone = %number, %slot, ?after, "handshake deadline passed, evicting session");
                if let Err(e) = handle.session().stop().await {
                    tracing::warn!(phone = %number, %slot, error = %e, "session teardown failed");
                }
                self.publisher.publish(
                    number,
                    SessionEvent::Failed {
                        reason: format!("handshake not completed within {}s", after.as_secs()),
                    },
                );
            }
        }

        match self.find(number).await {
            Ok(record) if record.slot == Some(slot) => {
                match self
                    .store
                    .update_activation(record.id, ActivationUpdate::inactive())
                    .await
                {
                    Ok(_) => tracing::info!(phone = %number, %slot, "record cleared after eviction"),
                    Err(e) => tracing::error!(
                        phone = %number,
                        %slot,
                        error = %e,
                        "failed to clear record after eviction, repair required"
                    ),
                }
            }
            Ok(_) => tracing::debug!(phone = %number, %slot, "record no longer references slot"),
            Err(e) => tracing::warn!(phone = %number, error = %e, "record lookup failed after eviction"),
        }
    }
}
