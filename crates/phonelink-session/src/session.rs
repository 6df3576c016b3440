//! One messaging-client connection and its handshake state machine.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use phonelink_core::{
    ClientError, ClientFactory, ClientSignal, EventPublisher, MessagingClient, PhoneNumber,
    SessionEvent, SignalSender,
};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

/// Lifecycle state of a messaging session.
///
/// `Created → Initializing → AwaitingHandshake → Authenticated → Ready`;
/// `Failed` and `Stopped` are terminal and reachable from any other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Initializing,
    AwaitingHandshake,
    Authenticated,
    Ready,
    Failed,
    Stopped,
}

impl SessionState {
    /// Whether no further transition can happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    /// State reached by applying `signal`, or `None` if it does not apply here.
    ///
    /// A handshake code arriving while already awaiting the handshake is a
    /// refresh and keeps the state.
    #[must_use]
    pub fn on_signal(self, signal: &ClientSignal) -> Option<Self> {
        match (self, signal) {
            (Self::Failed | Self::Stopped, _) => None,
            (_, ClientSignal::AuthFailure(_)) => Some(Self::Failed),
            (Self::Initializing | Self::AwaitingHandshake, ClientSignal::Qr(_)) => {
                Some(Self::AwaitingHandshake)
            }
            (Self::AwaitingHandshake, ClientSignal::Authenticated) => Some(Self::Authenticated),
            (Self::Authenticated, ClientSignal::Ready) => Some(Self::Ready),
            _ => None,
        }
    }
}

/// Session error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session already started (state: {0:?})")]
    AlreadyStarted(SessionState),
    #[error("Session ended before becoming ready (state: {0:?})")]
    Ended(SessionState),
}

/// A live binding between one phone number and one client connection.
///
/// Lifecycle signals from the client are applied by a background task and
/// published to the subscriber channel; callers observe progress through
/// [`MessagingSession::subscribe_state`] or [`MessagingSession::wait_for_ready`].
pub struct MessagingSession {
    phone: PhoneNumber,
    client: Arc<dyn MessagingClient>,
    publisher: Arc<dyn EventPublisher>,
    state: watch::Sender<SessionState>,
    signal_tx: SignalSender,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientSignal>>>,
    failure: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessagingSession {
    /// Create a session for `phone` with a fresh client from `clients`.
    #[must_use]
    pub fn new(
        phone: PhoneNumber,
        clients: &dyn ClientFactory,
        publisher: Arc<dyn EventPublisher>,
    ) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let client = clients.create(&phone, signal_tx.clone());
        let (state, _) = watch::channel(SessionState::Created);

        Arc::new(Self {
            phone,
            client,
            publisher,
            state,
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            failure: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Phone number this session is bound to.
    #[must_use]
    pub const fn phone(&self) -> &PhoneNumber {
        &self.phone
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Reason reported with the handshake failure, if the session failed.
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Begin connecting. Returns as soon as the attempt is in progress.
    ///
    /// # Errors
    /// Returns error if the session was already started or stopped.
    pub fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        // Held across the transition so a concurrent stop() sees the tasks.
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        let mut previous = SessionState::Created;
        let started = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == SessionState::Created {
                *state = SessionState::Initializing;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(SessionError::AlreadyStarted(previous));
        }

        tracing::info!(phone = %self.phone, "messaging session starting");

        if let Some(signals) = self
            .signal_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            tasks.push(tokio::spawn(Self::pump(Arc::downgrade(self), signals)));
        }

        let client = Arc::clone(&self.client);
        let faults = self.signal_tx.clone();
        let phone = self.phone.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = client.initialize().await {
                tracing::warn!(%phone, error = %e, "messaging client fault during initialization");
                let _ = faults.send(ClientSignal::AuthFailure(e.to_string()));
            }
        }));

        Ok(())
    }

    /// Stop the session and release the connection.
    ///
    /// Stopping an already stopped or failed session is a no-op.
    ///
    /// # Errors
    /// Returns error if the client failed to release the connection. The
    /// session is `Stopped` either way.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            previous = Some(*state);
            *state = SessionState::Stopped;
            true
        });

        let Some(previous) = previous else {
            tracing::debug!(phone = %self.phone, state = ?self.state(), "session already ended");
            return Ok(());
        };

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }

        tracing::info!(phone = %self.phone, ?previous, "messaging session stopping");

        if previous == SessionState::Created {
            return Ok(());
        }
        self.client.destroy().await
    }

    /// Resolve once the session is `Ready`.
    ///
    /// # Errors
    /// Returns error if the session fails or is stopped first.
    pub async fn wait_for_ready(&self) -> Result<(), SessionError> {
        let mut states = self.state.subscribe();
        let state = states
            .wait_for(|s| *s == SessionState::Ready || s.is_terminal())
            .await
            .map_or(SessionState::Stopped, |s| *s);

        if state == SessionState::Ready {
            Ok(())
        } else {
            Err(SessionError::Ended(state))
        }
    }

    async fn pump(session: Weak<Self>, mut signals: mpsc::UnboundedReceiver<ClientSignal>) {
        while let Some(signal) = signals.recv().await {
            let Some(session) = session.upgrade() else {
                break;
            };
            session.apply(signal).await;
            if session.state().is_terminal() {
                break;
            }
        }
    }

    async fn apply(&self, signal: ClientSignal) {
        let mut transition = None;
        self.state.send_if_modified(|state| {
            let Some(next) = state.on_signal(&signal) else {
                return false;
            };
            if let ClientSignal::AuthFailure(ref reason) = signal {
                *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.clone());
            }
            transition = Some((*state, next));
            let changed = *state != next;
            *state = next;
            changed
        });

        let Some((from, to)) = transition else {
            tracing::warn!(
                phone = %self.phone,
                state = ?self.state(),
                ?signal,
                "ignoring client signal out of order"
            );
            return;
        };

        if from == to {
            tracing::debug!(phone = %self.phone, "handshake code refreshed");
        } else {
            tracing::info!(phone = %self.phone, ?from, ?to, "session transition");
        }

        let event = match signal {
            ClientSignal::Qr(code) => SessionEvent::HandshakeCode { code },
            ClientSignal::Authenticated => SessionEvent::Authenticated,
            ClientSignal::Ready => SessionEvent::Ready,
            ClientSignal::AuthFailure(reason) => SessionEvent::Failed { reason },
        };
        self.publisher.publish(&self.phone, event);

        if to == SessionState::Failed {
            tracing::warn!(phone = %self.phone, "handshake failed, releasing connection");
            if let Err(e) = self.client.destroy().await {
                tracing::error!(phone = %self.phone, error = %e, "failed to release connection");
            }
        }
    }
}

impl fmt::Debug for MessagingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingSession")
            .field("phone", &self.phone)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for MessagingSession {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use phonelink_core::{
        EventHub,
        mock::{MockClientFactory, MockScript},
    };

    use super::*;

    fn number() -> PhoneNumber {
        PhoneNumber::new("6281234567890", 62)
    }

    async fn wait_state(session: &MessagingSession, target: SessionState) {
        let mut states = session.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == target))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    #[test]
    fn test_transition_table() {
        use SessionState::*;

        let qr = ClientSignal::Qr("c".into());
        let fail = ClientSignal::AuthFailure("x".into());

        assert_eq!(Initializing.on_signal(&qr), Some(AwaitingHandshake));
        assert_eq!(AwaitingHandshake.on_signal(&qr), Some(AwaitingHandshake));
        assert_eq!(
            AwaitingHandshake.on_signal(&ClientSignal::Authenticated),
            Some(Authenticated)
        );
        assert_eq!(Authenticated.on_signal(&ClientSignal::Ready), Some(Ready));
        assert_eq!(Ready.on_signal(&fail), Some(Failed));

        assert_eq!(Initializing.on_signal(&ClientSignal::Ready), None);
        assert_eq!(Ready.on_signal(&qr), None);
        assert_eq!(Stopped.on_signal(&fail), None);
        assert_eq!(Failed.on_signal(&qr), None);
    }

    #[tokio::test]
    async fn test_full_handshake_publishes_events() {
        let hub = Arc::new(EventHub::new());
        let factory = MockClientFactory::with_script(MockScript {
            handshake_code: Some("2@qr".into()),
            ..MockScript::default()
        });
        let session = MessagingSession::new(number(), &factory, hub.clone());
        assert_eq!(session.state(), SessionState::Created);

        session.start().unwrap();
        wait_state(&session, SessionState::AwaitingHandshake).await;

        let client = factory.client(&number()).unwrap();
        client.emit(ClientSignal::Authenticated);
        client.emit(ClientSignal::Ready);
        session.wait_for_ready().await.unwrap();

        assert_eq!(client.initialize_calls(), 1);
        assert_eq!(
            hub.get_history(&number()),
            vec![
                SessionEvent::HandshakeCode { code: "2@qr".into() },
                SessionEvent::Authenticated,
                SessionEvent::Ready,
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let factory = MockClientFactory::new();
        let session = MessagingSession::new(number(), &factory, Arc::new(EventHub::new()));
        session.start().unwrap();

        session.stop().await.unwrap();
        session.stop().await.unwrap();

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(factory.client(&number()).unwrap().destroy_calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_start_skips_teardown() {
        let factory = MockClientFactory::new();
        let session = MessagingSession::new(number(), &factory, Arc::new(EventHub::new()));

        session.stop().await.unwrap();

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(factory.client(&number()).unwrap().destroy_calls(), 0);
        assert_eq!(
            session.start(),
            Err(SessionError::AlreadyStarted(SessionState::Stopped))
        );
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let factory = MockClientFactory::new();
        let session = MessagingSession::new(number(), &factory, Arc::new(EventHub::new()));

        session.start().unwrap();
        assert_eq!(
            session.start(),
            Err(SessionError::AlreadyStarted(SessionState::Initializing))
        );
    }

    #[tokio::test]
    async fn test_handshake_failure_releases_connection() {
        let hub = Arc::new(EventHub::new());
        let factory = MockClientFactory::with_script(MockScript {
            handshake_code: Some("2@qr".into()),
            ..MockScript::default()
        });
        let session = MessagingSession::new(number(), &factory, hub.clone());
        session.start().unwrap();
        wait_state(&session, SessionState::AwaitingHandshake).await;

        let client = factory.client(&number()).unwrap();
        client.emit(ClientSignal::AuthFailure("scan rejected".into()));

        assert_eq!(
            session.wait_for_ready().await,
            Err(SessionError::Ended(SessionState::Failed))
        );
        assert_eq!(session.failure_reason().as_deref(), Some("scan rejected"));

        // stop() on a failed session is a no-op
        session.stop().await.unwrap();
        assert_eq!(session.state(), SessionState::Failed);

        tokio::time::timeout(Duration::from_secs(2), async {
            while client.destroy_calls() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(client.destroy_calls(), 1);
        assert!(hub.get_history(&number()).contains(&SessionEvent::Failed {
            reason: "scan rejected".into()
        }));
    }

    #[tokio::test]
    async fn test_initialize_fault_fails_session() {
        let factory = MockClientFactory::with_script(MockScript {
            fail_initialize: Some("browser crashed".into()),
            ..MockScript::default()
        });
        let session = MessagingSession::new(number(), &factory, Arc::new(EventHub::new()));
        session.start().unwrap();

        wait_state(&session, SessionState::Failed).await;
        assert!(session.failure_reason().unwrap().contains("browser crashed"));
    }

    #[tokio::test]
    async fn test_out_of_order_signal_is_ignored() {
        let factory = MockClientFactory::new();
        let session = MessagingSession::new(number(), &factory, Arc::new(EventHub::new()));
        session.start().unwrap();

        let client = factory.client(&number()).unwrap();
        client.emit(ClientSignal::Ready);
        client.emit(ClientSignal::Qr("late".into()));

        wait_state(&session, SessionState::AwaitingHandshake).await;
    }

    #[tokio::test]
    async fn test_stop_during_handshake_ends_wait() {
        let factory = MockClientFactory::with_script(MockScript {
            handshake_code: Some("2@qr".into()),
            ..MockScript::default()
        });
        let session = MessagingSession::new(number(), &factory, Arc::new(EventHub::new()));
        session.start().unwrap();
        wait_state(&session, SessionState::AwaitingHandshake).await;

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.wait_for_ready().await })
        };
        session.stop().await.unwrap();

        assert_eq!(
            waiter.await.unwrap(),
            Err(SessionError::Ended(SessionState::Stopped))
        );
    }
}
