//! Scriptable messaging client for tests and demos.
//!
//! The factory keeps every client it creates so callers can drive lifecycle
//! signals and assert on `initialize`/`destroy` counts.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;

use crate::{
    phone::PhoneNumber,
    traits::{ClientError, ClientFactory, ClientSignal, MessagingClient, SignalSender},
};

/// Behaviour applied to every client a [`MockClientFactory`] creates.
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    /// Emit this handshake code from `initialize`.
    pub handshake_code: Option<String>,
    /// Fail `initialize` with this message.
    pub fail_initialize: Option<String>,
    /// Fail `destroy`.
    pub fail_destroy: bool,
}

/// Mock messaging client.
pub struct MockClient {
    phone: PhoneNumber,
    signals: SignalSender,
    script: MockScript,
    initialize_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
}

impl MockClient {
    /// Phone number this client is bound to.
    #[must_use]
    pub const fn phone(&self) -> &PhoneNumber {
        &self.phone
    }

    /// Emit a lifecycle signal. Returns `false` once the session is gone.
    pub fn emit(&self, signal: ClientSignal) -> bool {
        self.signals.send(signal).is_ok()
    }

    /// Number of `initialize` calls so far.
    #[must_use]
    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    /// Number of `destroy` calls so far.
    #[must_use]
    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagingClient for MockClient {
    async fn initialize(&self) -> Result<(), ClientError> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref message) = self.script.fail_initialize {
            return Err(ClientError::Initialize(message.clone()));
        }
        if let Some(ref code) = self.script.handshake_code {
            self.emit(ClientSignal::Qr(code.clone()));
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_destroy {
            return Err(ClientError::Destroy("mock teardown failure".to_string()));
        }
        Ok(())
    }
}

/// Factory producing [`MockClient`]s.
#[derive(Clone, Default)]
pub struct MockClientFactory {
    script: MockScript,
    clients: Arc<Mutex<HashMap<PhoneNumber, Vec<Arc<MockClient>>>>>,
}

impl MockClientFactory {
    /// Create a factory whose clients do nothing on their own.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory applying `script` to every client.
    #[must_use]
    pub fn with_script(script: MockScript) -> Self {
        Self {
            script,
            clients: Arc::default(),
        }
    }

    /// Most recently created client for `phone`.
    #[must_use]
    pub fn client(&self, phone: &PhoneNumber) -> Option<Arc<MockClient>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(phone)
            .and_then(|list| list.last().cloned())
    }

    /// Total clients created across all numbers.
    #[must_use]
    pub fn created(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

impl ClientFactory for MockClientFactory {
    fn create(&self, phone: &PhoneNumber, signals: SignalSender) -> Arc<dyn MessagingClient> {
        let client = Arc::new(MockClient {
            phone: phone.clone(),
            signals,
            script: self.script.clone(),
            initialize_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
        });

        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(phone.clone())
            .or_default()
            .push(Arc::clone(&client));

        client
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn test_scripted_initialize_emits_code() {
        let factory = MockClientFactory::with_script(MockScript {
            handshake_code: Some("2@code".to_string()),
            ..MockScript::default()
        });
        let phone = PhoneNumber::new("6281234567890", 62);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let client = factory.create(&phone, tx);
        client.initialize().await.unwrap();

        assert_eq!(rx.recv().await, Some(ClientSignal::Qr("2@code".to_string())));
        let mock = factory.client(&phone).unwrap();
        assert_eq!(mock.initialize_calls(), 1);
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let factory = MockClientFactory::with_script(MockScript {
            fail_initialize: Some("browser crashed".to_string()),
            fail_destroy: true,
            ..MockScript::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = factory.create(&PhoneNumber::new("1", 1), tx);

        assert!(matches!(
            client.initialize().await,
            Err(ClientError::Initialize(_))
        ));
        assert!(matches!(client.destroy().await, Err(ClientError::Destroy(_))));
    }
}
