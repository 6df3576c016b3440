//! Per-number broadcast + history event channel.

use std::{
    collections::{HashMap, VecDeque},
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    phone::PhoneNumber,
    traits::{EventPublisher, SessionEvent},
};

/// Default number of events retained per phone number.
pub const DEFAULT_HISTORY: usize = 32;

const CHANNEL_CAPACITY: usize = 64;

struct Channel {
    history: VecDeque<SessionEvent>,
    sender: broadcast::Sender<SessionEvent>,
}

impl Channel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            history: VecDeque::new(),
            sender,
        }
    }
}

/// Subscriber channel with broadcast and history support.
///
/// A subscriber that attaches after a handshake code was issued still
/// receives it: history is replayed before live events.
pub struct EventHub {
    channels: RwLock<HashMap<PhoneNumber, Channel>>,
    history_limit: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Create a hub retaining [`DEFAULT_HISTORY`] events per number.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY)
    }

    /// Create a hub retaining at most `history_limit` events per number.
    #[must_use]
    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            history_limit,
        }
    }

    /// Push an event to live listeners and history.
    pub fn push(&self, phone: &PhoneNumber, event: SessionEvent) {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let channel = channels.entry(phone.clone()).or_insert_with(Channel::new);

        let _ = channel.sender.send(event.clone()); // live listeners
        if self.history_limit == 0 {
            return;
        }
        while channel.history.len() >= self.history_limit {
            channel.history.pop_front();
        }
        channel.history.push_back(event);
    }

    /// Get a snapshot of the history of `phone`.
    #[must_use]
    pub fn get_history(&self, phone: &PhoneNumber) -> Vec<SessionEvent> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(phone)
            .map(|c| c.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget the history of `phone`. Live subscribers stay attached.
    pub fn clear_history(&self, phone: &PhoneNumber) {
        if let Some(channel) = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(phone)
        {
            channel.history.clear();
        }
    }

    /// Stream that yields history first, then live events.
    ///
    /// Lagged events are skipped rather than ending the stream.
    #[must_use]
    pub fn history_plus_stream(
        &self,
        phone: &PhoneNumber,
    ) -> futures::stream::BoxStream<'static, SessionEvent> {
        // Snapshot and subscribe under one lock so no event is lost or doubled.
        let (history, rx) = {
            let mut channels = self
                .channels
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let channel = channels.entry(phone.clone()).or_insert_with(Channel::new);
            (
                channel.history.iter().cloned().collect::<Vec<_>>(),
                channel.sender.subscribe(),
            )
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}

impl EventPublisher for EventHub {
    fn publish(&self, phone: &PhoneNumber, event: SessionEvent) {
        tracing::debug!(%phone, ?event, "publishing session event");
        self.push(phone, event);
    }

    fn begin(&self, phone: &PhoneNumber) {
        self.clear_history(phone);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number() -> PhoneNumber {
        PhoneNumber::new("6281234567890", 62)
    }

    #[test]
    fn test_history_is_bounded() {
        let hub = EventHub::with_history_limit(2);
        hub.push(&number(), SessionEvent::HandshakeCode { code: "a".into() });
        hub.push(&number(), SessionEvent::Authenticated);
        hub.push(&number(), SessionEvent::Ready);

        assert_eq!(
            hub.get_history(&number()),
            vec![SessionEvent::Authenticated, SessionEvent::Ready]
        );
    }

    #[test]
    fn test_channels_are_keyed_by_number() {
        let hub = EventHub::new();
        let other = PhoneNumber::new("6281234567890", 1);
        hub.push(&number(), SessionEvent::Ready);

        assert!(hub.get_history(&other).is_empty());
        hub.clear_history(&number());
        assert!(hub.get_history(&number()).is_empty());
    }

    #[tokio::test]
    async fn test_begin_drops_previous_session_history() {
        let hub = EventHub::new();
        hub.publish(&number(), SessionEvent::HandshakeCode { code: "old".into() });
        hub.publish(&number(), SessionEvent::Ready);
        let mut live = hub.history_plus_stream(&number());

        hub.begin(&number());
        hub.publish(&number(), SessionEvent::HandshakeCode { code: "new".into() });

        assert_eq!(
            hub.get_history(&number()),
            vec![SessionEvent::HandshakeCode { code: "new".into() }]
        );
        // Attached subscribers keep receiving live events.
        assert_eq!(
            live.next().await,
            Some(SessionEvent::HandshakeCode { code: "old".into() })
        );
        assert_eq!(live.next().await, Some(SessionEvent::Ready));
        assert_eq!(
            live.next().await,
            Some(SessionEvent::HandshakeCode { code: "new".into() })
        );
    }

    #[tokio::test]
    async fn test_history_then_live() {
        let hub = EventHub::new();
        hub.push(&number(), SessionEvent::HandshakeCode { code: "qr".into() });

        let mut stream = hub.history_plus_stream(&number());
        hub.publish(&number(), SessionEvent::Authenticated);

        assert_eq!(
            stream.next().await,
            Some(SessionEvent::HandshakeCode { code: "qr".into() })
        );
        assert_eq!(stream.next().await, Some(SessionEvent::Authenticated));
    }
}
