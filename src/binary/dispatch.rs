//! Per-connection message broadcast.
//!
//! The receive loop hands every decoded message to `Dispatcher::broadcast`.
//! Callers waiting for a reply hold a `Subscription` filtered by message
//! kind; dropping it deregisters the filter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::protocol::{MessageKind, ServerMessage};
use crate::error::{Error, Result};

struct Subscriber {
    id: u64,
    kinds: SmallVec<[MessageKind; 4]>,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

#[derive(Default)]
struct State {
    subscribers: Vec<Subscriber>,
    closed: bool,
}

/// Broadcast list of live subscriptions.
#[derive(Default)]
pub struct Dispatcher {
    next_id: AtomicU64,
    state: Mutex<State>,
}

impl Dispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register interest in `kinds`. Messages broadcast before this call are
    /// not replayed.
    pub fn subscribe(self: &Arc<Self>, kinds: &[MessageKind]) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        if !state.closed {
            state.subscribers.push(Subscriber {
                id,
                kinds: kinds.iter().copied().collect(),
                tx,
            });
        }
        // When closed, `tx` is dropped here and the subscription sees
        // end-of-stream on its first wait.

        Subscription {
            id,
            rx,
            dispatcher: Arc::downgrade(self),
        }
    }

    /// Deliver `message` to every subscriber interested in its kind.
    /// Returns the number of deliveries.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        let kind = message.kind();
        let mut delivered = 0;
        let mut state = self.state.lock();
        state.subscribers.retain(|sub| {
            if !sub.kinds.contains(&kind) {
                return !sub.tx.is_closed();
            }
            match sub.tx.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Drop every subscriber; pending and future waits end immediately.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    fn unsubscribe(&self, id: u64) {
        self.state.lock().subscribers.retain(|sub| sub.id != id);
    }
}

/// A filtered view over the broadcast stream.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
    dispatcher: Weak<Dispatcher>,
}

impl Subscription {
    /// Wait for the next matching message.
    ///
    /// Races the reply against `timeout` and the connection's lifetime
    /// token. A timeout leaves the connection open.
    pub async fn next(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
        waiting_for: &str,
    ) -> Result<ServerMessage> {
        tokio::select! {
            biased;

            message = self.rx.recv() => message.ok_or_else(|| {
                Error::Connection(format!("connection closed while waiting for {}", waiting_for))
            }),
            _ = cancel.cancelled() => Err(Error::Connection(format!(
                "connection closed while waiting for {}",
                waiting_for
            ))),
            _ = tokio::time::sleep(timeout) => {
                warn!(waiting_for, timeout_ms = timeout.as_millis() as u64, "Reply wait timed out");
                Err(Error::Timeout(format!("{} after {:?}", waiting_for, timeout)))
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::packet::Headers;
    use crate::binary::protocol::TransactionState;

    const WAIT: Duration = Duration::from_secs(5);

    fn ready() -> ServerMessage {
        ServerMessage::ReadyForCommand {
            headers: Headers::new(),
            transaction_state: TransactionState::NotInTransaction,
        }
    }

    fn complete() -> ServerMessage {
        ServerMessage::CommandComplete {
            headers: Headers::new(),
            status: "SELECT".into(),
        }
    }

    #[tokio::test]
    async fn test_filtered_delivery() {
        let dispatcher = Dispatcher::new();
        let cancel = CancellationToken::new();
        let mut sub = dispatcher.subscribe(&[MessageKind::ReadyForCommand]);

        assert_eq!(dispatcher.broadcast(&complete()), 0);
        assert_eq!(dispatcher.broadcast(&ready()), 1);

        let msg = sub.next(WAIT, &cancel, "ReadyForCommand").await.unwrap();
        assert_eq!(msg.kind(), MessageKind::ReadyForCommand);
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let dispatcher = Dispatcher::new();
        let sub = dispatcher.subscribe(&[MessageKind::Data]);
        assert_eq!(dispatcher.subscriber_count(), 1);
        drop(sub);
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_distinct() {
        let dispatcher = Dispatcher::new();
        let cancel = CancellationToken::new();
        let mut sub = dispatcher.subscribe(&[MessageKind::PrepareComplete]);

        let err = sub
            .next(Duration::from_secs(15), &cancel, "PrepareComplete")
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let dispatcher = Dispatcher::new();
        let cancel = CancellationToken::new();
        let mut sub = dispatcher.subscribe(&[MessageKind::Data]);

        let canceller = cancel.clone();
        tokio::spawn(async move { canceller.cancel() });

        let err = sub.next(WAIT, &cancel, "Data").await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn test_closed_dispatcher_ends_waits() {
        let dispatcher = Dispatcher::new();
        let cancel = CancellationToken::new();
        let mut before = dispatcher.subscribe(&[MessageKind::Data]);
        dispatcher.close();
        let mut after = dispatcher.subscribe(&[MessageKind::Data]);

        assert!(matches!(
            before.next(WAIT, &cancel, "Data").await,
            Err(Error::Connection(_))
        ));
        assert!(matches!(
            after.next(WAIT, &cancel, "Data").await,
            Err(Error::Connection(_))
        ));
        assert_eq!(dispatcher.subscriber_count(), 0);
    }
}
