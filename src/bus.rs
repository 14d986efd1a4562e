//! In-process pub/sub fanning session and chain events out to
//! WebSocket subscribers and the audit log.
//!
//! Publishers never block: each subscriber owns a bounded queue with
//! drop-oldest overflow, and the drop count is surfaced to the
//! subscriber with its next delivered frame.

use crate::error::{OrchestratorError, Result};
use crate::types::{ChainEvent, ExecutionStep, SessionStatus};

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tracing::debug;

/// Per-subscriber buffer capacity.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Progress payload attached to `session_update` frames.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UpdateData {
    pub progress: u8,
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    SessionUpdate {
        session_id: String,
        status: SessionStatus,
        data: UpdateData,
    },
    ExecutionStep {
        session_id: String,
        step: ExecutionStep,
    },
    BlockchainEvent {
        session_id: String,
        event: ChainEvent,
    },
    /// Operational notices: unauthorized secret attempts, unmatched
    /// events, chain-client trouble.
    Audit {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl BusEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            BusEvent::SessionUpdate { session_id, .. }
            | BusEvent::ExecutionStep { session_id, .. }
            | BusEvent::BlockchainEvent { session_id, .. } => Some(session_id),
            BusEvent::Audit { session_id, .. } => session_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Global,
    Session(String),
}

/// The receiving end of a subscription.
pub struct EventSink {
    queue: Mutex<VecDeque<BusEvent>>,
    dropped: AtomicU64,
    notify: Notify,
}

impl EventSink {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    fn push(&self, event: BusEvent) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= SUBSCRIBER_BUFFER {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Wait for the next event.
    pub async fn recv(&self) -> BusEvent {
        loop {
            if let Some(ev) = self.queue.lock().unwrap().pop_front() {
                return ev;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<BusEvent> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Events lost to overflow since the last call.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

struct SubEntry {
    client_id: String,
    channel: Channel,
    sink: Arc<EventSink>,
}

pub struct Subscription {
    pub id: u64,
    pub sink: Arc<EventSink>,
}

pub struct EventBus {
    subscribers: RwLock<HashMap<u64, SubEntry>>,
    next_id: AtomicU64,
    max_per_session: usize,
}

impl EventBus {
    pub fn new(max_per_session: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_per_session,
        }
    }

    /// Subscribe a client to a channel. Idempotent per
    /// `(client, channel)` — re-subscribing returns the existing sink.
    pub fn subscribe(&self, client_id: &str, channel: Channel) -> Result<Subscription> {
        let mut subs = self.subscribers.write().unwrap();

        if let Some((id, entry)) = subs
            .iter()
            .find(|(_, e)| e.client_id == client_id && e.channel == channel)
        {
            return Ok(Subscription {
                id: *id,
                sink: entry.sink.clone(),
            });
        }

        if let Channel::Session(sid) = &channel {
            let count = subs
                .values()
                .filter(|e| matches!(&e.channel, Channel::Session(s) if s == sid))
                .count();
            if count >= self.max_per_session {
                return Err(OrchestratorError::StateConflict(format!(
                    "session {sid} already has {count} subscribers"
                )));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sink = Arc::new(EventSink::new());
        subs.insert(
            id,
            SubEntry {
                client_id: client_id.to_string(),
                channel,
                sink: sink.clone(),
            },
        );
        Ok(Subscription { id, sink })
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().unwrap().remove(&id);
    }

    /// Drop every subscription a client holds (connection closed).
    pub fn drop_client(&self, client_id: &str) {
        self.subscribers
            .write()
            .unwrap()
            .retain(|_, e| e.client_id != client_id);
    }

    /// Fan an event out to every matching subscriber. Global
    /// subscribers see everything; session subscribers see only their
    /// session.
    pub fn publish(&self, event: BusEvent) {
        let subs = self.subscribers.read().unwrap();
        debug!(subscribers = subs.len(), "bus publish");
        for entry in subs.values() {
            let matches = match &entry.channel {
                Channel::Global => true,
                Channel::Session(sid) => event.session_id() == Some(sid.as_str()),
            };
            if matches {
                entry.sink.push(event.clone());
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn update(session_id: &str) -> BusEvent {
        BusEvent::SessionUpdate {
            session_id: session_id.into(),
            status: SessionStatus::Created,
            data: UpdateData {
                progress: 0,
                phase: "created".into(),
                tx_ref: None,
                contract_ref: None,
            },
        }
    }

    #[test]
    fn session_subscriber_sees_only_its_session() {
        let bus = EventBus::new(64);
        let sub = bus.subscribe("c1", Channel::Session("s-1".into())).unwrap();
        bus.publish(update("s-1"));
        bus.publish(update("s-2"));
        assert!(sub.sink.try_recv().is_some());
        assert!(sub.sink.try_recv().is_none());
    }

    #[test]
    fn global_subscriber_sees_everything() {
        let bus = EventBus::new(64);
        let sub = bus.subscribe("c1", Channel::Global).unwrap();
        bus.publish(update("s-1"));
        bus.publish(BusEvent::Audit {
            code: "no_match".into(),
            message: "src:0xabc:0".into(),
            session_id: None,
        });
        assert!(sub.sink.try_recv().is_some());
        assert!(sub.sink.try_recv().is_some());
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let bus = EventBus::new(64);
        let sub = bus.subscribe("c1", Channel::Session("s-1".into())).unwrap();
        for _ in 0..SUBSCRIBER_BUFFER + 10 {
            bus.publish(update("s-1"));
        }
        assert_eq!(sub.sink.take_dropped(), 10);
        assert_eq!(sub.sink.take_dropped(), 0);
        let mut received = 0;
        while sub.sink.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[test]
    fn duplicate_subscribe_is_idempotent() {
        let bus = EventBus::new(64);
        let a = bus.subscribe("c1", Channel::Session("s-1".into())).unwrap();
        let b = bus.subscribe("c1", Channel::Session("s-1".into())).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn per_session_cap_enforced() {
        let bus = EventBus::new(2);
        bus.subscribe("c1", Channel::Session("s-1".into())).unwrap();
        bus.subscribe("c2", Channel::Session("s-1".into())).unwrap();
        assert!(bus.subscribe("c3", Channel::Session("s-1".into())).is_err());
        // A different session is unaffected.
        assert!(bus.subscribe("c3", Channel::Session("s-2".into())).is_ok());
    }

    #[test]
    fn drop_client_removes_all_subscriptions() {
        let bus = EventBus::new(64);
        bus.subscribe("c1", Channel::Global).unwrap();
        bus.subscribe("c1", Channel::Session("s-1".into())).unwrap();
        bus.subscribe("c2", Channel::Global).unwrap();
        bus.drop_client("c1");
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let bus = Arc::new(EventBus::new(64));
        let sub = bus.subscribe("c1", Channel::Session("s-1".into())).unwrap();
        let bus2 = bus.clone();
        let handle = tokio::spawn(async move { sub.sink.recv().await });
        tokio::task::yield_now().await;
        bus2.publish(update("s-1"));
        let ev = handle.await.unwrap();
        assert_eq!(ev.session_id(), Some("s-1"));
    }

    #[test]
    fn publish_order_preserved_per_subscriber() {
        let bus = EventBus::new(64);
        let sub = bus.subscribe("c1", Channel::Session("s-1".into())).unwrap();
        for i in 0..5u32 {
            bus.publish(BusEvent::ExecutionStep {
                session_id: "s-1".into(),
                step: crate::types::ExecutionStep {
                    id: i,
                    contract: "escrow".into(),
                    function: "lock".into(),
                    params: serde_json::json!({}),
                    status: crate::types::StepStatus::Completed,
                    tx_ref: None,
                    gas_used: None,
                    error: None,
                    timestamp: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
                },
            });
        }
        for i in 0..5u32 {
            match sub.sink.try_recv().unwrap() {
                BusEvent::ExecutionStep { step, .. } => assert_eq!(step.id, i),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}
