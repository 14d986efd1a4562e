//! Event monitor — tails both chain clients, deduplicates, and
//! correlates events to sessions by hashlock.
//!
//! Dedup key is `(chain, tx_ref, log_index)`, held in a bounded LRU
//! and mirrored to the append-only dedup log so replay across restart
//! is safe. Events that match no live session are recorded, never
//! silently dropped.

use crate::bus::{BusEvent, EventBus};
use crate::chain::ChainClient;
use crate::persist::DedupLog;
use crate::store::SessionStore;
use crate::types::ChainEvent;

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Bound on the in-memory dedup cache.
pub const DEDUP_CAPACITY: usize = 100_000;

#[derive(Debug, Clone, Default)]
pub struct MonitorStats {
    pub received: u64,
    pub deduplicated: u64,
    pub forwarded: u64,
    pub unmatched: u64,
}

pub struct EventMonitor {
    clients: Vec<Arc<dyn ChainClient>>,
    store: Arc<SessionStore>,
    bus: Arc<EventBus>,
    /// Correlated events leave through here; the session manager's
    /// router consumes the other end.
    outbound: mpsc::Sender<(String, ChainEvent)>,
    seen: Mutex<LruCache<String, ()>>,
    dedup_log: Arc<DedupLog>,
    poll_interval: Duration,
    stats: Mutex<MonitorStats>,
}

impl EventMonitor {
    pub fn new(
        clients: Vec<Arc<dyn ChainClient>>,
        store: Arc<SessionStore>,
        bus: Arc<EventBus>,
        outbound: mpsc::Sender<(String, ChainEvent)>,
        dedup_log: Arc<DedupLog>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            clients,
            store,
            bus,
            outbound,
            seen: Mutex::new(LruCache::new(NonZeroUsize::new(DEDUP_CAPACITY).unwrap())),
            dedup_log,
            poll_interval,
            stats: Mutex::new(MonitorStats::default()),
        }
    }

    /// Seed the dedup cache from the compacted log, oldest first.
    pub fn seed_dedup(&self, keys: Vec<String>) {
        let mut seen = self.seen.lock().unwrap();
        let count = keys.len();
        for key in keys {
            seen.put(key, ());
        }
        info!(count, "dedup cache seeded from log");
    }

    /// Handle one decoded event: dedup, correlate, forward. Returns
    /// whether the event reached a session worker.
    pub async fn process(&self, event: ChainEvent) -> bool {
        let key = event.dedup_key();
        {
            let mut stats = self.stats.lock().unwrap();
            stats.received += 1;
        }

        {
            let mut seen = self.seen.lock().unwrap();
            if seen.contains(&key) {
                self.stats.lock().unwrap().deduplicated += 1;
                return false;
            }
            seen.put(key.clone(), ());
        }
        if let Err(e) = self.dedup_log.append(&key) {
            error!(error = %e, "dedup log append failed");
        }

        // A terminal session is no longer live; its hashlock no longer
        // claims events.
        let session = self
            .store
            .find_by_hashlock(&event.hashlock)
            .filter(|s| !s.status.is_terminal());
        let Some(session) = session else {
            warn!(
                dedup_key = %key,
                hashlock = %event.hashlock,
                kind = ?event.kind,
                "event matches no live session"
            );
            self.stats.lock().unwrap().unmatched += 1;
            self.bus.publish(BusEvent::Audit {
                code: "no_match".into(),
                message: key,
                session_id: None,
            });
            return false;
        };

        self.bus.publish(BusEvent::BlockchainEvent {
            session_id: session.session_id.clone(),
            event: event.clone(),
        });

        if self
            .outbound
            .send((session.session_id.clone(), event))
            .await
            .is_err()
        {
            error!(session_id = %session.session_id, "session router closed; event lost");
            return false;
        }
        self.stats.lock().unwrap().forwarded += 1;
        true
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats.lock().unwrap().clone()
    }

    /// One polling loop per chain so a stalled RPC on one side never
    /// delays the other.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.clients
            .iter()
            .cloned()
            .map(|client| {
                let monitor = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(monitor.poll_interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = ticker.tick() => {}
                        }
                        match client.poll_confirmed().await {
                            Ok(events) => {
                                for event in events {
                                    monitor.process(event).await;
                                }
                            }
                            Err(e) => {
                                warn!(chain = %client.side(), error = %e, "chain poll failed");
                                monitor.bus.publish(BusEvent::Audit {
                                    code: "chain_unavailable".into(),
                                    message: format!("{}: {e}", client.side()),
                                    session_id: None,
                                });
                            }
                        }
                    }
                    info!(chain = %client.side(), "monitor loop stopped");
                })
            })
            .collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────
