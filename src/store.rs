//! In-process session store with hashlock and party indices.
//!
//! Readers (API status queries) take the read lock; the only writers
//! are the session workers, which never hold the lock across an await.

use crate::error::{OrchestratorError, Result};
use crate::types::{Hashlock, Session, SessionStatus};

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    by_hashlock: HashMap<Hashlock, String>,
    by_party: HashMap<String, Vec<String>>,
}

pub struct SessionStore {
    inner: RwLock<Inner>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Insert a new session. Fails if the id or hashlock is already
    /// live.
    pub fn insert(&self, session: Session) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.sessions.contains_key(&session.session_id) {
            return Err(OrchestratorError::StateConflict(format!(
                "session {} already exists",
                session.session_id
            )));
        }
        if inner.by_hashlock.contains_key(&session.hashlock) {
            return Err(OrchestratorError::StateConflict(format!(
                "hashlock {} already bound to a live session",
                session.hashlock
            )));
        }
        inner
            .by_hashlock
            .insert(session.hashlock, session.session_id.clone());
        for party in [session.maker.to_lowercase(), session.taker.to_lowercase()] {
            inner
                .by_party
                .entry(party)
                .or_default()
                .push(session.session_id.clone());
        }
        inner.sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.read().unwrap().sessions.get(session_id).cloned()
    }

    pub fn find_by_hashlock(&self, hashlock: &Hashlock) -> Option<Session> {
        let inner = self.inner.read().unwrap();
        let id = inner.by_hashlock.get(hashlock)?;
        inner.sessions.get(id).cloned()
    }

    pub fn find_by_party(&self, address: &str) -> Vec<Session> {
        let inner = self.inner.read().unwrap();
        inner
            .by_party
            .get(&address.to_lowercase())
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply a mutation under the write lock and return the updated
    /// copy. The closure must not block.
    pub fn update<F>(&self, session_id: &str, f: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut inner = self.inner.write().unwrap();
        let session = inner.sessions.get_mut(session_id).ok_or_else(|| {
            OrchestratorError::NotFound(format!("session {session_id}"))
        })?;
        f(session);
        Ok(session.clone())
    }

    /// Remove a session and its index entries. Returns the removed
    /// session if it was present.
    pub fn remove(&self, session_id: &str) -> Option<Session> {
        let mut inner = self.inner.write().unwrap();
        let session = inner.sessions.remove(session_id)?;
        inner.by_hashlock.remove(&session.hashlock);
        for party in [session.maker.to_lowercase(), session.taker.to_lowercase()] {
            if let Some(ids) = inner.by_party.get_mut(&party) {
                ids.retain(|id| id != session_id);
                if ids.is_empty() {
                    inner.by_party.remove(&party);
                }
            }
        }
        Some(session)
    }

    pub fn list(&self) -> Vec<Session> {
        self.inner.read().unwrap().sessions.values().cloned().collect()
    }

    pub fn list_active(&self) -> Vec<Session> {
        self.inner
            .read()
            .unwrap()
            .sessions
            .values()
            .filter(|s| !s.status.is_terminal())
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .sessions
            .values()
            .filter(|s| !s.status.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChainLeg, Timelocks, Urgency};
    use chrono::{DateTime, Duration};

    fn session(id: &str, hashlock: Hashlock) -> Session {
        let created = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let expires = created + Duration::seconds(3600);
        Session {
            session_id: id.into(),
            hashlock,
            status: SessionStatus::Created,
            failure_reason: None,
            source: ChainLeg {
                chain_id: "base".into(),
                token: "USDC".into(),
                amount: 1_000_000,
                lock: None,
            },
            destination: ChainLeg {
                chain_id: "near".into(),
                token: "wNEAR".into(),
                amount: 50_000_000,
                lock: None,
            },
            maker: "0xMaker".into(),
            taker: "0xTaker".into(),
            destination_address: None,
            slippage_bps: 50,
            urgency: Urgency::Normal,
            created_at: created,
            updated_at: created,
            expires_at: expires,
            timelocks: Timelocks::derive(created, expires),
            execution_trace: vec![],
        }
    }

    #[test]
    fn insert_and_lookup_by_hashlock() {
        let store = SessionStore::new();
        let h = Hashlock([1; 32]);
        store.insert(session("s-1", h)).unwrap();
        assert_eq!(store.find_by_hashlock(&h).unwrap().session_id, "s-1");
        assert!(store.find_by_hashlock(&Hashlock([2; 32])).is_none());
    }

    #[test]
    fn duplicate_hashlock_rejected() {
        let store = SessionStore::new();
        let h = Hashlock([1; 32]);
        store.insert(session("s-1", h)).unwrap();
        assert!(store.insert(session("s-2", h)).is_err());
    }

    #[test]
    fn duplicate_id_rejected() {
        let store = SessionStore::new();
        store.insert(session("s-1", Hashlock([1; 32]))).unwrap();
        assert!(store.insert(session("s-1", Hashlock([2; 32]))).is_err());
    }

    #[test]
    fn party_index_finds_maker_and_taker() {
        let store = SessionStore::new();
        store.insert(session("s-1", Hashlock([1; 32]))).unwrap();
        assert_eq!(store.find_by_party("0xmaker").len(), 1);
        assert_eq!(store.find_by_party("0xTAKER").len(), 1);
        assert!(store.find_by_party("0xnobody").is_empty());
    }

    #[test]
    fn update_mutates_in_place() {
        let store = SessionStore::new();
        store.insert(session("s-1", Hashlock([1; 32]))).unwrap();
        let updated = store
            .update("s-1", |s| s.status = SessionStatus::SourceLocked)
            .unwrap();
        assert_eq!(updated.status, SessionStatus::SourceLocked);
        assert_eq!(store.get("s-1").unwrap().status, SessionStatus::SourceLocked);
    }

    #[test]
    fn update_missing_is_not_found() {
        let store = SessionStore::new();
        assert!(store.update("nope", |_| {}).is_err());
    }

    #[test]
    fn remove_clears_indices() {
        let store = SessionStore::new();
        let h = Hashlock([1; 32]);
        store.insert(session("s-1", h)).unwrap();
        assert!(store.remove("s-1").is_some());
        assert!(store.get("s-1").is_none());
        assert!(store.find_by_hashlock(&h).is_none());
        assert!(store.find_by_party("0xmaker").is_empty());
        assert!(store.remove("s-1").is_none());
    }

    #[test]
    fn active_count_excludes_terminal() {
        let store = SessionStore::new();
        store.insert(session("s-1", Hashlock([1; 32]))).unwrap();
        store.insert(session("s-2", Hashlock([2; 32]))).unwrap();
        store
            .update("s-2", |s| s.status = SessionStatus::Completed)
            .unwrap();
        assert_eq!(store.active_count(), 1);
        assert_eq!(store.list_active().len(), 1);
        assert_eq!(store.len(), 2);
    }
}
