//! Secret custody — generation, hashlock derivation, release policy.
//!
//! Secrets are minted from OS entropy, held in a private table keyed
//! by session, and leave the process only through [`SecretManager::release`].
//! Snapshots never contain plaintext; a restarted orchestrator cannot
//! release secrets for sessions created by a previous process.

use crate::error::{OrchestratorError, Result};
use crate::types::{Hashlock, Session};

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

/// A secret bound to a session. `plaintext` is only ever copied out by
/// an authorized release.
struct SecretRecord {
    plaintext: [u8; 32],
    hashlock: Hashlock,
    created_at: DateTime<Utc>,
    released_to: Option<String>,
    released_at: Option<DateTime<Utc>>,
}

pub struct SecretManager {
    records: Mutex<HashMap<String, SecretRecord>>,
}

/// SHA-256 of a candidate preimage.
pub fn hashlock_of(secret: &[u8]) -> Hashlock {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    Hashlock(hasher.finalize().into())
}

impl SecretManager {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a fresh 32-byte secret for `session_id` and return its
    /// hashlock. `OsRng` reads the OS entropy source directly and
    /// aborts the process if it is unavailable — a weak secret is never
    /// emitted.
    pub fn mint(&self, session_id: &str, now: DateTime<Utc>) -> Result<Hashlock> {
        let mut plaintext = [0u8; 32];
        OsRng.fill_bytes(&mut plaintext);
        let hashlock = hashlock_of(&plaintext);

        let mut records = self.records.lock().unwrap();
        if records.contains_key(session_id) {
            return Err(OrchestratorError::StateConflict(format!(
                "session {session_id} already holds a secret"
            )));
        }
        records.insert(
            session_id.to_string(),
            SecretRecord {
                plaintext,
                hashlock,
                created_at: now,
                released_to: None,
                released_at: None,
            },
        );
        Ok(hashlock)
    }

    /// The hashlock for a session. Public — the hashlock is published
    /// on-chain anyway.
    pub fn hashlock_for(&self, session_id: &str) -> Option<Hashlock> {
        self.records
            .lock()
            .unwrap()
            .get(session_id)
            .map(|r| r.hashlock)
    }

    /// Release the plaintext to `principal`, subject to policy: the
    /// caller must be the session taker and the session must be at or
    /// past `BothLocked` on the success path. Idempotent — a repeated
    /// authorized call returns the same secret and refreshes
    /// `released_at`.
    pub fn release(
        &self,
        session: &Session,
        principal: &str,
        now: DateTime<Utc>,
    ) -> Result<[u8; 32]> {
        if !principal.eq_ignore_ascii_case(&session.taker) {
            warn!(
                session_id = %session.session_id,
                principal = %principal,
                "secret release denied: principal is not the taker"
            );
            return Err(OrchestratorError::Unauthorized(
                "principal is not the session taker".into(),
            ));
        }
        if !session.status.allows_secret_release() {
            warn!(
                session_id = %session.session_id,
                status = ?session.status,
                "secret release denied: session not in a releasable state"
            );
            return Err(OrchestratorError::Unauthorized(format!(
                "secret not releasable in state {:?}",
                session.status
            )));
        }

        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&session.session_id).ok_or_else(|| {
            OrchestratorError::NotFound(format!("no secret for session {}", session.session_id))
        })?;

        record.released_to = Some(principal.to_string());
        record.released_at = Some(now);
        info!(
            session_id = %session.session_id,
            principal = %principal,
            "secret released to taker"
        );
        Ok(record.plaintext)
    }

    /// Drop the secret for a session outright.
    pub fn wipe(&self, session_id: &str) {
        self.records.lock().unwrap().remove(session_id);
    }

    /// Wipe secrets older than `retention`. The manager calls this for
    /// terminal sessions past their retention window.
    pub fn purge_older_than(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, r| now - r.created_at < retention);
        before - records.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl Default for SecretManager {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ───────────────────────────────────────────────────────
