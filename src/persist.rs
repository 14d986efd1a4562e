//! Persistent state layout under `state/`.
//!
//! ```text
//! state/
//!   sessions/<id>.json   session snapshots
//!   cursors/src.cursor   last processed source block
//!   cursors/dst.cursor   last processed destination block
//!   dedup.log            append-only event-id log, compacted on start
//! ```
//!
//! Snapshots are written atomically (tmp file + rename) so a crash
//! mid-write never leaves a torn session file.

use crate::error::{OrchestratorError, Result};
use crate::types::{ChainSide, Session};

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Keys kept in `dedup.log` after compaction, matching the in-memory
/// LRU bound.
pub const DEDUP_COMPACT_KEEP: usize = 100_000;

#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Open (and create) the state directory tree.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("sessions"))?;
        fs::create_dir_all(root.join("cursors"))?;
        Ok(Self { root })
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.root.join("sessions").join(format!("{session_id}.json"))
    }

    pub fn save_session(&self, session: &Session) -> Result<()> {
        let path = self.session_path(&session.session_id);
        let body = serde_json::to_vec_pretty(session)?;
        write_atomic(&path, &body)
    }

    /// Load every snapshot under `sessions/`. Unreadable files are
    /// skipped with a warning rather than aborting startup.
    pub fn load_sessions(&self) -> Result<Vec<Session>> {
        let dir = self.root.join("sessions");
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).map_err(OrchestratorError::from).and_then(|b| {
                serde_json::from_slice::<Session>(&b).map_err(OrchestratorError::from)
            }) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable snapshot"),
            }
        }
        Ok(sessions)
    }

    pub fn cursor(&self, side: ChainSide) -> CursorFile {
        CursorFile {
            path: self.root.join("cursors").join(format!("{side}.cursor")),
        }
    }

    pub fn dedup_log(&self) -> Result<DedupLog> {
        DedupLog::open(self.root.join("dedup.log"))
    }
}

/// Last-processed-block marker for one chain. Owned by that chain's
/// client; nothing else writes it.
#[derive(Debug, Clone)]
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn load(&self) -> Result<Option<u64>> {
        match fs::read_to_string(&self.path) {
            Ok(s) => {
                let block = s.trim().parse::<u64>().map_err(|e| {
                    OrchestratorError::Internal(format!(
                        "corrupt cursor {}: {e}",
                        self.path.display()
                    ))
                })?;
                Ok(Some(block))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn store(&self, block: u64) -> Result<()> {
        write_atomic(&self.path, block.to_string().as_bytes())
    }
}

/// Append-only event-id log backing the dedup LRU across restarts.
pub struct DedupLog {
    path: PathBuf,
    writer: Mutex<File>,
}

impl DedupLog {
    fn open(path: PathBuf) -> Result<Self> {
        let writer = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    pub fn append(&self, key: &str) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{key}")?;
        Ok(())
    }

    /// Read all keys, keep the most recent [`DEDUP_COMPACT_KEEP`], and
    /// rewrite the log to that tail. Returns the kept keys, oldest
    /// first, for seeding the in-memory LRU.
    pub fn load_and_compact(&self) -> Result<Vec<String>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut keys: Vec<String> = reader
            .lines()
            .filter_map(|l| l.ok())
            .filter(|l| !l.is_empty())
            .collect();

        if keys.len() > DEDUP_COMPACT_KEEP {
            keys.drain(..keys.len() - DEDUP_COMPACT_KEEP);
        }

        let mut body = String::with_capacity(keys.len() * 32);
        for key in &keys {
            body.push_str(key);
            body.push('\n');
        }
        write_atomic(&self.path, body.as_bytes())?;

        // Reopen the append handle against the compacted file.
        let mut writer = self.writer.lock().unwrap();
        *writer = OpenOptions::new().create(true).append(true).open(&self.path)?;

        debug!(kept = keys.len(), "dedup log compacted");
        Ok(keys)
    }
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────
