//! Append-only connection event journal with snapshots.
//!
//! One directory per connection holding a JSON-line event log and the
//! latest snapshot manifest. Recovery loads the snapshot (if any) and
//! replays events with a higher sequence number in append order. A corrupt
//! tail (torn write on crash) is tolerated: decoding stops at the first
//! bad line with a warning.

use crate::connections::events::{ConnectionState, ConnectivityEvent};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::runtime::Handle;
use tracing::warn;

const JOURNAL_FILE: &str = "journal.log";
const SNAPSHOT_FILE: &str = "manifest.json";

/// Persistence id of a connection, `connection:<id>`.
pub fn persistence_id(connection_id: &str) -> String {
    format!("connection:{connection_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotManifest {
    persistence_id: String,
    seq: u64,
    state: ConnectionState,
}

/// Everything persisted for one connection directory: the snapshot state
/// (if any) and the journal events still on disk, in append order. After a
/// `CleanupPersistence` compaction the snapshot may be the only record of
/// the connection's early history.
#[derive(Debug, Default)]
pub struct PersistedHistory {
    pub snapshot: Option<ConnectionState>,
    pub events: Vec<ConnectivityEvent>,
}

impl PersistedHistory {
    /// Fold the snapshot and subsequent events into the recovered state;
    /// events already covered by the snapshot are skipped.
    pub fn state(&self) -> ConnectionState {
        let mut state = self.snapshot.clone().unwrap_or_default();
        for event in &self.events {
            if event.seq > state.last_seq {
                state.apply(event);
            }
        }
        state
    }
}

/// Journal facade; cheap to clone, all IO runs off the async runtime.
#[derive(Debug, Clone)]
pub struct ConnectionJournal {
    base: PathBuf,
}

impl ConnectionJournal {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    fn dir_for(&self, connection_id: &str) -> PathBuf {
        let sanitized: String = connection_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.base.join(format!("conn_{sanitized}"))
    }

    async fn run_blocking<T, F>(work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if Handle::try_current().is_ok() {
            tokio::task::spawn_blocking(work)
                .await
                .context("join journal task")?
        } else {
            work()
        }
    }

    /// Append one event.
    pub async fn append(&self, connection_id: &str, event: &ConnectivityEvent) -> Result<()> {
        let dir = self.dir_for(connection_id);
        let line = serde_json::to_string(event).context("encode journal event")?;
        Self::run_blocking(move || {
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
            let path = dir.join(JOURNAL_FILE);
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open journal {}", path.display()))?;
            writeln!(file, "{line}").with_context(|| format!("append {}", path.display()))?;
            file.sync_data()
                .with_context(|| format!("sync {}", path.display()))?;
            Ok(())
        })
        .await
    }

    /// Write a point-in-time snapshot of the folded state.
    pub async fn snapshot(&self, connection_id: &str, state: &ConnectionState) -> Result<()> {
        let dir = self.dir_for(connection_id);
        let manifest = SnapshotManifest {
            persistence_id: persistence_id(connection_id),
            seq: state.last_seq,
            state: state.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("encode snapshot")?;
        Self::run_blocking(move || {
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
            let path = dir.join(SNAPSHOT_FILE);
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
            fs::rename(&tmp, &path).with_context(|| format!("replace {}", path.display()))?;
            Ok(())
        })
        .await
    }

    /// Recover state: latest snapshot plus subsequent events in order.
    pub async fn replay(&self, connection_id: &str) -> Result<ConnectionState> {
        let dir = self.dir_for(connection_id);
        Self::run_blocking(move || Self::replay_dir(&dir)).await
    }

    /// Read the snapshot and decodable journal events for one connection
    /// directory. A corrupt tail (torn write on crash) stops decoding at
    /// the first bad line with a warning; everything before it is intact.
    pub fn read_history(dir: &Path) -> Result<PersistedHistory> {
        let snapshot = match fs::read(dir.join(SNAPSHOT_FILE)) {
            Ok(bytes) => {
                let manifest: SnapshotManifest =
                    serde_json::from_slice(&bytes).context("decode snapshot manifest")?;
                Some(manifest.state)
            }
            Err(_) => None,
        };
        let mut events = Vec::new();
        if let Ok(raw) = fs::read_to_string(dir.join(JOURNAL_FILE)) {
            for line in raw.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str(line) {
                    Ok(event) => events.push(event),
                    Err(err) => {
                        warn!("journal truncation in {}: {err}", dir.display());
                        break;
                    }
                }
            }
        }
        Ok(PersistedHistory { snapshot, events })
    }

    fn replay_dir(dir: &Path) -> Result<ConnectionState> {
        Self::read_history(dir).map(|history| history.state())
    }

    /// Drop events already folded into the snapshot; returns how many
    /// lines were removed.
    pub async fn cleanup(&self, connection_id: &str) -> Result<u64> {
        let dir = self.dir_for(connection_id);
        Self::run_blocking(move || {
            let manifest_seq = match fs::read(dir.join(SNAPSHOT_FILE)) {
                Ok(bytes) => serde_json::from_slice::<SnapshotManifest>(&bytes)
                    .map(|m| m.seq)
                    .unwrap_or(0),
                Err(_) => 0,
            };
            if manifest_seq == 0 {
                return Ok(0);
            }
            let journal_path = dir.join(JOURNAL_FILE);
            let raw = match fs::read_to_string(&journal_path) {
                Ok(raw) => raw,
                Err(_) => return Ok(0),
            };
            let mut kept = Vec::new();
            let mut removed = 0u64;
            for line in raw.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ConnectivityEvent>(line) {
                    Ok(event) if event.seq <= manifest_seq => removed += 1,
                    _ => kept.push(line.to_string()),
                }
            }
            if removed == 0 {
                return Ok(0);
            }
            let tmp = journal_path.with_extension("log.tmp");
            let mut contents = kept.join("\n");
            if !contents.is_empty() {
                contents.push('\n');
            }
            fs::write(&tmp, contents).with_context(|| format!("write {}", tmp.display()))?;
            fs::rename(&tmp, &journal_path)
                .with_context(|| format!("replace {}", journal_path.display()))?;
            Ok(removed)
        })
        .await
    }

    /// Remove everything persisted for a connection (reaping a tombstone).
    pub async fn purge(&self, connection_id: &str) -> Result<()> {
        let dir = self.dir_for(connection_id);
        Self::run_blocking(move || {
            if dir.exists() {
                fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
            }
            Ok(())
        })
        .await
    }

    /// Connection ids present on disk, recovered from snapshot or journal.
    pub async fn list_connection_ids(&self) -> Result<Vec<String>> {
        let base = self.base.clone();
        Self::run_blocking(move || {
            if !base.exists() {
                return Ok(Vec::new());
            }
            let mut ids = Vec::new();
            for entry in fs::read_dir(&base).with_context(|| format!("read {}", base.display()))? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.starts_with("conn_") {
                    continue;
                }
                let state = Self::replay_dir(&entry.path())?;
                if let Some(connection) = state.connection {
                    ids.push(connection.id);
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await
    }
}
