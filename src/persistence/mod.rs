//! Snapshot persistence
//!
//! The logical snapshot owned by the identity kernel: identity prose,
//! every component's exported state, scheduler meta, and monotonic
//! counters. The backend here is a single JSON file written atomically
//! (temp file then rename); restore is all-or-nothing — a snapshot that
//! fails to parse or validate leaves the caller with a freshly
//! initialized core.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dream::DreamRecord;
use crate::episodic::EpisodicState;
use crate::error::{CoreError, CoreResult};
use crate::goals::GoalState;
use crate::identity::IdentityState;
use crate::interests::InterestState;
use crate::lifecycle::LifecycleState;
use crate::memory::MemoryState;
use crate::scheduler::SchedulerCounters;
use crate::skills::SkillState;
use crate::streams::DegradationCounters;
use crate::wisdom::WisdomState;

/// Bumped on any incompatible schema change.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Scheduler position and topology at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerMeta {
    pub cycle_number: u64,
    pub global_step: u64,
    pub stream_offsets: Vec<u8>,
    pub lifecycle: LifecycleState,
}

/// Monotonic counters carried across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotCounters {
    pub scheduler: SchedulerCounters,
    /// Per-stream handler degradation counters
    pub degradation: Vec<DegradationCounters>,
    pub dream_records: Vec<DreamRecord>,
}

/// The complete logical snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub identity: IdentityState,
    pub memory: MemoryState,
    pub episodic: EpisodicState,
    pub interests: InterestState,
    pub wisdom: WisdomState,
    pub skills: SkillState,
    pub goals: GoalState,
    pub scheduler: SchedulerMeta,
    pub counters: SnapshotCounters,
}

/// File-backed snapshot store.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write the snapshot atomically: serialize to a sibling temp file,
    /// then rename over the target.
    pub fn save(&self, snapshot: &Snapshot) -> CoreResult<()> {
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| CoreError::Transient(format!("snapshot serialize: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json)
            .map_err(|e| CoreError::Transient(format!("snapshot write: {e}")))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| CoreError::Transient(format!("snapshot rename: {e}")))?;

        info!(path = %self.path.display(), bytes = json.len(), "snapshot saved");
        Ok(())
    }

    /// Load and validate a snapshot. Any failure is terminal for the
    /// restore attempt; the caller falls back to a fresh core.
    pub fn load(&self) -> CoreResult<Snapshot> {
        if !self.exists() {
            return Err(CoreError::NotFound(format!(
                "no snapshot at {}",
                self.path.display()
            )));
        }
        let bytes = fs::read(&self.path)
            .map_err(|e| CoreError::Fatal(format!("snapshot read: {e}")))?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::Fatal(format!("snapshot parse: {e}")))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CoreError::Fatal(format!(
                "snapshot version {} incompatible with {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        debug!(path = %self.path.display(), "snapshot loaded");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn minimal_snapshot() -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            identity: IdentityState::default(),
            memory: MemoryState::default(),
            episodic: EpisodicState::default(),
            interests: Vec::new(),
            wisdom: Vec::new(),
            skills: Vec::new(),
            goals: Vec::new(),
            scheduler: SchedulerMeta {
                cycle_number: 4,
                global_step: 50,
                stream_offsets: vec![0, 4, 8],
                lifecycle: LifecycleState::Awake,
            },
            counters: SnapshotCounters::default(),
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state.json"));
        let snapshot = minimal_snapshot();

        store.save(&snapshot).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn missing_snapshot_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("absent.json"));
        assert!(matches!(store.load(), Err(CoreError::NotFound(_))));
    }

    #[test]
    fn corrupt_snapshot_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{ not json").unwrap();
        let store = SnapshotStore::new(path);
        assert!(matches!(store.load(), Err(CoreError::Fatal(_))));
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state.json"));
        let mut snapshot = minimal_snapshot();
        snapshot.version = SNAPSHOT_VERSION + 1;
        store.save(&snapshot).unwrap();
        assert!(matches!(store.load(), Err(CoreError::Fatal(_))));
    }

    #[test]
    fn save_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state.json"));

        let mut first = minimal_snapshot();
        first.scheduler.global_step = 1;
        store.save(&first).unwrap();

        let mut second = minimal_snapshot();
        second.scheduler.global_step = 2;
        store.save(&second).unwrap();

        assert_eq!(store.load().unwrap().scheduler.global_step, 2);
    }
}
