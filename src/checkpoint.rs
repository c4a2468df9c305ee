//! Crash-recoverable checkpoint for live recordings
//!
//! The host supplies a string key/value store ([`CheckpointStore`]). On top of
//! it the recording is kept as an append-only log of raw samples:
//!
//! - `session/meta` - session identity, chunk count and the range of live segments
//! - `session/segment/<n>` - one JSON array of samples per flush
//! - `session/chunk/<n>` - the samples of a run of segments, after compaction
//!
//! A flush writes its segment first and the meta last, so a torn flush leaves
//! an unreferenced segment that recovery never reads. Compaction folds only the
//! live segments into a new chunk, writes the chunk before the meta that counts
//! it, and removes the folded segments last. A crash at any point replays each
//! sample exactly once, and every sample is compacted at most once.
//!
//! Recovery replays the raw samples through the same pipeline as live
//! ingestion; no derived state is ever persisted.

use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::RawSample;

pub const META_KEY: &str = "session/meta";
const SEGMENT_PREFIX: &str = "session/segment/";
const CHUNK_PREFIX: &str = "session/chunk/";

/// Checkpoint layout version
pub const CHECKPOINT_VERSION: u32 = 1;

pub fn segment_key(n: u32) -> String {
    format!("{SEGMENT_PREFIX}{n}")
}

pub fn chunk_key(n: u32) -> String {
    format!("{CHUNK_PREFIX}{n}")
}

/// Persistence collaborator: a durable string key/value store
pub trait CheckpointStore {
    fn get(&self, key: &str) -> Result<Option<String>, EngineError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), EngineError>;
    fn remove(&mut self, key: &str) -> Result<(), EngineError>;
}

/// In-memory store, for tests and hosts that bridge to their own storage
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    entries: HashMap<String, String>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), EngineError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), EngineError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Directory-backed store: one file per key, replaced atomically via rename
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Open (and create if needed) a checkpoint directory
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            EngineError::CheckpointWrite(format!("create {}: {e}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::RecoveryCorrupt(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), EngineError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| EngineError::CheckpointWrite(format!("write {}: {e}", path.display())))
    }

    fn remove(&mut self, key: &str) -> Result<(), EngineError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::CheckpointWrite(format!(
                "remove {}: {e}",
                path.display()
            ))),
        }
    }
}

/// Session identity and the live segment range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub version: u32,
    pub session_id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    /// Seconds spent recording as of the last flush
    #[serde(default)]
    pub elapsed_secs: f64,
    /// Compacted chunks, numbered from 0
    #[serde(default)]
    pub chunks: u32,
    /// First segment not folded into a chunk
    pub first_segment: u32,
    /// Number the next flushed segment will get
    pub next_segment: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chunk {
    session_id: String,
    /// Segments folded into `samples`, end exclusive
    segments: (u32, u32),
    samples: Vec<RawSample>,
}

/// A checkpoint read back from the store
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub meta: CheckpointMeta,
    pub samples: Vec<RawSample>,
}

/// Writer for one session's checkpoint log
#[derive(Debug, Clone)]
pub struct CheckpointLog {
    meta: CheckpointMeta,
    compact_after_segments: u32,
}

impl CheckpointLog {
    /// Start a new log and write its meta.
    pub fn create<S: CheckpointStore + ?Sized>(
        store: &mut S,
        session_id: String,
        name: String,
        started_at: DateTime<Utc>,
        compact_after_segments: u32,
    ) -> Result<Self, EngineError> {
        let log = Self {
            meta: CheckpointMeta {
                version: CHECKPOINT_VERSION,
                session_id,
                name,
                started_at,
                elapsed_secs: 0.0,
                chunks: 0,
                first_segment: 0,
                next_segment: 0,
            },
            compact_after_segments,
        };
        log.write_meta(store)?;
        Ok(log)
    }

    /// Continue appending to a recovered log.
    pub fn resume(meta: CheckpointMeta, compact_after_segments: u32) -> Self {
        Self {
            meta,
            compact_after_segments,
        }
    }

    pub fn meta(&self) -> &CheckpointMeta {
        &self.meta
    }

    /// Append one segment of samples, compacting when enough have piled up.
    ///
    /// On error the in-memory meta is unchanged, so the same samples can be
    /// retried with the next flush.
    pub fn append<S: CheckpointStore + ?Sized>(
        &mut self,
        store: &mut S,
        samples: &[RawSample],
        elapsed_secs: f64,
    ) -> Result<(), EngineError> {
        let segment = self.meta.next_segment;
        let json = serde_json::to_string(samples)?;
        store.set(&segment_key(segment), &json)?;

        let mut meta = self.meta.clone();
        meta.next_segment = segment + 1;
        meta.elapsed_secs = elapsed_secs;
        store.set(META_KEY, &serde_json::to_string(&meta)?)?;
        self.meta = meta;

        let live_segments = self.meta.next_segment - self.meta.first_segment;
        if self.compact_after_segments > 0 && live_segments >= self.compact_after_segments {
            // A failed compaction leaves a valid (longer) log behind
            if let Err(e) = self.compact(store) {
                log::warn!("checkpoint compaction failed: {e}");
            }
        }
        Ok(())
    }

    /// Record elapsed time without adding samples.
    pub fn touch<S: CheckpointStore + ?Sized>(
        &mut self,
        store: &mut S,
        elapsed_secs: f64,
    ) -> Result<(), EngineError> {
        let mut meta = self.meta.clone();
        meta.elapsed_secs = elapsed_secs;
        store.set(META_KEY, &serde_json::to_string(&meta)?)?;
        self.meta = meta;
        Ok(())
    }

    /// Fold the live segments into a new chunk.
    pub fn compact<S: CheckpointStore + ?Sized>(&mut self, store: &mut S) -> Result<(), EngineError> {
        let folded = self.meta.first_segment..self.meta.next_segment;
        if folded.is_empty() {
            return Ok(());
        }

        let chunk = Chunk {
            session_id: self.meta.session_id.clone(),
            segments: (folded.start, folded.end),
            samples: Self::read_segments(store, folded.clone())?,
        };
        let number = self.meta.chunks;
        store.set(&chunk_key(number), &serde_json::to_string(&chunk)?)?;

        let mut meta = self.meta.clone();
        meta.chunks = number + 1;
        meta.first_segment = folded.end;
        store.set(META_KEY, &serde_json::to_string(&meta)?)?;
        self.meta = meta;

        for n in folded {
            if let Err(e) = store.remove(&segment_key(n)) {
                log::warn!("could not remove compacted segment {n}: {e}");
            }
        }
        log::debug!(
            "compacted segments {}..{} into chunk {number} ({} samples)",
            chunk.segments.0,
            chunk.segments.1,
            chunk.samples.len()
        );
        Ok(())
    }

    /// Read the checkpoint, if any.
    ///
    /// Returns `Ok(None)` when no session was persisted and
    /// `Err(RecoveryCorrupt)` when one was but cannot be read consistently.
    pub fn load<S: CheckpointStore + ?Sized>(
        store: &S,
    ) -> Result<Option<LoadedCheckpoint>, EngineError> {
        let raw = match store.get(META_KEY)? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let meta: CheckpointMeta = serde_json::from_str(&raw)
            .map_err(|e| EngineError::RecoveryCorrupt(format!("meta: {e}")))?;
        if meta.version != CHECKPOINT_VERSION {
            return Err(EngineError::RecoveryCorrupt(format!(
                "unsupported checkpoint version {}",
                meta.version
            )));
        }
        if meta.first_segment > meta.next_segment {
            return Err(EngineError::RecoveryCorrupt(format!(
                "segment range {}..{} is inverted",
                meta.first_segment, meta.next_segment
            )));
        }

        let samples = Self::read(store, &meta)?;
        Ok(Some(LoadedCheckpoint { meta, samples }))
    }

    /// Remove every key the checkpoint may have written.
    pub fn clear<S: CheckpointStore + ?Sized>(store: &mut S) -> Result<(), EngineError> {
        let meta = store
            .get(META_KEY)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str::<CheckpointMeta>(&raw).ok());
        // One past the counted range: a torn flush or compaction may have
        // left an unreferenced key there
        let (chunks, segments) = meta
            .map(|m| (0..=m.chunks, 0..=m.next_segment))
            .unwrap_or((0..=0, 0..=0));

        // Meta goes first so a partial clear never looks recoverable
        store.remove(META_KEY)?;
        for n in chunks {
            store.remove(&chunk_key(n))?;
        }
        for n in segments {
            store.remove(&segment_key(n))?;
        }
        Ok(())
    }

    /// Chunks, then live segments, in order
    fn read<S: CheckpointStore + ?Sized>(
        store: &S,
        meta: &CheckpointMeta,
    ) -> Result<Vec<RawSample>, EngineError> {
        let mut samples = Vec::new();
        let mut expected_start = 0;

        for n in 0..meta.chunks {
            let raw = store.get(&chunk_key(n))?.ok_or_else(|| {
                EngineError::RecoveryCorrupt(format!("chunk {n} is missing"))
            })?;
            let chunk: Chunk = serde_json::from_str(&raw)
                .map_err(|e| EngineError::RecoveryCorrupt(format!("chunk {n}: {e}")))?;
            if chunk.session_id != meta.session_id || chunk.segments.0 != expected_start {
                return Err(EngineError::RecoveryCorrupt(format!(
                    "chunk {n} does not continue the log"
                )));
            }
            expected_start = chunk.segments.1;
            samples.extend(chunk.samples);
        }
        if expected_start != meta.first_segment {
            return Err(EngineError::RecoveryCorrupt(format!(
                "chunks end at segment {expected_start}, live segments start at {}",
                meta.first_segment
            )));
        }

        samples.extend(Self::read_segments(store, meta.first_segment..meta.next_segment)?);
        Ok(samples)
    }

    fn read_segments<S: CheckpointStore + ?Sized>(
        store: &S,
        range: Range<u32>,
    ) -> Result<Vec<RawSample>, EngineError> {
        let mut samples = Vec::new();
        for n in range {
            let raw = store.get(&segment_key(n))?.ok_or_else(|| {
                EngineError::RecoveryCorrupt(format!("segment {n} is missing"))
            })?;
            let segment: Vec<RawSample> = serde_json::from_str(&raw)
                .map_err(|e| EngineError::RecoveryCorrupt(format!("segment {n}: {e}")))?;
            samples.extend(segment);
        }
        Ok(samples)
    }

    fn write_meta<S: CheckpointStore + ?Sized>(&self, store: &mut S) -> Result<(), EngineError> {
        store.set(META_KEY, &serde_json::to_string(&self.meta)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn samples(from: i64, count: i64) -> Vec<RawSample> {
        let t0 = Utc.with_ymd_and_hms(2024, 2, 10, 9, 0, 0).unwrap();
        (from..from + count)
            .map(|i| RawSample::new(46.0 + i as f64 * 1e-4, 7.0, t0 + Duration::seconds(i)))
            .collect()
    }

    fn create(store: &mut MemoryCheckpointStore, compact_after: u32) -> CheckpointLog {
        CheckpointLog::create(
            store,
            "session-1".to_string(),
            "Morning".to_string(),
            Utc.with_ymd_and_hms(2024, 2, 10, 9, 0, 0).unwrap(),
            compact_after,
        )
        .unwrap()
    }

    #[test]
    fn test_append_and_load() {
        let mut store = MemoryCheckpointStore::new();
        let mut log = create(&mut store, 0);
        log.append(&mut store, &samples(0, 3), 3.0).unwrap();
        log.append(&mut store, &samples(3, 2), 5.0).unwrap();

        let loaded = CheckpointLog::load(&store).unwrap().unwrap();
        assert_eq!(loaded.samples, samples(0, 5));
        assert_eq!(loaded.meta.name, "Morning");
        assert_eq!(loaded.meta.elapsed_secs, 5.0);
    }

    #[test]
    fn test_empty_store_has_nothing_to_load() {
        let store = MemoryCheckpointStore::new();
        assert!(CheckpointLog::load(&store).unwrap().is_none());
    }

    #[test]
    fn test_compaction_preserves_samples() {
        let mut store = MemoryCheckpointStore::new();
        let mut log = create(&mut store, 3);
        for i in 0..7 {
            log.append(&mut store, &samples(i * 2, 2), 0.0).unwrap();
        }

        // Two compactions happened, segment 6 is still live
        assert_eq!(log.meta().first_segment, 6);
        assert_eq!(log.meta().chunks, 2);
        assert!(!store.contains_key(&segment_key(0)));
        assert!(store.contains_key(&chunk_key(1)));
        assert!(store.contains_key(&segment_key(6)));

        let loaded = CheckpointLog::load(&store).unwrap().unwrap();
        assert_eq!(loaded.samples, samples(0, 14));
    }

    #[test]
    fn test_torn_flush_is_ignored() {
        let mut store = MemoryCheckpointStore::new();
        let mut log = create(&mut store, 0);
        log.append(&mut store, &samples(0, 2), 0.0).unwrap();
        // Segment written, meta never updated
        store
            .set(&segment_key(1), &serde_json::to_string(&samples(2, 2)).unwrap())
            .unwrap();

        let loaded = CheckpointLog::load(&store).unwrap().unwrap();
        assert_eq!(loaded.samples.len(), 2);
    }

    #[test]
    fn test_crash_during_compaction_does_not_duplicate() {
        let mut store = MemoryCheckpointStore::new();
        let mut log = create(&mut store, 0);
        log.append(&mut store, &samples(0, 2), 0.0).unwrap();
        log.append(&mut store, &samples(2, 2), 0.0).unwrap();

        // Chunk written, meta still points at the segments
        let chunk = Chunk {
            session_id: "session-1".to_string(),
            segments: (0, 2),
            samples: samples(0, 4),
        };
        store
            .set(&chunk_key(0), &serde_json::to_string(&chunk).unwrap())
            .unwrap();

        let loaded = CheckpointLog::load(&store).unwrap().unwrap();
        assert_eq!(loaded.samples, samples(0, 4));

        // The next compaction overwrites the orphan
        log.append(&mut store, &samples(4, 2), 0.0).unwrap();
        log.compact(&mut store).unwrap();
        let loaded = CheckpointLog::load(&store).unwrap().unwrap();
        assert_eq!(loaded.samples, samples(0, 6));
        assert_eq!(loaded.meta.chunks, 1);
    }

    #[test]
    fn test_compaction_never_rewrites_old_samples() {
        let mut store = MemoryCheckpointStore::new();
        let mut log = create(&mut store, 4);
        for i in 0..40 {
            log.append(&mut store, &samples(i * 10, 10), i as f64).unwrap();
        }

        assert_eq!(log.meta().chunks, 10);
        for n in 0..10 {
            let raw = store.get(&chunk_key(n)).unwrap().unwrap();
            let chunk: Chunk = serde_json::from_str(&raw).unwrap();
            assert_eq!(chunk.segments, (n * 4, n * 4 + 4));
            assert_eq!(chunk.samples, samples(n as i64 * 40, 40));
        }

        let loaded = CheckpointLog::load(&store).unwrap().unwrap();
        assert_eq!(loaded.samples, samples(0, 400));
    }

    #[test]
    fn test_missing_chunk_is_reported() {
        let mut store = MemoryCheckpointStore::new();
        let mut log = create(&mut store, 2);
        for i in 0..4 {
            log.append(&mut store, &samples(i, 1), 0.0).unwrap();
        }
        store.remove(&chunk_key(0)).unwrap();

        assert!(matches!(
            CheckpointLog::load(&store),
            Err(EngineError::RecoveryCorrupt(_))
        ));
    }

    #[test]
    fn test_touch_persists_elapsed_only() {
        let mut store = MemoryCheckpointStore::new();
        let mut log = create(&mut store, 0);
        log.append(&mut store, &samples(0, 3), 3.0).unwrap();
        log.touch(&mut store, 120.0).unwrap();

        let loaded = CheckpointLog::load(&store).unwrap().unwrap();
        assert_eq!(loaded.samples, samples(0, 3));
        assert_eq!(loaded.meta.elapsed_secs, 120.0);
        assert_eq!(loaded.meta.next_segment, 1);
    }

    #[test]
    fn test_corrupt_segment_is_reported() {
        let mut store = MemoryCheckpointStore::new();
        let mut log = create(&mut store, 0);
        log.append(&mut store, &samples(0, 2), 0.0).unwrap();
        store.set(&segment_key(0), "[{not json").unwrap();

        assert!(matches!(
            CheckpointLog::load(&store),
            Err(EngineError::RecoveryCorrupt(_))
        ));
    }

    #[test]
    fn test_clear_removes_everything() {
        let mut store = MemoryCheckpointStore::new();
        let mut log = create(&mut store, 2);
        for i in 0..5 {
            log.append(&mut store, &samples(i, 1), 0.0).unwrap();
        }
        assert_eq!(log.meta().chunks, 2);
        CheckpointLog::clear(&mut store).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path().join("ckpt")).unwrap();

        assert_eq!(store.get(META_KEY).unwrap(), None);
        store.set(META_KEY, "{\"a\":1}").unwrap();
        store.set(&segment_key(3), "[]").unwrap();
        assert_eq!(store.get(META_KEY).unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(store.get(&segment_key(3)).unwrap().as_deref(), Some("[]"));

        store.remove(META_KEY).unwrap();
        store.remove(META_KEY).unwrap();
        assert_eq!(store.get(META_KEY).unwrap(), None);
    }
}
