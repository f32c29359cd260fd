//! Record is the unit of data read from the source and passed around until the
//! topology has finished with it. The moment a record is read it is inserted
//! into the [crate::tracker] and a [DoneHandle] is attached. The handle is
//! reference counted; when the last copy of the record is dropped the
//! completion (success or failure) is reported to the tracker, which is what
//! lets the runtime commit source offsets for fully processed records only.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// A keyed record read from one partition of the source.
/// NOTE: it is cheap to clone.
#[derive(Debug, Clone)]
pub struct Record {
    /// partition the record was read from
    pub partition: u16,
    /// offset of the record within its partition
    pub offset: i64,
    /// key of the record
    pub key: Bytes,
    /// actual payload of the record
    pub value: Bytes,
    /// event time of the record
    pub event_time: DateTime<Utc>,
    /// headers of the record
    pub headers: Arc<HashMap<String, String>>,
    /// completion handle, present only while the record is tracked
    pub(crate) done: Option<Arc<DoneHandle>>,
}

impl Record {
    pub fn new(
        partition: u16,
        offset: i64,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            partition,
            offset,
            key: key.into(),
            value: value.into(),
            event_time,
            headers: Arc::new(HashMap::new()),
            done: None,
        }
    }

    /// Marks the record as failed so the completion reported on drop is a
    /// failure and its offset is never committed.
    pub(crate) fn mark_failed(&self) {
        if let Some(done) = &self.done {
            done.failed.store(true, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.partition, self.offset)
    }
}

/// Completion reported to the tracker when the last copy of a [Record] is
/// dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Completion {
    pub(crate) partition: u16,
    pub(crate) offset: i64,
    pub(crate) failed: bool,
}

/// DoneHandle reports the fate of a record to the tracker. It is reference
/// counted and sends exactly once, when the final copy is dropped.
#[derive(Debug)]
pub(crate) struct DoneHandle {
    tx: mpsc::UnboundedSender<Completion>,
    partition: u16,
    offset: i64,
    failed: AtomicBool,
}

impl DoneHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Completion>, partition: u16, offset: i64) -> Self {
        Self {
            tx,
            partition,
            offset,
            failed: AtomicBool::new(false),
        }
    }
}

impl Drop for DoneHandle {
    fn drop(&mut self) {
        // The tracker owning the receiver may already be gone during shutdown.
        let _ = self.tx.send(Completion {
            partition: self.partition,
            offset: self.offset,
            failed: self.failed.load(Ordering::Relaxed),
        });
    }
}

/// Pluggable dispatch-key extractor. Must be pure and deterministic, a
/// non-deterministic extractor breaks the per-key ordering invariant.
pub type DispatchKeyFn = Arc<dyn Fn(&Record) -> Bytes + Send + Sync>;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a over the dispatch-key bytes. Worker assignment must be
/// reproducible across process restarts, so we use this explicit hash instead
/// of the per-process randomly seeded `DefaultHasher`.
pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maps a dispatch key to a worker index in `0..workers`.
pub(crate) fn worker_index(dispatch_key: &[u8], workers: usize) -> usize {
    (fnv1a(dispatch_key) % workers as u64) as usize
}
