//! The changelog is an external append-only, partitioned, keyed log. Every
//! store mutation is appended to it before (synchronous mode) or shortly after
//! (buffered mode) the in-memory map reflects the change, and it is the only
//! source a store replays from during recovery. The broker side is expected to
//! compact it (`cleanup.policy = compact`) so it retains the latest value per
//! key; compaction itself is out of scope here.

use bytes::Bytes;

use crate::Result;

/// In-memory changelog backend.
pub mod memory;

/// Buffered append path for stores running with buffered durability.
pub(crate) mod buffer;

/// One mutation as recorded in the changelog. Per-partition order is the
/// recovery replay order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogRecord {
    /// key the mutation applies to
    pub key: Bytes,
    /// new value, `None` is a tombstone
    pub value: Option<Bytes>,
    /// partition the record was appended to
    pub partition: u16,
    /// offset assigned by the log
    pub offset: i64,
}

impl ChangelogRecord {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Interface to the external changelog log. Implementations are expected to
/// retry transient unavailability internally with backoff; errors surfacing
/// from here abort the mutation that caused them.
#[trait_variant::make(Send)]
pub trait ChangelogLog: Clone + Sync + 'static {
    /// Appends a record to a partition and returns the assigned offset.
    /// A `None` value appends a tombstone.
    async fn append(&self, partition: u16, key: Bytes, value: Option<Bytes>) -> Result<i64>;

    /// Reads a partition from `offset` (inclusive) up to its current end.
    /// Used only during recovery; the result is finite.
    async fn read_from(&self, partition: u16, offset: i64) -> Result<Vec<ChangelogRecord>>;
}
