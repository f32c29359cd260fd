//! In-memory partitioned changelog. Stands in for the external broker-backed
//! log in tests and local runs; it lives outside the stores that append to it,
//! so a store can be torn down and rebuilt from it the same way it would be
//! from a real log.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::changelog::{ChangelogLog, ChangelogRecord};
use crate::{Error, Result};

#[derive(Debug)]
struct MemoryEntry {
    key: Bytes,
    value: Option<Bytes>,
}

/// Append-only in-memory log, one growable segment per partition.
/// Cheap to clone; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryChangelog {
    partitions: Arc<Mutex<HashMap<u16, Vec<MemoryEntry>>>>,
}

impl MemoryChangelog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records appended to a partition so far.
    pub fn end_offset(&self, partition: u16) -> i64 {
        self.partitions
            .lock()
            .get(&partition)
            .map_or(0, |entries| entries.len() as i64)
    }
}

impl ChangelogLog for MemoryChangelog {
    async fn append(&self, partition: u16, key: Bytes, value: Option<Bytes>) -> Result<i64> {
        let mut partitions = self.partitions.lock();
        let entries = partitions.entry(partition).or_default();
        entries.push(MemoryEntry { key, value });
        Ok((entries.len() - 1) as i64)
    }

    async fn read_from(&self, partition: u16, offset: i64) -> Result<Vec<ChangelogRecord>> {
        if offset < 0 {
            return Err(Error::Changelog(format!(
                "read offset must be non-negative, got {offset}"
            )));
        }
        let partitions = self.partitions.lock();
        let Some(entries) = partitions.get(&partition) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .enumerate()
            .skip(offset as usize)
            .map(|(idx, entry)| ChangelogRecord {
                key: entry.key.clone(),
                value: entry.value.clone(),
                partition,
                offset: idx as i64,
            })
            .collect())
    }
}
