//! Time-windowed state on top of the point store. The window managers map an
//! event time to the aligned windows containing it; the windowed store
//! persists per-window aggregates under a composite key of
//! (base key, window start, window end) and expires windows lazily once
//! stream time has moved past their end by more than the retention.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::WindowConfig;
use crate::store::StoreHandle;
use crate::{Error, Result};

/// Tumbling window operations.
pub mod tumbling;
/// Hopping window operations.
pub mod hopping;

use hopping::HoppingWindower;
use tumbling::TumblingWindower;

/// A window is represented by its start and end time; all records whose event
/// time falls within `[start_time, end_time)` aggregate into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// Start time of the window (inclusive).
    pub start_time: DateTime<Utc>,
    /// End time of the window (exclusive).
    pub end_time: DateTime<Utc>,
}

impl Ord for Window {
    fn cmp(&self, other: &Self) -> Ordering {
        self.end_time.cmp(&other.end_time)
    }
}

impl PartialOrd for Window {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Window {
    pub(crate) fn new(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time,
        }
    }

    pub(crate) fn from_millis(start_millis: i64, end_millis: i64) -> Self {
        Self::new(
            Utc.timestamp_millis_opt(start_millis).unwrap(),
            Utc.timestamp_millis_opt(end_millis).unwrap(),
        )
    }
}

/// WindowManager that can be either tumbling or hopping, selected from the
/// window configuration at construction.
#[derive(Debug, Clone)]
pub enum WindowManager {
    Tumbling(TumblingWindower),
    Hopping(HoppingWindower),
}

impl WindowManager {
    pub fn from_config(config: &WindowConfig) -> Self {
        if config.advance == config.size {
            WindowManager::Tumbling(TumblingWindower::new(config.size))
        } else {
            WindowManager::Hopping(HoppingWindower::new(config.size, config.advance))
        }
    }

    /// Returns every aligned window containing the event time, oldest first.
    /// Exactly one for tumbling, possibly several for hopping.
    pub fn assign_windows(&self, event_time: DateTime<Utc>) -> Vec<Window> {
        match self {
            WindowManager::Tumbling(windower) => windower.assign_windows(event_time),
            WindowManager::Hopping(windower) => windower.assign_windows(event_time),
        }
    }
}

/// Outcome of assigning a record's event time against retained windows.
/// `Late` is a distinguishable result, not an error, so callers can count or
/// reroute late records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowAssignment {
    Windows(Vec<Window>),
    Late,
}

/// Windowed view over a point store. Holds the manager, the retention policy,
/// and this worker's stream time (the maximum event time observed so far,
/// monotonic). One instance per worker; instances share the underlying store
/// but keep their own stream clock.
pub struct WindowedStore {
    store: StoreHandle,
    manager: WindowManager,
    retention: chrono::Duration,
    stream_time: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl WindowedStore {
    pub fn new(store: StoreHandle, config: &WindowConfig) -> Self {
        Self {
            store,
            manager: WindowManager::from_config(config),
            retention: chrono::Duration::from_std(config.retention)
                .unwrap_or(chrono::Duration::MAX),
            stream_time: Arc::new(Mutex::new(None)),
        }
    }

    pub fn stream_time(&self) -> Option<DateTime<Utc>> {
        *self.stream_time.lock()
    }

    /// Advances stream time to the record's event time (never backwards) and
    /// returns the retained windows the event belongs to, or `Late` when all
    /// of them are past retention.
    pub fn assign(&self, event_time: DateTime<Utc>) -> WindowAssignment {
        {
            let mut stream_time = self.stream_time.lock();
            match *stream_time {
                Some(current) if current >= event_time => {}
                _ => *stream_time = Some(event_time),
            }
        }

        let windows = self.manager.assign_windows(event_time);
        let live: Vec<Window> = windows
            .into_iter()
            .filter(|window| !self.is_expired(window))
            .collect();
        if live.is_empty() {
            debug!(event_time = %event_time, "Event past window retention");
            return WindowAssignment::Late;
        }
        WindowAssignment::Windows(live)
    }

    /// Fetches the aggregate for one window. Expired windows read as
    /// not-found even before a sweep removes them.
    pub async fn fetch(&self, base_key: &[u8], window: &Window) -> Result<Option<Bytes>> {
        if self.is_expired(window) {
            return Ok(None);
        }
        self.store.get(window_key(base_key, window)).await
    }

    /// Writes the aggregate for one window. Refuses windows past retention so
    /// an expired window cannot be silently resurrected.
    pub async fn update(
        &self,
        base_key: &[u8],
        window: &Window,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        if self.is_expired(window) {
            return Err(Error::Store(format!(
                "window ending {} is past retention",
                window.end_time
            )));
        }
        self.store.put(window_key(base_key, window), value).await
    }

    /// Walks the stored windows for a base key and deletes the expired ones.
    /// Each delete is a changelog-recorded tombstone. Returns how many
    /// entries were removed.
    pub async fn sweep(&self, base_key: &[u8]) -> Result<usize> {
        let prefix = base_key_prefix(base_key);
        let entries = self.store.prefix_scan(prefix).await?;
        let mut removed = 0;
        for (key, _) in entries {
            let Some((_, window)) = decode_window_key(&key) else {
                continue;
            };
            if self.is_expired(&window) {
                self.store.delete(key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn is_expired(&self, window: &Window) -> bool {
        let Some(stream_time) = *self.stream_time.lock() else {
            return false;
        };
        stream_time - window.end_time >= self.retention
    }
}

/// Composite window key: `[len(base) as u32 BE][base][start BE][end BE]`.
/// The length prefix keeps one base key's windows contiguous under a prefix
/// scan without ambiguity between base keys of different lengths.
pub(crate) fn window_key(base_key: &[u8], window: &Window) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + base_key.len() + 16);
    buf.put_u32(base_key.len() as u32);
    buf.put_slice(base_key);
    buf.put_i64(window.start_time.timestamp_millis());
    buf.put_i64(window.end_time.timestamp_millis());
    buf.freeze()
}

pub(crate) fn base_key_prefix(base_key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + base_key.len());
    buf.put_u32(base_key.len() as u32);
    buf.put_slice(base_key);
    buf.freeze()
}

pub(crate) fn decode_window_key(key: &[u8]) -> Option<(Bytes, Window)> {
    if key.len() < 20 {
        return None;
    }
    let base_len = u32::from_be_bytes(key[0..4].try_into().ok()?) as usize;
    if key.len() != 4 + base_len + 16 {
        return None;
    }
    let base = Bytes::copy_from_slice(&key[4..4 + base_len]);
    let start = i64::from_be_bytes(key[4 + base_len..12 + base_len].try_into().ok()?);
    let end = i64::from_be_bytes(key[12 + base_len..20 + base_len].try_into().ok()?);
    Some((base, Window::from_millis(start, end)))
}
