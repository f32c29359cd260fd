//! Changelog-backed state stores. A store owns its in-memory keyed map inside
//! an actor task; all access goes through the narrow [StoreHandle] API so
//! recovery, expiry sweeps, and normal processing cannot race. Mutation only
//! ever happens from the worker that owns the relevant dispatch key, which is
//! what makes the map safe without per-key locks.
//!
//! Durability protocol: `put`/`delete` first append a changelog record
//! (synchronously, or through the buffered writer) and only then touch the
//! map. Recovery replays the store's changelog partition in append order,
//! which reconstructs the map byte-for-byte.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::{Error, Result};

pub(crate) mod point;
pub mod registry;

/// Recovery state machine of a store. No application traffic is accepted
/// until the store reaches `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Uninitialized,
    Replaying,
    Ready,
}

/// An entry as held in the store map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub value: Bytes,
    /// Offset of the changelog append that produced this entry. `None` marks
    /// an entry whose durability append is still buffered (or a store running
    /// without a changelog).
    pub changelog_offset: Option<i64>,
}

pub(crate) enum ActorMessage {
    Get {
        key: Bytes,
        respond_to: oneshot::Sender<Result<Option<Bytes>>>,
    },
    Put {
        key: Bytes,
        value: Bytes,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Delete {
        key: Bytes,
        respond_to: oneshot::Sender<Result<()>>,
    },
    PrefixScan {
        prefix: Bytes,
        respond_to: oneshot::Sender<Result<Vec<(Bytes, Bytes)>>>,
    },
    Recover {
        respond_to: oneshot::Sender<Result<()>>,
    },
    State {
        respond_to: oneshot::Sender<StoreState>,
    },
    Entry {
        key: Bytes,
        respond_to: oneshot::Sender<Result<Option<StoreEntry>>>,
    },
}

/// Cheaply clonable handle to one store actor.
#[derive(Clone)]
pub struct StoreHandle {
    name: std::sync::Arc<str>,
    sender: mpsc::Sender<ActorMessage>,
    durable: bool,
}

impl StoreHandle {
    pub(crate) fn new(
        name: std::sync::Arc<str>,
        sender: mpsc::Sender<ActorMessage>,
        durable: bool,
    ) -> Self {
        Self {
            name,
            sender,
            durable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False when the store was built with the changelog disabled, in which
    /// case it offers no crash-recovery guarantee.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Get {
            key: key.into(),
            respond_to: tx,
        })
        .await;
        self.recv(rx).await?
    }

    pub async fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Put {
            key: key.into(),
            value: value.into(),
            respond_to: tx,
        })
        .await;
        self.recv(rx).await?
    }

    pub async fn delete(&self, key: impl Into<Bytes>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Delete {
            key: key.into(),
            respond_to: tx,
        })
        .await;
        self.recv(rx).await?
    }

    /// Returns all `(key, value)` pairs whose key starts with `prefix`, in
    /// key order.
    pub async fn prefix_scan(&self, prefix: impl Into<Bytes>) -> Result<Vec<(Bytes, Bytes)>> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::PrefixScan {
            prefix: prefix.into(),
            respond_to: tx,
        })
        .await;
        self.recv(rx).await?
    }

    /// Replays the store's changelog partition from its last applied offset
    /// to the log's current end. Idempotent.
    pub async fn recover(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Recover { respond_to: tx }).await;
        self.recv(rx).await?
    }

    pub async fn state(&self) -> Result<StoreState> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::State { respond_to: tx }).await;
        self.recv(rx).await
    }

    /// Entry-level view including the changelog offset. Operational
    /// introspection; not part of the processing surface.
    pub async fn entry(&self, key: impl Into<Bytes>) -> Result<Option<StoreEntry>> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorMessage::Entry {
            key: key.into(),
            respond_to: tx,
        })
        .await;
        self.recv(rx).await?
    }

    async fn send(&self, msg: ActorMessage) {
        // Ignore send errors. If send fails, so does the recv below. There's
        // no reason to check for the same failure twice.
        let _ = self.sender.send(msg).await;
    }

    async fn recv<T>(&self, rx: oneshot::Receiver<T>) -> Result<T> {
        rx.await
            .map_err(|e| Error::ActorPatternRecv(format!("store {}: {}", self.name, e)))
    }
}
