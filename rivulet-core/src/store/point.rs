//! Point store actor. One task owns the map; the handle in [crate::store] is
//! the only way in.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::changelog::ChangelogLog;
use crate::changelog::buffer::BufferedAppender;
use crate::store::{ActorMessage, StoreEntry, StoreHandle, StoreState};
use crate::{Error, Result};

const STORE_CHANNEL_SIZE: usize = 64;

/// How mutations reach the changelog.
pub(crate) enum Durability<C> {
    /// No changelog. The store offers no crash-recovery guarantee.
    Disabled,
    /// Append acknowledged before the map is touched.
    Synchronous(C),
    /// Appends handed to the buffered writer; the map is updated immediately
    /// and durability lags by at most one flush window.
    Buffered { log: C, appender: BufferedAppender },
}

struct PointStoreActor<C> {
    name: Arc<str>,
    partition: u16,
    durability: Durability<C>,
    map: BTreeMap<Bytes, StoreEntry>,
    state: StoreState,
    /// Highest changelog offset applied to the map, -1 before any.
    last_applied: i64,
    receiver: mpsc::Receiver<ActorMessage>,
}

pub(crate) fn spawn<C: ChangelogLog>(
    name: Arc<str>,
    partition: u16,
    durability: Durability<C>,
) -> StoreHandle {
    let durable = !matches!(durability, Durability::Disabled);
    if !durable {
        warn!(store = %name, "Changelog disabled, store offers no crash-recovery guarantee");
    }
    let (sender, receiver) = mpsc::channel(STORE_CHANNEL_SIZE);
    let actor = PointStoreActor {
        name: Arc::clone(&name),
        partition,
        durability,
        map: BTreeMap::new(),
        state: StoreState::Uninitialized,
        last_applied: -1,
        receiver,
    };
    tokio::spawn(actor.run());
    StoreHandle::new(name, sender, durable)
}

impl<C: ChangelogLog> PointStoreActor<C> {
    async fn run(mut self) {
        while let Some(msg) = self.receiver.recv().await {
            self.handle_message(msg).await;
        }
    }

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Get { key, respond_to } => {
                let _ = respond_to.send(self.get(&key));
            }
            ActorMessage::Put {
                key,
                value,
                respond_to,
            } => {
                let _ = respond_to.send(self.put(key, value).await);
            }
            ActorMessage::Delete { key, respond_to } => {
                let _ = respond_to.send(self.delete(key).await);
            }
            ActorMessage::PrefixScan { prefix, respond_to } => {
                let _ = respond_to.send(self.prefix_scan(&prefix));
            }
            ActorMessage::Recover { respond_to } => {
                let _ = respond_to.send(self.recover().await);
            }
            ActorMessage::State { respond_to } => {
                let _ = respond_to.send(self.state);
            }
            ActorMessage::Entry { key, respond_to } => {
                let result = self
                    .ensure_ready()
                    .map(|()| self.map.get(&key).cloned());
                let _ = respond_to.send(result);
            }
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state != StoreState::Ready {
            return Err(Error::Store(format!(
                "store {} is not ready (state {:?})",
                self.name, self.state
            )));
        }
        Ok(())
    }

    fn get(&self, key: &Bytes) -> Result<Option<Bytes>> {
        self.ensure_ready()?;
        Ok(self.map.get(key).map(|entry| entry.value.clone()))
    }

    async fn put(&mut self, key: Bytes, value: Bytes) -> Result<()> {
        self.ensure_ready()?;
        let changelog_offset = match &self.durability {
            Durability::Disabled => None,
            Durability::Synchronous(log) => {
                let offset = log
                    .append(self.partition, key.clone(), Some(value.clone()))
                    .await?;
                self.last_applied = offset;
                Some(offset)
            }
            Durability::Buffered { appender, .. } => {
                appender
                    .enqueue(self.partition, key.clone(), Some(value.clone()))
                    .await?;
                None
            }
        };
        self.map.insert(
            key,
            StoreEntry {
                value,
                changelog_offset,
            },
        );
        Ok(())
    }

    async fn delete(&mut self, key: Bytes) -> Result<()> {
        self.ensure_ready()?;
        match &self.durability {
            Durability::Disabled => {}
            Durability::Synchronous(log) => {
                let offset = log.append(self.partition, key.clone(), None).await?;
                self.last_applied = offset;
            }
            Durability::Buffered { appender, .. } => {
                appender.enqueue(self.partition, key.clone(), None).await?;
            }
        }
        self.map.remove(&key);
        Ok(())
    }

    fn prefix_scan(&self, prefix: &Bytes) -> Result<Vec<(Bytes, Bytes)>> {
        self.ensure_ready()?;
        Ok(self
            .map
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn recover(&mut self) -> Result<()> {
        let log = match &self.durability {
            Durability::Disabled => {
                debug!(store = %self.name, "Changelog disabled, nothing to replay");
                self.state = StoreState::Ready;
                return Ok(());
            }
            Durability::Synchronous(log) => log.clone(),
            Durability::Buffered { log, .. } => log.clone(),
        };

        self.state = StoreState::Replaying;
        let from = self.last_applied + 1;
        let records = match log.read_from(self.partition, from).await {
            Ok(records) => records,
            Err(e) => {
                // An interrupted replay restarts from the last applied
                // offset, never from an unknown midpoint.
                self.state = StoreState::Uninitialized;
                return Err(Error::Recovery(format!(
                    "store {} failed to read changelog partition {} from offset {}: {}",
                    self.name, self.partition, from, e
                )));
            }
        };

        let applied = records.len();
        for record in records {
            match record.value {
                Some(value) => {
                    self.map.insert(
                        record.key,
                        StoreEntry {
                            value,
                            changelog_offset: Some(record.offset),
                        },
                    );
                }
                None => {
                    self.map.remove(&record.key);
                }
            }
            self.last_applied = record.offset;
        }

        self.state = StoreState::Ready;
        info!(
            store = %self.name,
            partition = self.partition,
            applied,
            last_applied = self.last_applied,
            "Store recovered from changelog"
        );
        Ok(())
    }
}
