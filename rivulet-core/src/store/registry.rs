//! Store registry. Owns the mapping of store name to changelog partition and
//! hands out [StoreHandle]s; the runtime recovers every registered store
//! before the worker pool accepts traffic.

use std::sync::Arc;

use tracing::{error, info};

use crate::changelog::ChangelogLog;
use crate::changelog::buffer::BufferedAppender;
use crate::config::ChangelogConfig;
use crate::store::point::{self, Durability};
use crate::store::StoreHandle;
use crate::{Error, Result};

pub struct StoreRegistry<C> {
    log: C,
    config: ChangelogConfig,
    stores: Vec<StoreHandle>,
    next_partition: u16,
}

impl<C: ChangelogLog> StoreRegistry<C> {
    pub fn new(log: C, config: ChangelogConfig) -> Self {
        Self {
            log,
            config,
            stores: Vec::new(),
            next_partition: 0,
        }
    }

    /// Creates a store backed by the next changelog partition. Store names
    /// must be unique within a registry.
    pub fn create(&mut self, name: &str) -> Result<StoreHandle> {
        if self.stores.iter().any(|s| s.name() == name) {
            return Err(Error::Store(format!("store {name} already registered")));
        }
        let partition = self.next_partition;
        self.next_partition += 1;

        let durability = if !self.config.enabled {
            Durability::Disabled
        } else if let Some(buffer) = &self.config.buffer {
            let (appender, _join) = BufferedAppender::spawn(self.log.clone(), buffer);
            Durability::Buffered {
                log: self.log.clone(),
                appender,
            }
        } else {
            Durability::Synchronous(self.log.clone())
        };

        let handle = point::spawn(Arc::from(name), partition, durability);
        info!(store = name, partition, durable = handle.is_durable(), "Registered store");
        self.stores.push(handle.clone());
        Ok(handle)
    }

    pub fn lookup(&self, name: &str) -> Option<StoreHandle> {
        self.stores.iter().find(|s| s.name() == name).cloned()
    }

    pub fn handles(&self) -> Vec<StoreHandle> {
        self.stores.clone()
    }

    /// Replays every registered store from its changelog partition. A failure
    /// is fatal to startup and reported once.
    pub async fn recover_all(&self) -> Result<()> {
        for store in &self.stores {
            if let Err(e) = store.recover().await {
                error!(store = store.name(), %e, "Store recovery failed");
                return Err(e);
            }
        }
        Ok(())
    }
}
