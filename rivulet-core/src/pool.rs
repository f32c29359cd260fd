//! Ordered dispatcher and worker pool. Every record is assigned to exactly
//! one of N workers by a stable hash of its dispatch key, so records sharing a
//! key are processed strictly in submission order by a single worker, while
//! different keys run in parallel. Inboxes are bounded; a full inbox suspends
//! `submit`, which is the backpressure that pauses the source poll loop.

use std::panic::AssertUnwindSafe;

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{OrderingStrategy, WorkerPoolConfig};
use crate::message::{DispatchKeyFn, Record, worker_index};
use crate::topology::Topology;
use crate::{Error, Result};

const ERROR_CHANNEL_SIZE: usize = 16;

/// Lifecycle of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Processing,
    Draining,
    Stopped,
}

struct Worker {
    id: usize,
    inbox: mpsc::Receiver<Record>,
    topology: Topology,
    sink: mpsc::Sender<Record>,
    state_tx: watch::Sender<WorkerState>,
    error_tx: mpsc::Sender<Error>,
    drain_rx: watch::Receiver<bool>,
    hard_stop: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        let mut draining = false;
        loop {
            tokio::select! {
                _ = self.hard_stop.cancelled() => {
                    // Abandoned records are possibly-not-committed; make sure
                    // their offsets are never acknowledged.
                    warn!(worker = self.id, "Hard stop, abandoning queued records");
                    self.discard_inbox();
                    break;
                }
                _ = self.drain_rx.changed(), if !draining => {
                    draining = true;
                    self.state_tx.send_replace(WorkerState::Draining);
                }
                maybe_record = self.inbox.recv() => {
                    let Some(record) = maybe_record else {
                        break;
                    };
                    if !draining {
                        self.state_tx.send_replace(WorkerState::Processing);
                    }
                    if !self.process(record).await {
                        return;
                    }
                    if !draining {
                        self.state_tx.send_replace(WorkerState::Idle);
                    }
                }
            }
        }
        self.state_tx.send_replace(WorkerState::Stopped);
    }

    /// Runs one record through the topology. Returns false when the worker
    /// must stop because of a fatal error.
    async fn process(&mut self, record: Record) -> bool {
        let result = AssertUnwindSafe(self.topology.process(record.clone(), &self.sink))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(Error::WorkerFatal(format!(
                    "worker {} panicked while processing {}",
                    self.id, record
                )))
            });

        let Err(e) = result else {
            return true;
        };

        record.mark_failed();
        let fatal = Error::WorkerFatal(format!("worker {}: {}", self.id, e));
        error!(worker = self.id, record = %record, %e, "Worker stopping on fatal error");
        // Restarting here would reorder or drop the pending queue, so the
        // worker stays down until the owner rebuilds the pool.
        self.discard_inbox();
        self.state_tx.send_replace(WorkerState::Stopped);
        let _ = self.error_tx.send(fatal).await;
        false
    }

    /// Closes the inbox and marks everything still queued as failed so those
    /// offsets are never committed.
    fn discard_inbox(&mut self) {
        self.inbox.close();
        while let Ok(record) = self.inbox.try_recv() {
            record.mark_failed();
        }
    }
}

/// Fixed pool of workers with per-dispatch-key ordering.
pub struct WorkerPool {
    inboxes: Vec<mpsc::Sender<Record>>,
    states: Vec<watch::Receiver<WorkerState>>,
    handles: Vec<JoinHandle<()>>,
    drain_tx: watch::Sender<bool>,
    hard_stop: CancellationToken,
    order: OrderingStrategy,
    key_extractor: Option<DispatchKeyFn>,
}

impl WorkerPool {
    /// Builds the pool and spawns its workers. The factory is invoked once
    /// per worker so each worker owns its own topology instance. Returns the
    /// pool and the channel on which worker-fatal errors surface.
    pub fn new(
        config: &WorkerPoolConfig,
        topology_factory: impl Fn() -> Result<Topology>,
        sink: mpsc::Sender<Record>,
        key_extractor: Option<DispatchKeyFn>,
    ) -> Result<(Self, mpsc::Receiver<Error>)> {
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_SIZE);
        let (drain_tx, drain_rx) = watch::channel(false);
        let hard_stop = CancellationToken::new();

        let mut inboxes = Vec::with_capacity(config.workers);
        let mut states = Vec::with_capacity(config.workers);
        let mut handles = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity);
            let (state_tx, state_rx) = watch::channel(WorkerState::Idle);
            let worker = Worker {
                id,
                inbox: inbox_rx,
                topology: topology_factory()?,
                sink: sink.clone(),
                state_tx,
                error_tx: error_tx.clone(),
                drain_rx: drain_rx.clone(),
                hard_stop: hard_stop.clone(),
            };
            inboxes.push(inbox_tx);
            states.push(state_rx);
            handles.push(tokio::spawn(worker.run()));
        }
        info!(
            workers = config.workers,
            inbox_capacity = config.inbox_capacity,
            order = ?config.order,
            "Worker pool started"
        );

        Ok((
            Self {
                inboxes,
                states,
                handles,
                drain_tx,
                hard_stop,
                order: config.order,
                key_extractor,
            },
            error_rx,
        ))
    }

    pub fn workers(&self) -> usize {
        self.inboxes.len()
    }

    pub fn worker_state(&self, worker: usize) -> WorkerState {
        *self.states[worker].borrow()
    }

    /// Dispatch key for a record under the configured ordering strategy.
    fn dispatch_key(&self, record: &Record) -> Bytes {
        match self.order {
            OrderingStrategy::ByPartition => {
                Bytes::copy_from_slice(&record.partition.to_be_bytes())
            }
            OrderingStrategy::ByKey => match &self.key_extractor {
                Some(extractor) => extractor(record),
                None => record.key.clone(),
            },
        }
    }

    pub(crate) fn worker_for(&self, record: &Record) -> usize {
        worker_index(&self.dispatch_key(record), self.inboxes.len())
    }

    /// Hands the record to its worker. Returns immediately while the target
    /// inbox has capacity, otherwise suspends until space frees up. Fails
    /// with [Error::ClosedPool] when the pool is stopped or the target worker
    /// has died.
    pub async fn submit(&self, record: Record) -> Result<()> {
        let worker = self.worker_for(&record);
        self.inboxes[worker].send(record).await.map_err(|e| {
            e.0.mark_failed();
            Error::ClosedPool(format!("worker {worker} is not accepting records"))
        })
    }

    /// Drain-stop: workers finish everything already queued, then halt.
    pub async fn stop(self) -> Result<()> {
        let _ = self.drain_tx.send(true);
        drop(self.inboxes);
        for (id, handle) in self.handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(worker = id, %e, "Worker task join failed");
            }
        }
        info!("Worker pool drained and stopped");
        Ok(())
    }

    /// Hard stop for shutdown timeouts: queued records are abandoned and must
    /// be treated as possibly-not-committed downstream.
    pub async fn hard_stop(self) -> Result<()> {
        self.hard_stop.cancel();
        drop(self.inboxes);
        for (id, handle) in self.handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(worker = id, %e, "Worker task join failed");
            }
        }
        info!("Worker pool hard-stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use parking_lot::Mutex;

    use super::*;
    use crate::topology::{NodeKind, TopologyBuilder};

    fn pool_config(workers: usize, inbox_capacity: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers,
            inbox_capacity,
            order: OrderingStrategy::ByKey,
        }
    }

    fn record(key: &str, offset: i64) -> Record {
        Record::new(0, offset, key.to_string(), format!("v{offset}"), Utc::now())
    }

    /// Finds distinct keys that map to distinct workers.
    fn keys_on_distinct_workers(workers: usize, count: usize) -> Vec<String> {
        let mut found: Vec<(usize, String)> = Vec::new();
        for i in 0.. {
            let key = format!("key-{i}");
            let idx = worker_index(key.as_bytes(), workers);
            if !found.iter().any(|(w, _)| *w == idx) {
                found.push((idx, key));
                if found.len() == count {
                    break;
                }
            }
        }
        found.into_iter().map(|(_, k)| k).collect()
    }

    fn passthrough_factory() -> impl Fn() -> Result<Topology> {
        || {
            TopologyBuilder::new()
                .add_source(
                    "pass",
                    NodeKind::Map(Box::new(|record: &Record| Ok(vec![record.clone()]))),
                )
                .build()
        }
    }

    #[tokio::test]
    async fn test_per_key_fifo_order() {
        let (sink_tx, mut sink_rx) = mpsc::channel(2048);
        let (pool, _errors) =
            WorkerPool::new(&pool_config(8, 16), passthrough_factory(), sink_tx, None).unwrap();

        let keys = ["a", "b", "c", "d"];
        for offset in 0..100 {
            for key in keys {
                pool.submit(record(key, offset)).await.unwrap();
            }
        }
        pool.stop().await.unwrap();

        let mut per_key: HashMap<Bytes, Vec<i64>> = HashMap::new();
        while let Some(out) = sink_rx.recv().await {
            per_key.entry(out.key.clone()).or_default().push(out.offset);
        }
        assert_eq!(per_key.len(), 4);
        for (_, offsets) in per_key {
            assert_eq!(offsets, (0..100).collect::<Vec<_>>());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_never_concurrent() {
        let (sink_tx, mut sink_rx) = mpsc::channel(4096);
        let active: Arc<Mutex<HashMap<Bytes, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let factory = {
            let active = Arc::clone(&active);
            let overlaps = Arc::clone(&overlaps);
            move || {
                let active = Arc::clone(&active);
                let overlaps = Arc::clone(&overlaps);
                TopologyBuilder::new()
                    .add_source(
                        "probe",
                        NodeKind::Map(Box::new(move |record: &Record| {
                            {
                                let mut active = active.lock();
                                let count = active.entry(record.key.clone()).or_insert(0);
                                *count += 1;
                                if *count > 1 {
                                    overlaps.fetch_add(1, Ordering::SeqCst);
                                }
                            }
                            std::thread::sleep(Duration::from_micros(200));
                            *active.lock().get_mut(&record.key).unwrap() -= 1;
                            Ok(vec![record.clone()])
                        })),
                    )
                    .build()
            }
        };

        let (pool, _errors) = WorkerPool::new(&pool_config(8, 8), factory, sink_tx, None).unwrap();
        for offset in 0..200 {
            for key in ["k1", "k2", "k3", "k4"] {
                pool.submit(record(key, offset)).await.unwrap();
            }
        }
        pool.stop().await.unwrap();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        let mut total = 0;
        while sink_rx.recv().await.is_some() {
            total += 1;
        }
        assert_eq!(total, 800);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_backpressure_blocks_only_the_full_worker() {
        let keys = keys_on_distinct_workers(4, 2);
        let stall = Arc::new(std::sync::Barrier::new(2));
        let stalled_once = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let factory = {
            let stall = Arc::clone(&stall);
            let stalled_once = Arc::clone(&stalled_once);
            let stalled_key = Bytes::from(keys[0].clone());
            move || {
                let stall = Arc::clone(&stall);
                let stalled_once = Arc::clone(&stalled_once);
                let stalled_key = stalled_key.clone();
                TopologyBuilder::new()
                    .add_source(
                        "stall",
                        NodeKind::Map(Box::new(move |record: &Record| {
                            // Only the first record stalls; the barrier is
                            // reusable and must not trip again on the queued
                            // records.
                            if record.key == stalled_key
                                && !stalled_once.swap(true, Ordering::SeqCst)
                            {
                                stall.wait();
                            }
                            Ok(vec![record.clone()])
                        })),
                    )
                    .build()
            }
        };

        let (sink_tx, mut sink_rx) = mpsc::channel(64);
        let (pool, _errors) = WorkerPool::new(&pool_config(4, 1), factory, sink_tx, None).unwrap();
        let pool = Arc::new(pool);

        // First record is dequeued and stalls the worker; the second fills
        // the inbox.
        pool.submit(record(&keys[0], 0)).await.unwrap();
        pool.submit(record(&keys[0], 1)).await.unwrap();

        // A third submit to the same worker must block.
        let blocked = {
            let pool = Arc::clone(&pool);
            let key = keys[0].clone();
            tokio::spawn(async move { pool.submit(record(&key, 2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // A submit to a different worker's key does not block.
        tokio::time::timeout(Duration::from_millis(100), pool.submit(record(&keys[1], 0)))
            .await
            .expect("submit to an idle worker must not block")
            .unwrap();

        // Release the stall; the blocked submit completes.
        stall.wait();
        blocked.await.unwrap().unwrap();

        let pool = Arc::into_inner(pool).expect("pool still shared");
        pool.stop().await.unwrap();
        let mut count = 0;
        while sink_rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_worker_not_siblings() {
        let keys = keys_on_distinct_workers(4, 2);
        let poison = Bytes::from(keys[0].clone());

        let factory = {
            let poison = poison.clone();
            move || {
                let poison = poison.clone();
                TopologyBuilder::new()
                    .add_source(
                        "explode",
                        NodeKind::Map(Box::new(move |record: &Record| {
                            if record.key == poison {
                                Err(Error::Topology("bad record".to_string()))
                            } else {
                                Ok(vec![record.clone()])
                            }
                        })),
                    )
                    .build()
            }
        };

        let (sink_tx, mut sink_rx) = mpsc::channel(64);
        let (pool, mut errors) =
            WorkerPool::new(&pool_config(4, 4), factory, sink_tx, None).unwrap();

        let poisoned_worker = pool.worker_for(&record(&keys[0], 0));
        pool.submit(record(&keys[0], 0)).await.unwrap();
        let fatal = errors.recv().await.unwrap();
        assert!(matches!(fatal, Error::WorkerFatal(_)));
        assert_eq!(pool.worker_state(poisoned_worker), WorkerState::Stopped);

        // The sibling worker keeps processing.
        pool.submit(record(&keys[1], 0)).await.unwrap();
        let out = sink_rx.recv().await.unwrap();
        assert_eq!(out.key, Bytes::from(keys[1].clone()));

        // The dead worker rejects new submissions instead of queueing them.
        assert!(matches!(
            pool.submit(record(&keys[0], 1)).await,
            Err(Error::ClosedPool(_))
        ));
        pool.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panic_surfaces_as_worker_fatal() {
        let (sink_tx, _sink_rx) = mpsc::channel(64);
        let factory = || {
            TopologyBuilder::new()
                .add_source(
                    "panic",
                    NodeKind::Map(Box::new(|_: &Record| panic!("boom"))),
                )
                .build()
        };
        let (pool, mut errors) = WorkerPool::new(&pool_config(1, 4), factory, sink_tx, None).unwrap();
        pool.submit(record("k", 0)).await.unwrap();
        assert!(matches!(
            errors.recv().await.unwrap(),
            Error::WorkerFatal(_)
        ));
    }

    #[tokio::test]
    async fn test_graceful_stop_drains_queued_records() {
        let (sink_tx, mut sink_rx) = mpsc::channel(256);
        let (pool, _errors) =
            WorkerPool::new(&pool_config(2, 64), passthrough_factory(), sink_tx, None).unwrap();
        for offset in 0..50 {
            pool.submit(record("k", offset)).await.unwrap();
        }
        pool.stop().await.unwrap();
        let mut count = 0;
        while sink_rx.recv().await.is_some() {
            count += 1;
        }
        // Drain, not abort: everything queued was processed.
        assert_eq!(count, 50);
    }

    #[tokio::test]
    async fn test_by_partition_ordering_groups_by_partition() {
        let (sink_tx, mut sink_rx) = mpsc::channel(256);
        let config = WorkerPoolConfig {
            workers: 4,
            inbox_capacity: 16,
            order: OrderingStrategy::ByPartition,
        };
        let (pool, _errors) =
            WorkerPool::new(&config, passthrough_factory(), sink_tx, None).unwrap();

        // Different keys on the same partition must stay in order.
        for offset in 0..20 {
            let mut r = record(&format!("k{offset}"), offset);
            r.partition = 3;
            pool.submit(r).await.unwrap();
        }
        pool.stop().await.unwrap();

        let mut offsets = Vec::new();
        while let Some(out) = sink_rx.recv().await {
            offsets.push(out.offset);
        }
        assert_eq!(offsets, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_custom_key_extractor() {
        let (sink_tx, mut sink_rx) = mpsc::channel(256);
        // Extract the account id prefix so "acct-1:credit" and
        // "acct-1:debit" serialize on one worker.
        let extractor: DispatchKeyFn = Arc::new(|record: &Record| {
            let key = record.key.clone();
            match key.iter().position(|b| *b == b':') {
                Some(pos) => key.slice(..pos),
                None => key,
            }
        });
        let (pool, _errors) = WorkerPool::new(
            &pool_config(8, 16),
            passthrough_factory(),
            sink_tx,
            Some(extractor),
        )
        .unwrap();

        for offset in 0..20 {
            let kind = if offset % 2 == 0 { "credit" } else { "debit" };
            pool.submit(record(&format!("acct-1:{kind}"), offset))
                .await
                .unwrap();
        }
        pool.stop().await.unwrap();

        let mut offsets = Vec::new();
        while let Some(out) = sink_rx.recv().await {
            offsets.push(out.offset);
        }
        assert_eq!(offsets, (0..20).collect::<Vec<_>>());
    }
}
