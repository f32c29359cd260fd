//! Stream runtime. Recovers every registered store, then drives the
//! poll → dispatch loop: records pulled from the source are tracked, handed
//! to the worker pool (suspending on backpressure), and their offsets are
//! committed back to the source once fully processed. Worker-fatal errors are
//! collected and surfaced to the owner; they do not take sibling workers
//! down.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::message::Record;
use crate::pool::WorkerPool;
use crate::source::SourceHandle;
use crate::store::StoreHandle;
use crate::tracker::TrackerHandle;
use crate::{Error, Result};

const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(10);

pub struct StreamRuntime {
    settings: Settings,
    source: SourceHandle,
    stores: Vec<StoreHandle>,
    pool: WorkerPool,
    pool_errors: mpsc::Receiver<Error>,
}

impl StreamRuntime {
    pub fn new(
        settings: Settings,
        source: SourceHandle,
        stores: Vec<StoreHandle>,
        pool: WorkerPool,
        pool_errors: mpsc::Receiver<Error>,
    ) -> Self {
        Self {
            settings,
            source,
            stores,
            pool,
            pool_errors,
        }
    }

    /// Recovers all stores and starts the poll loop. A recovery failure
    /// prevents the stream from starting and is reported once.
    pub async fn start(self) -> Result<RunningStream> {
        self.settings.validate()?;
        for store in &self.stores {
            if let Err(e) = store.recover().await {
                error!(store = store.name(), %e, "Store recovery failed, stream will not start");
                return Err(e);
            }
        }
        info!(stores = self.stores.len(), "Stores recovered, starting stream");

        let stop = CancellationToken::new();
        let hard_stop = CancellationToken::new();
        let tracker = TrackerHandle::new();
        let handle = tokio::spawn(run_loop(
            self.settings,
            self.source,
            self.pool,
            self.pool_errors,
            tracker,
            stop.clone(),
            hard_stop.clone(),
        ));
        Ok(RunningStream {
            stop,
            hard_stop,
            handle,
        })
    }
}

/// A started stream. Stopping consumes it; the returned result carries the
/// first worker-fatal error observed, if any.
pub struct RunningStream {
    stop: CancellationToken,
    hard_stop: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl RunningStream {
    /// Cooperative stop: the pool drains queued records, then offsets for
    /// everything processed are committed.
    pub async fn stop(self) -> Result<()> {
        self.stop.cancel();
        self.handle
            .await
            .map_err(|e| Error::WorkerFatal(e.to_string()))?
    }

    /// Hard stop for shutdown timeouts: in-flight records are abandoned and
    /// must be treated as possibly-not-committed downstream.
    pub async fn hard_stop(self) -> Result<()> {
        self.hard_stop.cancel();
        self.handle
            .await
            .map_err(|e| Error::WorkerFatal(e.to_string()))?
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    settings: Settings,
    source: SourceHandle,
    pool: WorkerPool,
    mut pool_errors: mpsc::Receiver<Error>,
    tracker: TrackerHandle,
    stop: CancellationToken,
    hard_stop: CancellationToken,
) -> Result<()> {
    let poll_timeout = settings.runtime.poll_timeout;
    let commit_interval = settings.runtime.commit_interval;
    let mut final_result: Result<()> = Ok(());
    let mut last_commit = Instant::now();

    // The poll timeout bounds every pass, so stop flags are observed at
    // least that often.
    'main: while !stop.is_cancelled() && !hard_stop.is_cancelled() {
        while let Ok(fatal) = pool_errors.try_recv() {
            error!(%fatal, "Worker reported fatal error");
            if final_result.is_ok() {
                final_result = Err(fatal);
            }
        }

        if last_commit.elapsed() >= commit_interval {
            commit_processed(&source, &tracker).await;
            last_commit = Instant::now();
        }

        let records = match poll_with_retry(&source, poll_timeout).await {
            Ok(records) => records,
            Err(e) => {
                error!(%e, "Source poll failed");
                if final_result.is_ok() {
                    final_result = Err(e);
                }
                break;
            }
        };

        for mut record in records {
            if let Err(e) = tracker.track(&mut record).await {
                error!(%e, "Tracker unavailable");
                final_result = Err(e);
                break 'main;
            }
            tokio::select! {
                result = pool.submit(record) => {
                    if let Err(e) = result {
                        // The target worker died; its records are held back
                        // from commits. The owner decides whether that is
                        // fleet-fatal.
                        warn!(%e, "Record submission rejected");
                    }
                }
                _ = hard_stop.cancelled() => break 'main,
            }
        }
    }

    if hard_stop.is_cancelled() {
        pool.hard_stop().await?;
        // Abandoned records are possibly-not-committed by design; skip the
        // final commit so nothing unprocessed is acknowledged.
    } else {
        pool.stop().await?;
        commit_processed(&source, &tracker).await;
    }
    while let Ok(fatal) = pool_errors.try_recv() {
        error!(%fatal, "Worker reported fatal error");
        if final_result.is_ok() {
            final_result = Err(fatal);
        }
    }
    info!(status = ?final_result, "Stream runtime stopped");
    final_result
}

async fn commit_processed(source: &SourceHandle, tracker: &TrackerHandle) {
    let committable = match tracker.committable().await {
        Ok(committable) => committable,
        Err(e) => {
            warn!(%e, "Could not query committable offsets");
            return;
        }
    };
    for (partition, offset) in committable {
        if let Err(e) = commit_with_retry(source, partition, offset).await {
            warn!(partition, offset, %e, "Offset commit failed");
        }
    }
}

async fn poll_with_retry(source: &SourceHandle, timeout: Duration) -> Result<Vec<Record>> {
    let mut delay = RETRY_BASE_DELAY;
    for attempt in 1..=RETRY_ATTEMPTS {
        match source.poll(timeout).await {
            Ok(records) => return Ok(records),
            Err(e) if attempt < RETRY_ATTEMPTS => {
                warn!(attempt, %e, "Source poll failed, retrying");
                sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("retry loop always returns")
}

async fn commit_with_retry(source: &SourceHandle, partition: u16, offset: i64) -> Result<()> {
    let mut delay = RETRY_BASE_DELAY;
    for attempt in 1..=RETRY_ATTEMPTS {
        match source.commit(partition, offset).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < RETRY_ATTEMPTS => {
                warn!(attempt, %e, "Offset commit failed, retrying");
                sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("retry loop always returns")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::Bytes;
    use chrono::Utc;
    use rand::SeedableRng;
    use rand::seq::SliceRandom;

    use super::*;
    use crate::config::{ChangelogConfig, WorkerPoolConfig};
    use crate::source::channel::ChannelSource;
    use crate::store::registry::StoreRegistry;
    use crate::topology::{NodeKind, TopologyBuilder};

    fn passthrough_factory() -> impl Fn() -> Result<crate::topology::Topology> {
        || {
            TopologyBuilder::new()
                .add_source(
                    "pass",
                    NodeKind::Map(Box::new(|record: &Record| Ok(vec![record.clone()]))),
                )
                .build()
        }
    }

    fn fast_settings(workers: usize) -> Settings {
        let mut settings = Settings::default();
        settings.worker_pool.workers = workers;
        settings.runtime.poll_timeout = Duration::from_millis(20);
        settings.runtime.commit_interval = Duration::from_millis(20);
        settings
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_end_to_end_per_key_order_and_no_drops() {
        let settings = fast_settings(8);
        let (source, feed) = ChannelSource::new(2048);
        let committed = source.committed_offsets();
        let source = SourceHandle::new(source);

        let (sink_tx, mut sink_rx) = mpsc::channel(2048);
        let (pool, pool_errors) = WorkerPool::new(
            &settings.worker_pool,
            passthrough_factory(),
            sink_tx,
            None,
        )
        .unwrap();

        let runtime = StreamRuntime::new(settings, source, Vec::new(), pool, pool_errors);
        let running = runtime.start().await.unwrap();

        // 1000 records over 4 keys in a random interleaving.
        let keys = ["alpha", "beta", "gamma", "delta"];
        let mut assignments: Vec<&str> = (0..1000).map(|i| keys[i % 4]).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        assignments.shuffle(&mut rng);
        for (offset, key) in assignments.iter().enumerate() {
            feed.send(Record::new(0, offset as i64, key.to_string(), "v", Utc::now()))
                .await
                .unwrap();
        }

        let mut outputs: Vec<Record> = Vec::new();
        while outputs.len() < 1000 {
            let record = tokio::time::timeout(Duration::from_secs(10), sink_rx.recv())
                .await
                .expect("timed out waiting for outputs")
                .expect("sink closed early");
            outputs.push(record);
        }
        running.stop().await.unwrap();

        // No drops.
        assert_eq!(outputs.len(), 1000);
        // Per-key submission order is preserved in the output sequence.
        let mut seen: HashMap<Bytes, i64> = HashMap::new();
        for record in &outputs {
            let last = seen.entry(record.key.clone()).or_insert(-1);
            assert!(
                record.offset > *last,
                "key {:?} observed offset {} after {}",
                record.key,
                record.offset,
                last
            );
            *last = record.offset;
        }
        // Graceful stop committed everything.
        assert_eq!(committed.lock().get(&0), Some(&999));
    }

    #[tokio::test]
    async fn test_recovery_failure_prevents_start() {
        #[derive(Clone)]
        struct UnreadableChangelog;

        impl crate::changelog::ChangelogLog for UnreadableChangelog {
            async fn append(&self, _: u16, _: Bytes, _: Option<Bytes>) -> Result<i64> {
                Ok(0)
            }

            async fn read_from(
                &self,
                _: u16,
                _: i64,
            ) -> Result<Vec<crate::changelog::ChangelogRecord>> {
                Err(Error::Changelog("broker unreachable".to_string()))
            }
        }

        let mut registry = StoreRegistry::new(UnreadableChangelog, ChangelogConfig::default());
        registry.create("accounts").unwrap();

        let (source, _feed) = ChannelSource::new(16);
        let (sink_tx, _sink_rx) = mpsc::channel(16);
        let (pool, pool_errors) = WorkerPool::new(
            &WorkerPoolConfig::default(),
            passthrough_factory(),
            sink_tx,
            None,
        )
        .unwrap();

        let runtime = StreamRuntime::new(
            Settings::default(),
            SourceHandle::new(source),
            registry.handles(),
            pool,
            pool_errors,
        );
        assert!(matches!(
            runtime.start().await,
            Err(Error::Recovery(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_fatal_error_surfaces_on_stop() {
        let settings = fast_settings(2);
        let (source, feed) = ChannelSource::new(16);
        let source = SourceHandle::new(source);

        let factory = || {
            TopologyBuilder::new()
                .add_source(
                    "explode",
                    NodeKind::Map(Box::new(|record: &Record| {
                        if record.value.as_ref() == b"poison" {
                            Err(Error::Topology("bad record".to_string()))
                        } else {
                            Ok(vec![record.clone()])
                        }
                    })),
                )
                .build()
        };
        let (sink_tx, _sink_rx) = mpsc::channel(64);
        let (pool, pool_errors) =
            WorkerPool::new(&settings.worker_pool, factory, sink_tx, None).unwrap();

        let runtime = StreamRuntime::new(settings, source, Vec::new(), pool, pool_errors);
        let running = runtime.start().await.unwrap();

        feed.send(Record::new(0, 0, "k", "poison", Utc::now()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(matches!(
            running.stop().await,
            Err(Error::WorkerFatal(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_record_offset_is_not_committed() {
        let settings = fast_settings(1);
        let (source, feed) = ChannelSource::new(64);
        let committed = source.committed_offsets();
        let source = SourceHandle::new(source);

        let factory = || {
            TopologyBuilder::new()
                .add_source(
                    "explode",
                    NodeKind::Map(Box::new(|record: &Record| {
                        if record.value.as_ref() == b"poison" {
                            Err(Error::Topology("bad record".to_string()))
                        } else {
                            Ok(vec![record.clone()])
                        }
                    })),
                )
                .build()
        };
        let (sink_tx, _sink_rx) = mpsc::channel(64);
        let (pool, pool_errors) =
            WorkerPool::new(&settings.worker_pool, factory, sink_tx, None).unwrap();

        let runtime = StreamRuntime::new(settings, source, Vec::new(), pool, pool_errors);
        let running = runtime.start().await.unwrap();

        feed.send(Record::new(0, 0, "k", "fine", Utc::now()))
            .await
            .unwrap();
        feed.send(Record::new(0, 1, "k", "poison", Utc::now()))
            .await
            .unwrap();
        feed.send(Record::new(0, 2, "k", "fine", Utc::now()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let _ = running.stop().await;
        // The failure at offset 1 fences commits: only offset 0 is
        // acknowledged, so 1 and 2 are redelivered after a restart.
        assert_eq!(committed.lock().get(&0), Some(&0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hard_stop_returns_without_draining() {
        let settings = fast_settings(1);
        let (source, feed) = ChannelSource::new(256);
        let committed = source.committed_offsets();
        let source = SourceHandle::new(source);

        let factory = || {
            TopologyBuilder::new()
                .add_source(
                    "slow",
                    NodeKind::Map(Box::new(|record: &Record| {
                        std::thread::sleep(Duration::from_millis(20));
                        Ok(vec![record.clone()])
                    })),
                )
                .build()
        };
        let (sink_tx, mut sink_rx) = mpsc::channel(256);
        let (pool, pool_errors) =
            WorkerPool::new(&settings.worker_pool, factory, sink_tx, None).unwrap();

        let runtime = StreamRuntime::new(settings, source, Vec::new(), pool, pool_errors);
        let running = runtime.start().await.unwrap();

        for offset in 0..100 {
            feed.send(Record::new(0, offset, "k", "v", Utc::now()))
                .await
                .unwrap();
        }
        // Let a few records through, then pull the plug.
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::time::timeout(Duration::from_secs(5), running.hard_stop())
            .await
            .expect("hard stop must not wait for the backlog")
            .unwrap();

        drop(feed);
        let mut count = 0;
        while sink_rx.recv().await.is_some() {
            count += 1;
        }
        assert!(count < 100, "hard stop should abandon queued records");
        // Nothing past the processed prefix was acknowledged.
        if let Some(offset) = committed.lock().get(&0) {
            assert!(*offset < 99);
        }
    }
}
