//! Buffered changelog writer. Stores running with buffered durability hand
//! their appends to this actor instead of awaiting the log directly; the actor
//! batches them and flushes when the batch reaches the configured size, when
//! the flush interval elapses, and on shutdown. Local store reads see a
//! buffered mutation immediately while its durability lags by at most one
//! flush window.

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use crate::changelog::ChangelogLog;
use crate::config::ChangelogBufferConfig;
use crate::{Error, Result};

pub(crate) enum BufferMessage {
    Append {
        partition: u16,
        key: Bytes,
        value: Option<Bytes>,
    },
    /// Flushes everything pending and reports the result. Used as a barrier
    /// in tests and on store shutdown.
    Flush {
        respond_to: oneshot::Sender<Result<()>>,
    },
}

struct BufferedWriterActor<C> {
    log: C,
    flush_size: usize,
    pending: Vec<(u16, Bytes, Option<Bytes>)>,
    in_rx: ReceiverStream<BufferMessage>,
}

impl<C: ChangelogLog> BufferedWriterActor<C> {
    fn new(log: C, flush_size: usize, in_rx: ReceiverStream<BufferMessage>) -> Self {
        Self {
            log,
            flush_size,
            pending: Vec::with_capacity(flush_size),
            in_rx,
        }
    }

    async fn run(mut self, flush_interval: std::time::Duration) -> Result<()> {
        let mut flush_timer = interval(flush_interval);
        // The first tick completes immediately.
        flush_timer.tick().await;
        loop {
            tokio::select! {
                maybe_msg = self.in_rx.next() => {
                    let Some(msg) = maybe_msg else {
                        break;
                    };
                    self.handle_message(msg).await?;
                }
                _ = flush_timer.tick() => {
                    self.flush().await?;
                }
            }
        }
        self.flush().await
    }

    async fn handle_message(&mut self, msg: BufferMessage) -> Result<()> {
        match msg {
            BufferMessage::Append {
                partition,
                key,
                value,
            } => {
                self.pending.push((partition, key, value));
                if self.pending.len() >= self.flush_size {
                    self.flush().await?;
                }
            }
            BufferMessage::Flush { respond_to } => {
                let result = self.flush().await;
                let _ = respond_to.send(result.clone());
                result?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        debug!(count = self.pending.len(), "Flushing buffered changelog appends");
        for (partition, key, value) in self.pending.drain(..) {
            self.log.append(partition, key, value).await?;
        }
        Ok(())
    }
}

/// Handle to the buffered writer. Cheap to clone; enqueue suspends when the
/// buffer channel is full, so log backpressure propagates into `put`/`delete`
/// callers.
#[derive(Clone)]
pub(crate) struct BufferedAppender {
    sender: mpsc::Sender<BufferMessage>,
}

impl BufferedAppender {
    /// Spawns the writer actor and returns its handle plus the join handle
    /// carrying the actor's final result.
    pub(crate) fn spawn<C: ChangelogLog>(
        log: C,
        config: &ChangelogBufferConfig,
    ) -> (Self, JoinHandle<Result<()>>) {
        let (sender, receiver) = mpsc::channel(config.flush_size.max(1));
        let actor = BufferedWriterActor::new(log, config.flush_size, ReceiverStream::new(receiver));
        let flush_interval = config.flush_interval;
        let handle = tokio::spawn(async move {
            let result = actor.run(flush_interval).await;
            if let Err(e) = &result {
                error!(?e, "Buffered changelog writer failed");
            }
            result
        });
        (Self { sender }, handle)
    }

    pub(crate) async fn enqueue(
        &self,
        partition: u16,
        key: Bytes,
        value: Option<Bytes>,
    ) -> Result<()> {
        self.sender
            .send(BufferMessage::Append {
                partition,
                key,
                value,
            })
            .await
            .map_err(|_| Error::Changelog("changelog buffer is closed".to_string()))
    }

    pub(crate) async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BufferMessage::Flush { respond_to: tx })
            .await
            .map_err(|_| Error::Changelog("changelog buffer is closed".to_string()))?;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?
    }
}
