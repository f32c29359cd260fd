//! Tracker ties record completion back to source offset commits. Records are
//! inserted in read order per partition; as their [crate::message::DoneHandle]s
//! drop, the tracker marks them complete, and `committable` hands the runtime
//! the highest offset per partition up to which every record finished
//! successfully. A failed record blocks commits for its partition past its
//! offset, so at-least-once redelivery stays intact.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::message::{Completion, DoneHandle, Record};
use crate::{Error, Result};

const TRACKER_CHANNEL_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Done,
    Failed,
}

enum ActorMessage {
    Insert {
        partition: u16,
        offset: i64,
    },
    Committable {
        respond_to: oneshot::Sender<Vec<(u16, i64)>>,
    },
    #[cfg(test)]
    IsEmpty {
        respond_to: oneshot::Sender<bool>,
    },
}

struct Tracker {
    /// Per partition, in-flight offsets in read order.
    partitions: HashMap<u16, VecDeque<(i64, EntryState)>>,
    receiver: mpsc::Receiver<ActorMessage>,
    completions: mpsc::UnboundedReceiver<Completion>,
}

impl Tracker {
    fn new(
        receiver: mpsc::Receiver<ActorMessage>,
        completions: mpsc::UnboundedReceiver<Completion>,
    ) -> Self {
        Self {
            partitions: HashMap::new(),
            receiver,
            completions,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                // Completions first so a committable query sees everything
                // already reported.
                biased;
                Some(completion) = self.completions.recv() => {
                    self.handle_completion(completion);
                }
                maybe_msg = self.receiver.recv() => {
                    let Some(msg) = maybe_msg else {
                        break;
                    };
                    self.handle_message(msg);
                }
            }
        }
    }

    fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Insert { partition, offset } => {
                self.partitions
                    .entry(partition)
                    .or_default()
                    .push_back((offset, EntryState::Pending));
            }
            ActorMessage::Committable { respond_to } => {
                let _ = respond_to.send(self.committable());
            }
            #[cfg(test)]
            ActorMessage::IsEmpty { respond_to } => {
                let _ = respond_to.send(self.partitions.values().all(|p| p.is_empty()));
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Some(entries) = self.partitions.get_mut(&completion.partition) else {
            return;
        };
        let state = if completion.failed {
            EntryState::Failed
        } else {
            EntryState::Done
        };
        if let Some(entry) = entries
            .iter_mut()
            .find(|(offset, _)| *offset == completion.offset)
        {
            entry.1 = state;
        }
    }

    /// Pops the contiguous completed prefix of each partition and returns the
    /// last completed offset. A failed entry stops the scan so its offset is
    /// never acknowledged.
    fn committable(&mut self) -> Vec<(u16, i64)> {
        let mut result = Vec::new();
        for (partition, entries) in self.partitions.iter_mut() {
            let mut last = None;
            while let Some((offset, state)) = entries.front() {
                match state {
                    EntryState::Done => {
                        last = Some(*offset);
                        entries.pop_front();
                    }
                    EntryState::Failed => {
                        warn!(
                            partition = *partition,
                            offset = *offset,
                            "Record failed, holding back offset commits"
                        );
                        break;
                    }
                    EntryState::Pending => break,
                }
            }
            if let Some(offset) = last {
                result.push((*partition, offset));
            }
        }
        result
    }
}

/// Handle to the tracker actor.
#[derive(Clone)]
pub(crate) struct TrackerHandle {
    sender: mpsc::Sender<ActorMessage>,
    completion_tx: mpsc::UnboundedSender<Completion>,
}

impl TrackerHandle {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = mpsc::channel(TRACKER_CHANNEL_SIZE);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let tracker = Tracker::new(receiver, completion_rx);
        tokio::spawn(tracker.run());
        Self {
            sender,
            completion_tx,
        }
    }

    /// Registers the record and attaches its completion handle.
    pub(crate) async fn track(&self, record: &mut Record) -> Result<()> {
        self.sender
            .send(ActorMessage::Insert {
                partition: record.partition,
                offset: record.offset,
            })
            .await
            .map_err(|_| Error::ActorPatternRecv("tracker is gone".to_string()))?;
        record.done = Some(Arc::new(DoneHandle::new(
            self.completion_tx.clone(),
            record.partition,
            record.offset,
        )));
        Ok(())
    }

    /// Highest fully-processed offset per partition since the last call.
    pub(crate) async fn committable(&self) -> Result<Vec<(u16, i64)>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Committable { respond_to: tx })
            .await
            .map_err(|_| Error::ActorPatternRecv("tracker is gone".to_string()))?;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }

    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(ActorMessage::IsEmpty { respond_to: tx })
            .await;
        rx.await.unwrap_or(true)
    }
}
