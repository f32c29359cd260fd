//! Channel-backed source. Records fed into the sender side come out of
//! `poll` in order; committed offsets are observable for assertions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::message::Record;
use crate::source::RecordSource;
use crate::Result;

const MAX_POLL_RECORDS: usize = 64;

pub struct ChannelSource {
    receiver: mpsc::Receiver<Record>,
    committed: Arc<Mutex<HashMap<u16, i64>>>,
}

impl ChannelSource {
    /// Returns the source and the sender used to feed it.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<Record>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                receiver,
                committed: Arc::new(Mutex::new(HashMap::new())),
            },
            sender,
        )
    }

    /// Latest committed offset per partition.
    pub fn committed_offsets(&self) -> Arc<Mutex<HashMap<u16, i64>>> {
        Arc::clone(&self.committed)
    }
}

impl RecordSource for ChannelSource {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                maybe_record = self.receiver.recv() => {
                    let Some(record) = maybe_record else {
                        // Feed is gone; honor the timeout so callers are not
                        // spun in a hot poll loop.
                        deadline.as_mut().await;
                        break;
                    };
                    records.push(record);
                    if records.len() >= MAX_POLL_RECORDS {
                        break;
                    }
                }
            }
        }
        Ok(records)
    }

    async fn commit(&mut self, partition: u16, offset: i64) -> Result<()> {
        self.committed.lock().insert(partition, offset);
        Ok(())
    }
}
