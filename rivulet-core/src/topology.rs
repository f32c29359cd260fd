//! Topology of processing nodes. A topology is a DAG of named nodes; the
//! worker that owns a record's dispatch key invokes the source node and
//! forwards emitted outputs to child nodes in declaration order, synchronously
//! within the worker's call stack. Records emitted by leaf nodes go to the
//! downstream sink. Store access is explicit via the handles a node was
//! constructed with.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::message::Record;
use crate::store::StoreHandle;
use crate::window::{WindowAssignment, WindowedStore};
use crate::{Error, Result};

/// Stateless transform: zero or more outputs per input.
pub type MapFn = Box<dyn FnMut(&Record) -> Result<Vec<Record>> + Send>;

/// Folds a record into the current aggregate for its key. Returning `None`
/// deletes the aggregate.
pub type AggregateFn = Box<dyn FnMut(Option<Bytes>, &Record) -> Result<Option<Bytes>> + Send>;

/// Joins a record against the table value for its key.
pub type JoinFn = Box<dyn FnMut(&Record, Option<Bytes>) -> Result<Vec<Record>> + Send>;

/// The capability set a node can be built from.
pub enum NodeKind {
    /// Stateless transform.
    Map(MapFn),
    /// Keyed aggregate over a point store. Emits the updated aggregate.
    Aggregate {
        store: StoreHandle,
        aggregate: AggregateFn,
    },
    /// Stream-table join against a point store.
    Join { table: StoreHandle, joiner: JoinFn },
    /// Windowed aggregate. Late records go to `late_tx` when configured,
    /// otherwise they are counted and dropped.
    WindowAggregate {
        windows: WindowedStore,
        aggregate: AggregateFn,
        late_tx: Option<mpsc::Sender<Record>>,
    },
}

struct Node {
    name: String,
    kind: NodeKind,
    children: Vec<usize>,
}

/// Builds a [Topology]. Nodes attach to already-declared parents, so the
/// graph is acyclic by construction.
#[derive(Default)]
pub struct TopologyBuilder {
    nodes: Vec<Node>,
    errors: Vec<String>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the source node. Must be the first node added.
    pub fn add_source(mut self, name: &str, kind: NodeKind) -> Self {
        if !self.nodes.is_empty() {
            self.errors
                .push(format!("source {name} must be the first node"));
            return self;
        }
        self.nodes.push(Node {
            name: name.to_string(),
            kind,
            children: Vec::new(),
        });
        self
    }

    /// Declares a node downstream of one or more parents. Outputs of a parent
    /// are forwarded to its children in the order they were added.
    pub fn add_node(mut self, name: &str, kind: NodeKind, parents: &[&str]) -> Self {
        if self.nodes.iter().any(|n| n.name == name) {
            self.errors.push(format!("duplicate node name {name}"));
            return self;
        }
        let idx = self.nodes.len();
        let mut resolved = Vec::new();
        for parent in parents {
            match self.nodes.iter().position(|n| n.name == *parent) {
                Some(p) => resolved.push(p),
                None => self.errors.push(format!(
                    "node {name} references unknown parent {parent}"
                )),
            }
        }
        self.nodes.push(Node {
            name: name.to_string(),
            kind,
            children: Vec::new(),
        });
        for parent in resolved {
            self.nodes[parent].children.push(idx);
        }
        self
    }

    pub fn build(self) -> Result<Topology> {
        if self.nodes.is_empty() {
            return Err(Error::Topology("topology has no source node".to_string()));
        }
        if let Some(error) = self.errors.into_iter().next() {
            return Err(Error::Topology(error));
        }
        Ok(Topology { nodes: self.nodes })
    }
}

/// An executable topology instance. Each worker owns its own.
pub struct Topology {
    nodes: Vec<Node>,
}

impl Topology {
    /// Runs one record through the graph. Outputs of leaf nodes are sent to
    /// the sink; a send only fails when the sink is gone, which ends the run.
    pub(crate) async fn process(
        &mut self,
        record: Record,
        sink: &mpsc::Sender<Record>,
    ) -> Result<()> {
        let mut stack: Vec<(usize, Record)> = vec![(0, record)];
        while let Some((idx, record)) = stack.pop() {
            let outputs = self.invoke(idx, &record).await?;
            let children = &self.nodes[idx].children;
            if children.is_empty() {
                for mut output in outputs {
                    // The input record's completion must not wait on sink
                    // consumption; processing is finished once the topology
                    // emitted it.
                    output.done = None;
                    sink.send(output)
                        .await
                        .map_err(|_| Error::Topology("record sink is closed".to_string()))?;
                }
                continue;
            }
            for output in outputs.iter().rev() {
                for child in children.iter().rev() {
                    stack.push((*child, output.clone()));
                }
            }
        }
        Ok(())
    }

    async fn invoke(&mut self, idx: usize, record: &Record) -> Result<Vec<Record>> {
        let node = &mut self.nodes[idx];
        match &mut node.kind {
            NodeKind::Map(map) => map(record),
            NodeKind::Aggregate { store, aggregate } => {
                let current = store.get(record.key.clone()).await?;
                match aggregate(current, record)? {
                    Some(next) => {
                        store.put(record.key.clone(), next.clone()).await?;
                        Ok(vec![derived(record, next)])
                    }
                    None => {
                        store.delete(record.key.clone()).await?;
                        Ok(Vec::new())
                    }
                }
            }
            NodeKind::Join { table, joiner } => {
                let value = table.get(record.key.clone()).await?;
                joiner(record, value)
            }
            NodeKind::WindowAggregate {
                windows,
                aggregate,
                late_tx,
            } => {
                match windows.assign(record.event_time) {
                    WindowAssignment::Late => {
                        debug!(node = %node.name, record = %record, "Late record");
                        if let Some(late_tx) = late_tx {
                            let mut late = record.clone();
                            late.done = None;
                            let _ = late_tx.send(late).await;
                        }
                        Ok(Vec::new())
                    }
                    WindowAssignment::Windows(assigned) => {
                        let mut outputs = Vec::new();
                        for window in assigned {
                            let current = windows.fetch(&record.key, &window).await?;
                            if let Some(next) = aggregate(current, record)? {
                                windows.update(&record.key, &window, next.clone()).await?;
                                outputs.push(derived(record, next));
                            }
                        }
                        // Lazy expiry: walk this key's windows while we are
                        // here instead of scheduling timers.
                        windows.sweep(&record.key).await?;
                        Ok(outputs)
                    }
                }
            }
        }
    }
}

/// An output record carrying a new value, keyed and timestamped like its
/// input. Outputs are not tracked; completion belongs to the input record.
fn derived(record: &Record, value: Bytes) -> Record {
    Record {
        partition: record.partition,
        offset: record.offset,
        key: record.key.clone(),
        value,
        event_time: record.event_time,
        headers: std::sync::Arc::clone(&record.headers),
        done: None,
    }
}
