//! Rivulet is a partition-ordered, keyed stream-processing runtime. Records
//! are pulled from a partitioned source, dispatched to a fixed pool of
//! workers so that records sharing a dispatch key are processed strictly in
//! order by a single worker, run through a topology of processing nodes, and
//! the state they produce is persisted through an append-only changelog so
//! stores can be rebuilt after a crash or rebalance.
//!
//! The poll loop executes the following until a shutdown signal is received:
//! - Poll a batch of records from the source
//! - Track each record and submit it to its worker (suspending on
//!   backpressure when the worker's inbox is full)
//! - Commit source offsets for records whose processing completed

pub(crate) use self::error::Result;

pub mod error;
pub use crate::error::Error;

pub mod changelog;
pub mod config;
pub mod message;
pub mod pool;
pub mod runtime;
pub mod source;
pub mod store;
pub mod topology;
pub mod window;

mod tracker;

pub use crate::changelog::{ChangelogLog, ChangelogRecord};
pub use crate::config::{OrderingStrategy, Settings};
pub use crate::message::Record;
pub use crate::pool::{WorkerPool, WorkerState};
pub use crate::runtime::{RunningStream, StreamRuntime};
pub use crate::source::{RecordSource, SourceHandle};
pub use crate::store::{StoreHandle, StoreState};
pub use crate::store::registry::StoreRegistry;
pub use crate::topology::{NodeKind, Topology, TopologyBuilder};
pub use crate::window::{Window, WindowAssignment, WindowManager, WindowedStore};
