use crate::{
    device::DeviceError, edge::ConsumerId, graph::TopologyError, node::NodeError,
    payload::PayloadKind,
};
use core::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Any failure of graph construction, lifecycle, scheduling or edge access.
///
/// Errors are `Clone` because a pipeline failure is attached to a sequence
/// index and travels downstream to every consumer of that index.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The node/edge membership is not a valid DAG.
    #[error(transparent)]
    Topology(#[from] TopologyError),
    /// A lifecycle or edge operation was called out of order.
    #[error(transparent)]
    State(#[from] StateError),
    /// A node's `run` reported failure (or panicked).
    #[error("node `{node}` failed: {source}")]
    NodeExecution {
        node: String,
        /// Sequence index of the failed invocation, when known.
        index: Option<u64>,
        source: NodeError,
    },
    /// A drain waited longer than the caller allowed.
    #[error("no packet arrived on edge `{edge}` within {timeout:?}")]
    PipelineTimeout { edge: String, timeout: Duration },
    /// A read observed the shutdown signal instead of data.
    #[error("edge `{edge}` was terminated")]
    Terminated { edge: String },
    /// A non-blocking read found nothing written yet.
    #[error("edge `{edge}` holds no data")]
    NoData { edge: String },
    /// A write does not match the payload kind the edge carries.
    #[error("edge `{edge}` carries {expected} payloads, got {found}")]
    PayloadKind {
        edge: String,
        expected: PayloadKind,
        found: PayloadKind,
    },
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// The worker pool of a Task or Pipeline graph could not be started.
    #[error("failed to start worker pool: {0}")]
    ThreadPool(String),
}

impl Error {
    /// Whether the error is the shutdown signal of an edge.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }
}

/// Lifecycle violations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StateError {
    #[error("graph `{0}` is already initialized")]
    AlreadyInitialized(String),
    #[error("graph `{0}` is not initialized")]
    NotInitialized(String),
    /// The edge has not been bound to a strategy by an initialized graph.
    #[error("edge `{0}` is not bound to a parallel strategy")]
    Unbound(String),
    /// The edge is already bound by another graph.
    #[error("edge `{0}` is already bound to a parallel strategy")]
    AlreadyBound(String),
    #[error("edge `{edge}` requires an index greater than {last}, got {index}")]
    IndexNotIncreasing { edge: String, last: u64, index: u64 },
    /// `notify_written` without a preceding `create`.
    #[error("edge `{0}` has no pending write")]
    NoPendingWrite(String),
    #[error("{consumer} is not a registered consumer of edge `{edge}`")]
    UnregisteredConsumer { edge: String, consumer: ConsumerId },
    #[error("graph `{graph}` expects {expected} inputs, got {found}")]
    InputCount {
        graph: String,
        expected: usize,
        found: usize,
    },
}
