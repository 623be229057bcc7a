use crate::{
    device::{Descriptor, Device},
    edge::Edge,
    error::{Error, Result},
    graph::Graph,
    packet::PacketView,
    payload::{Param, Payload},
    sync::{Mutex, lock},
    types::NodeId,
};
use core::{any::Any, fmt};
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use thiserror::Error;

/// Status reported by a failing node.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message} (status {status})")]
pub struct NodeError {
    status: i32,
    message: String,
}

impl NodeError {
    /// Status used when the node does not supply one.
    pub const UNSPECIFIED: i32 = -1;

    pub fn new(message: impl Into<String>) -> Self {
        Self::with_status(Self::UNSPECIFIED, message)
    }

    pub fn with_status(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn status(&self) -> i32 {
        self.status
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    fn panicked(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_owned());
        Self::new(format!("panicked: {message}"))
    }
}

impl From<Error> for NodeError {
    fn from(error: Error) -> Self {
        Self::new(error.to_string())
    }
}

/// A unit of computation.
///
/// The graph fetches every input before calling `run`, following the
/// strategy of each input edge, and hands the packets over through the
/// [`RunContext`]. `run` must write every output exactly once through the
/// context.
pub trait Node: fmt::Debug + Send {
    /// Called once from `Graph::init`.
    fn init(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<(), NodeError>;

    /// Called once from `Graph::deinit`.
    fn deinit(&mut self) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Adapts a closure into a [`Node`].
pub struct FnNode<F>(F);

impl<F> FnNode<F>
where
    F: FnMut(&mut RunContext<'_>) -> Result<(), NodeError> + Send,
{
    pub fn new(run: F) -> Self {
        Self(run)
    }
}

impl<F> fmt::Debug for FnNode<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnNode").finish_non_exhaustive()
    }
}

impl<F> Node for FnNode<F>
where
    F: FnMut(&mut RunContext<'_>) -> Result<(), NodeError> + Send,
{
    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<(), NodeError> {
        (self.0)(ctx)
    }
}

/// Everything a node sees during one invocation.
#[derive(Debug)]
pub struct RunContext<'a> {
    slot: &'a NodeSlot,
    index: u64,
    received: Vec<PacketView>,
    /// Edges the outputs are written to; differs from the slot's wiring
    /// inside a nested pipeline.
    outputs: &'a [Edge],
    device: &'a Arc<dyn Device>,
}

impl<'a> RunContext<'a> {
    /// Name of the running node.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// Sequence index of this invocation. Outputs are written under it.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    #[must_use]
    pub fn device(&self) -> &dyn Device {
        &**self.device
    }

    /// The node's parameter object, if one of type `T` was attached.
    #[must_use]
    pub fn param<T: Param>(&self) -> Option<&T> {
        self.slot
            .param
            .as_deref()
            .and_then(|param| param.as_any().downcast_ref())
    }

    #[must_use]
    pub fn num_inputs(&self) -> usize {
        self.received.len()
    }

    #[must_use]
    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Payload fetched from input `position`.
    ///
    /// # Errors
    /// If `position` is out of range.
    pub fn input(&self, position: usize) -> Result<&Arc<Payload>, NodeError> {
        let view = self.received.get(position).ok_or_else(|| {
            NodeError::new(format!("node `{}` has no input {position}", self.slot.name))
        })?;
        Ok(view.payload()?)
    }

    /// Sequence index of the packet fetched from input `position`.
    #[must_use]
    pub fn input_index(&self, position: usize) -> Option<u64> {
        self.received.get(position).map(PacketView::index)
    }

    fn output(&self, position: usize) -> Result<&'a Edge, NodeError> {
        self.outputs.get(position).ok_or_else(|| {
            NodeError::new(format!("node `{}` has no output {position}", self.slot.name))
        })
    }

    /// Allocate the payload for output `position` on the graph's device.
    ///
    /// # Errors
    /// Device or edge errors.
    pub fn create_output(
        &self,
        position: usize,
        desc: &Descriptor,
    ) -> Result<Payload, NodeError> {
        Ok(self.output(position)?.create(self.device(), desc, self.index)?)
    }

    /// Publish a payload obtained from [`RunContext::create_output`].
    ///
    /// # Errors
    /// Edge errors.
    pub fn notify_written(&self, position: usize, payload: Payload) -> Result<(), NodeError> {
        Ok(self.output(position)?.notify_written(payload)?)
    }

    /// Publish `payload` on output `position` under this invocation's index.
    ///
    /// # Errors
    /// Edge errors.
    pub fn set_output(
        &self,
        position: usize,
        payload: impl Into<Arc<Payload>>,
    ) -> Result<(), NodeError> {
        Ok(self.output(position)?.set(payload, self.index)?)
    }

    pub(crate) fn received(&self) -> &[PacketView] {
        &self.received
    }
}

/// Body of a graph member: a leaf node or a nested graph.
#[derive(Debug)]
pub(crate) enum Schedulable {
    Leaf(Box<dyn Node>),
    Graph(Box<Graph>),
}

/// A node as owned by its graph: identity, wiring and body.
#[derive(Debug)]
pub(crate) struct NodeSlot {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) inputs: Vec<Edge>,
    pub(crate) outputs: Vec<Edge>,
    pub(crate) param: Option<Arc<dyn Param>>,
    pub(crate) body: Mutex<Schedulable>,
}

impl NodeSlot {
    fn node_error(&self, index: Option<u64>, source: NodeError) -> Error {
        Error::NodeExecution {
            node: self.name.clone(),
            index,
            source,
        }
    }

    pub(crate) fn init(&self) -> Result<()> {
        match &mut *lock(&self.body) {
            Schedulable::Leaf(node) => node.init().map_err(|err| self.node_error(None, err)),
            Schedulable::Graph(graph) => graph.init_nested(),
        }
    }

    pub(crate) fn deinit(&self) -> Result<()> {
        match &mut *lock(&self.body) {
            Schedulable::Leaf(node) => node.deinit().map_err(|err| self.node_error(None, err)),
            Schedulable::Graph(graph) => graph.deinit(),
        }
    }

    /// Run one invocation over already fetched input packets, writing to
    /// `outputs`.
    ///
    /// A panicking body is reported as a failure of this invocation.
    pub(crate) fn invoke(
        &self,
        received: Vec<PacketView>,
        index: u64,
        outputs: &[Edge],
        device: &Arc<dyn Device>,
    ) -> Result<()> {
        let mut ctx = RunContext {
            slot: self,
            index,
            received,
            outputs,
            device,
        };
        let mut body = lock(&self.body);
        let outcome = catch_unwind(AssertUnwindSafe(|| match &mut *body {
            Schedulable::Leaf(node) => node
                .run(&mut ctx)
                .map_err(|err| self.node_error(Some(index), err)),
            Schedulable::Graph(graph) => graph.run_nested(&ctx),
        }));
        outcome.unwrap_or_else(|panic| Err(self.node_error(Some(index), NodeError::panicked(&*panic))))
    }
}
