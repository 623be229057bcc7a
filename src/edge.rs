mod direct;
mod pipeline;
mod task;

use crate::{
    device::{Descriptor, Device},
    edge::{direct::DirectEdge, pipeline::PipelineEdge, task::TaskEdge},
    error::{Error, Result, StateError},
    packet::{PacketData, PacketView},
    payload::{Payload, PayloadKind},
    sync::{Mutex, lock},
    types::{EdgeId, NodeId, ParallelType},
};
use core::{
    fmt::Debug,
    hash::{Hash, Hasher},
    time::Duration,
};
use derive_more::Display;
use std::sync::Arc;
use tracing::{debug, trace};

/// Identity under which a reader consumes an edge.
///
/// Pipeline edges keep one cursor per registered consumer, so the identity
/// must be the same on every read of one logical reader.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConsumerId {
    /// A node of the graph that bound the edge.
    #[display("node {_0}")]
    Node(NodeId),
    /// The caller draining a root graph's output.
    #[display("graph output")]
    GraphOutput,
}

/// Strategy-specific channel behind an [`Edge`].
///
/// Exactly one implementation per parallel discipline:
/// - `DirectEdge`: a single current value, overwritten on write, never blocks;
/// - `TaskEdge`: a single in-flight value, readers block until it is written;
/// - `PipelineEdge`: a reference-counted backlog with per-consumer cursors.
pub(crate) trait EdgeStrategy: Debug + Send + Sync {
    fn parallel_type(&self) -> ParallelType;
    /// Make `data` visible to consumers under sequence `index`.
    fn publish(&self, index: u64, data: PacketData) -> Result<()>;
    /// Advance `consumer` to its next packet. Non-pipeline strategies return
    /// the current value, since their reads do not consume.
    fn update(&self, consumer: ConsumerId, timeout: Option<Duration>) -> Result<PacketView>;
    /// The packet `consumer` currently holds, without advancing.
    fn get(&self, consumer: ConsumerId) -> Result<PacketView>;
    fn index(&self, consumer: ConsumerId) -> Option<u64>;
    fn position(&self, consumer: ConsumerId) -> Option<usize>;
    /// Index of the most recent write.
    fn last_index(&self) -> Option<u64>;
    fn backlog_len(&self) -> usize;
    /// Forget the current value before a new run.
    fn clear(&self) {}
    /// Wake every waiter with a termination signal. Returns `true` on the
    /// first request.
    fn request_terminate(&self) -> bool;
}

/// Typed single-producer, multi-consumer channel between nodes.
///
/// `Edge` is a cheap handle: clones refer to the same channel. The strategy
/// is bound when the owning graph is initialized and dropped again on deinit.
#[derive(Debug, Clone)]
pub struct Edge {
    inner: Arc<EdgeInner>,
}

#[derive(Debug)]
struct EdgeInner {
    id: EdgeId,
    name: String,
    slot: Mutex<EdgeSlot>,
}

#[derive(Debug, Default)]
struct EdgeSlot {
    kind: Option<PayloadKind>,
    /// Index reserved by `create` for the following `notify_written`.
    pending: Option<u64>,
    strategy: Option<Arc<dyn EdgeStrategy>>,
}

impl PartialEq for Edge {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Edge {}

impl Hash for Edge {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl Edge {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_slot(name.into(), EdgeSlot::default())
    }

    /// An edge that only accepts payloads of `kind`.
    pub fn with_kind(name: impl Into<String>, kind: PayloadKind) -> Self {
        Self::with_slot(
            name.into(),
            EdgeSlot {
                kind: Some(kind),
                ..EdgeSlot::default()
            },
        )
    }

    fn with_slot(name: String, slot: EdgeSlot) -> Self {
        Self {
            inner: Arc::new(EdgeInner {
                id: EdgeId::next(),
                name,
                slot: Mutex::new(slot),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> EdgeId {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Payload kind fixed by construction or by the first write.
    #[must_use]
    pub fn kind(&self) -> Option<PayloadKind> {
        lock(&self.inner.slot).kind
    }

    /// Discipline of the bound strategy, `None` while unbound.
    #[must_use]
    pub fn parallel_type(&self) -> Option<ParallelType> {
        lock(&self.inner.slot)
            .strategy
            .as_ref()
            .map(|strategy| strategy.parallel_type())
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        lock(&self.inner.slot).strategy.is_some()
    }

    /// Bind the strategy matching `parallel_type`.
    ///
    /// Graphs call this during `init`. `consumers` is the fixed set of readers
    /// a pipeline edge counts releases against; other strategies ignore it.
    ///
    /// # Errors
    /// [`StateError::AlreadyBound`] if another graph bound the edge first.
    pub fn bind(
        &self,
        parallel_type: ParallelType,
        consumers: impl IntoIterator<Item = ConsumerId>,
    ) -> Result<()> {
        let mut slot = lock(&self.inner.slot);
        if slot.strategy.is_some() {
            return Err(StateError::AlreadyBound(self.inner.name.clone()).into());
        }
        let name = self.inner.name.clone();
        let strategy: Arc<dyn EdgeStrategy> = match parallel_type.resolve() {
            ParallelType::Task => Arc::new(TaskEdge::new(name)),
            ParallelType::Pipeline => Arc::new(PipelineEdge::new(name, consumers)),
            ParallelType::None | ParallelType::Sequential => Arc::new(DirectEdge::new(name)),
        };
        debug!(edge = %self.inner.name, %parallel_type, "edge bound");
        slot.strategy = Some(strategy);
        slot.pending = None;
        Ok(())
    }

    /// Drop the bound strategy and everything it still holds. Returns `false`
    /// if the edge was not bound.
    pub fn unbind(&self) -> bool {
        let strategy = {
            let mut slot = lock(&self.inner.slot);
            slot.pending = None;
            slot.strategy.take()
        };
        strategy.is_some()
    }

    fn strategy(&self) -> Result<Arc<dyn EdgeStrategy>> {
        lock(&self.inner.slot)
            .strategy
            .clone()
            .ok_or_else(|| StateError::Unbound(self.inner.name.clone()).into())
    }

    fn check_kind(&self, slot: &mut EdgeSlot, found: PayloadKind) -> Result<()> {
        match slot.kind {
            None => {
                slot.kind = Some(found);
                Ok(())
            }
            Some(expected) if expected == found => Ok(()),
            Some(expected) => Err(Error::PayloadKind {
                edge: self.inner.name.clone(),
                expected,
                found,
            }),
        }
    }

    /// Publish `payload` under sequence `index`.
    ///
    /// The handle is shared with every consumer; the producer must not mutate
    /// it afterwards.
    ///
    /// # Errors
    /// Unbound edge, payload kind mismatch, or (pipeline) a non-increasing
    /// index or a terminated edge.
    pub fn set(&self, payload: impl Into<Arc<Payload>>, index: u64) -> Result<()> {
        let payload = payload.into();
        let strategy = {
            let mut slot = lock(&self.inner.slot);
            self.check_kind(&mut slot, payload.kind())?;
            slot.strategy
                .clone()
                .ok_or_else(|| Error::from(StateError::Unbound(self.inner.name.clone())))?
        };
        trace!(edge = %self.inner.name, index, "set");
        strategy.publish(index, Ok(payload))
    }

    /// Allocate a payload for sequence `index` on `device`; publish it with
    /// [`Edge::notify_written`] once filled.
    ///
    /// # Errors
    /// Device allocation failure, payload kind mismatch or unbound edge.
    pub fn create(&self, device: &dyn Device, desc: &Descriptor, index: u64) -> Result<Payload> {
        let payload = device.create_payload(desc)?;
        let mut slot = lock(&self.inner.slot);
        if slot.strategy.is_none() {
            return Err(StateError::Unbound(self.inner.name.clone()).into());
        }
        self.check_kind(&mut slot, payload.kind())?;
        slot.pending = Some(index);
        Ok(payload)
    }

    /// Publish a payload obtained from [`Edge::create`].
    ///
    /// # Errors
    /// [`StateError::NoPendingWrite`] without a preceding `create`, plus the
    /// errors of [`Edge::set`].
    pub fn notify_written(&self, payload: Payload) -> Result<()> {
        let index = lock(&self.inner.slot)
            .pending
            .take()
            .ok_or_else(|| StateError::NoPendingWrite(self.inner.name.clone()))?;
        self.set(payload, index)
    }

    /// Attach `error` to sequence `index` in place of a payload.
    pub(crate) fn fail(&self, index: u64, error: Error) -> Result<()> {
        lock(&self.inner.slot).pending = None;
        trace!(edge = %self.inner.name, index, %error, "failure packet");
        self.strategy()?.publish(index, Err(error))
    }

    /// Advance `consumer` to its next packet, blocking per the strategy.
    ///
    /// # Errors
    /// [`Error::Terminated`] once termination was requested, or
    /// [`Error::NoData`] on an empty direct edge.
    pub fn update(&self, consumer: ConsumerId) -> Result<PacketView> {
        self.strategy()?.update(consumer, None)
    }

    /// Payload of the packet `consumer` currently holds.
    ///
    /// # Errors
    /// The failure recorded for the held index, or any error of the read.
    pub fn get(&self, consumer: ConsumerId) -> Result<Arc<Payload>> {
        self.get_view(consumer)?.into_payload()
    }

    pub(crate) fn get_view(&self, consumer: ConsumerId) -> Result<PacketView> {
        self.strategy()?.get(consumer)
    }

    /// Sequence index of the packet `consumer` holds.
    #[must_use]
    pub fn index(&self, consumer: ConsumerId) -> Option<u64> {
        self.strategy().ok()?.index(consumer)
    }

    /// Position of the packet `consumer` holds within the backlog.
    #[must_use]
    pub fn position(&self, consumer: ConsumerId) -> Option<usize> {
        self.strategy().ok()?.position(consumer)
    }

    /// Next result of a root graph output, in sequence order.
    ///
    /// # Errors
    /// The failure recorded for that index, or [`Error::Terminated`] after
    /// `deinit`.
    pub fn graph_output(&self) -> Result<Arc<Payload>> {
        self.graph_output_packet(None)?.into_payload()
    }

    /// [`Edge::graph_output`] giving up after `timeout`.
    ///
    /// # Errors
    /// [`Error::PipelineTimeout`] if nothing arrived in time.
    pub fn graph_output_timeout(&self, timeout: Duration) -> Result<Arc<Payload>> {
        self.graph_output_packet(Some(timeout))?.into_payload()
    }

    /// Next graph-output packet with its sequence index.
    ///
    /// # Errors
    /// See [`Edge::graph_output_timeout`].
    pub fn graph_output_packet(&self, timeout: Option<Duration>) -> Result<PacketView> {
        self.strategy()?.update(ConsumerId::GraphOutput, timeout)
    }

    #[must_use]
    pub fn graph_output_index(&self) -> Option<u64> {
        self.index(ConsumerId::GraphOutput)
    }

    #[must_use]
    pub fn graph_output_position(&self) -> Option<usize> {
        self.position(ConsumerId::GraphOutput)
    }

    /// Index of the latest write.
    #[must_use]
    pub fn last_index(&self) -> Option<u64> {
        self.strategy().ok()?.last_index()
    }

    /// Packets not yet released by every consumer.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.strategy().map_or(0, |strategy| strategy.backlog_len())
    }

    pub(crate) fn clear(&self) {
        if let Ok(strategy) = self.strategy() {
            strategy.clear();
        }
    }

    /// Unblock every reader of the edge with [`Error::Terminated`].
    ///
    /// Idempotent; returns `true` on the first effective request.
    pub fn request_terminate(&self) -> bool {
        self.strategy()
            .is_ok_and(|strategy| strategy.request_terminate())
    }
}
