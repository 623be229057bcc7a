use crate::{
    config::GraphConfig,
    device::Device,
    edge::{ConsumerId, Edge},
    error::Result,
    graph::{TopologyError, execute::unwritten},
    node::NodeSlot,
    packet::PacketView,
    pool::{self, WorkerGroup},
    sync::{Mutex, lock},
    types::{EdgeId, IndexMap},
};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Pipeline dispatch: every node is a persistent loop on its own worker.
///
/// A loop blocks on its inputs, runs the node under the index of the aligned
/// packets, and starts over. Consecutive nodes therefore work on different
/// indices at the same time. Loops exit when an input reports termination.
#[derive(Debug)]
pub(crate) struct PipelineRuntime {
    workers: WorkerGroup,
    /// Present when the graph is nested in an outer graph.
    ports: Option<Ports>,
}

/// Edges one worker loop reads and writes.
#[derive(Debug)]
struct Wiring {
    inputs: Vec<Edge>,
    outputs: Vec<Edge>,
}

impl PipelineRuntime {
    /// Spawn one worker loop per node. Boundary edges found in `ports` are
    /// replaced by their port edges.
    ///
    /// # Errors
    /// [`Error::ThreadPool`](crate::error::Error::ThreadPool) if the workers
    /// cannot be started.
    pub(crate) fn start(
        graph: &str,
        nodes: &[Arc<NodeSlot>],
        device: &Arc<dyn Device>,
        config: &GraphConfig,
        ports: Option<Ports>,
    ) -> Result<Self> {
        let workers = WorkerGroup::new(pool::build(config, graph, nodes.len())?);
        for slot in nodes {
            let resolve = |edges: &[Edge]| -> Vec<Edge> {
                edges
                    .iter()
                    .map(|edge| match &ports {
                        Some(ports) => ports.resolve(edge).clone(),
                        None => edge.clone(),
                    })
                    .collect()
            };
            let wiring = Wiring {
                inputs: resolve(&slot.inputs),
                outputs: resolve(&slot.outputs),
            };
            let slot = Arc::clone(slot);
            let device = Arc::clone(device);
            workers.spawn(move || worker_loop(&slot, &wiring, &device));
        }
        debug!(graph, workers = nodes.len(), nested = ports.is_some(), "pipeline started");
        Ok(Self { workers, ports })
    }

    /// The ports of a nested pipeline.
    pub(crate) fn ports(&self) -> Option<&Ports> {
        self.ports.as_ref()
    }

    /// Wait for every loop to exit. Edges must have been terminated first.
    pub(crate) fn join(self) {
        self.workers.join();
    }
}

/// Boundary of a Pipeline graph nested in an outer graph.
///
/// The outer graph owns the boundary edges and binds them with its own
/// discipline, so the stages of the nested pipeline read and write private
/// port edges instead. Each invocation of the composite node feeds its
/// inputs into the input ports under a fresh inner index and waits for that
/// index on every output port, read under the graph-output identity.
#[derive(Debug)]
pub(crate) struct Ports {
    /// Port edge per boundary edge.
    edges: IndexMap<EdgeId, Edge>,
    next_index: Mutex<u64>,
}

impl Ports {
    /// Unbound port edges for `inputs` and `outputs`.
    pub(crate) fn new(inputs: &[Edge], outputs: &[Edge]) -> Self {
        let edges = inputs
            .iter()
            .chain(outputs)
            .map(|edge| {
                let port = match edge.kind() {
                    Some(kind) => Edge::with_kind(edge.name(), kind),
                    None => Edge::new(edge.name()),
                };
                (edge.id(), port)
            })
            .collect();
        Self {
            edges,
            next_index: Mutex::new(0),
        }
    }

    /// Boundary edges paired with their ports.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (EdgeId, &Edge)> {
        self.edges.iter().map(|(&id, port)| (id, port))
    }

    fn resolve<'a>(&'a self, edge: &'a Edge) -> &'a Edge {
        self.edges.get(&edge.id()).unwrap_or(edge)
    }

    /// Push one invocation of the composite node through the nested pipeline.
    ///
    /// `received` holds the packets fetched from `inputs`; the results are
    /// written to `outputs` under `index`.
    ///
    /// # Errors
    /// The failure the nested pipeline recorded for the invocation, or any
    /// edge error.
    pub(crate) fn relay(
        &self,
        inputs: &[Edge],
        outputs: &[Edge],
        received: &[PacketView],
        index: u64,
    ) -> Result<()> {
        let sequence = {
            let mut next = lock(&self.next_index);
            let sequence = *next;
            *next += 1;
            sequence
        };
        for (edge, view) in inputs.iter().zip(received) {
            self.resolve(edge).set(Arc::clone(view.payload()?), sequence)?;
        }
        // Drain every output before looking at the results, so all
        // graph-output cursors stay on the same inner index.
        let mut drained = Vec::with_capacity(outputs.len());
        for edge in outputs {
            let port = self.resolve(edge);
            let view = loop {
                let view = port.graph_output_packet(None)?;
                if view.index() >= sequence {
                    break view;
                }
            };
            drained.push(view);
        }
        let payloads = drained
            .into_iter()
            .map(PacketView::into_payload)
            .collect::<Result<Vec<_>>>()?;
        for (edge, payload) in outputs.iter().zip(payloads) {
            edge.set(payload, index)?;
        }
        trace!(sequence, index, "nested pipeline invocation relayed");
        Ok(())
    }
}

fn worker_loop(slot: &NodeSlot, wiring: &Wiring, device: &Arc<dyn Device>) {
    let reader = ConsumerId::Node(slot.id);
    loop {
        let (index, received) = match barrier(slot, &wiring.inputs, reader) {
            Ok(aligned) => aligned,
            Err(error) => {
                if !error.is_terminated() {
                    error!(node = %slot.name, %error, "pipeline worker stopped");
                }
                break;
            }
        };
        let outcome = match received.iter().find_map(PacketView::failure) {
            Some(failure) => Err(failure.clone()),
            None => slot.invoke(received, index, &wiring.outputs, device),
        };
        if let Err(error) = &outcome {
            debug!(node = %slot.name, index, %error, "invocation failed");
        }
        if let Err(error) = complete_outputs(slot, &wiring.outputs, index, &outcome) {
            if !error.is_terminated() {
                error!(node = %slot.name, index, %error, "pipeline worker stopped");
            }
            break;
        }
    }
    trace!(node = %slot.name, "pipeline worker exited");
}

/// Read one packet from every input and align them on a common index.
///
/// Inputs behind the largest index advance until they reach it. An index
/// missing from some input can never complete, so the packets carrying it are
/// consumed without running the node.
fn barrier(
    slot: &NodeSlot,
    inputs: &[Edge],
    reader: ConsumerId,
) -> Result<(u64, Vec<PacketView>)> {
    let mut received = inputs
        .iter()
        .map(|edge| edge.update(reader))
        .collect::<Result<Vec<_>>>()?;
    loop {
        let Some(target) = received.iter().map(PacketView::index).max() else {
            return Err(TopologyError::PipelineSource(slot.name.clone()).into());
        };
        let mut aligned = true;
        for (edge, view) in inputs.iter().zip(&mut received) {
            while view.index() < target {
                trace!(
                    node = %slot.name,
                    edge = edge.name(),
                    index = view.index(),
                    target,
                    "skipping unmatched index"
                );
                *view = edge.update(reader)?;
            }
            aligned &= view.index() == target;
        }
        if aligned {
            return Ok((target, received));
        }
    }
}

/// Make sure every output carries something for `index`, so downstream
/// barriers never wait for an index that will not come.
///
/// A failed invocation puts its failure on every output it did not write; a
/// successful one that skipped an output gets an explicit failure there.
fn complete_outputs(
    slot: &NodeSlot,
    outputs: &[Edge],
    index: u64,
    outcome: &Result<()>,
) -> Result<()> {
    for edge in outputs {
        if edge.last_index().is_some_and(|last| last >= index) {
            continue;
        }
        let failure = match outcome {
            Err(error) => error.clone(),
            Ok(()) => unwritten(slot, index, edge),
        };
        edge.fail(index, failure)?;
    }
    Ok(())
}
