use crate::{
    device::Device,
    edge::{ConsumerId, Edge},
    error::{Error, Result},
    graph::setup::Plan,
    node::{NodeError, NodeSlot},
    packet::PacketView,
    sync::{AtomicBool, AtomicUsize, Mutex, Ordering, fence, lock},
    types::{EdgeId, HashMap},
};
use rayon::ThreadPool;
use std::sync::Arc;
use tracing::warn;

/// Inputs a graph level resolves without reading its own edges.
///
/// A nested graph does not bind its boundary inputs: the composite node of
/// the outer graph already fetched them under its own consumer identity, and
/// inner nodes read the fetched packets from here.
#[derive(Debug)]
pub(crate) struct Boundary {
    /// Sequence index of the run.
    index: u64,
    inputs: HashMap<EdgeId, PacketView>,
}

impl Boundary {
    pub(crate) fn root(index: u64) -> Self {
        Self {
            index,
            inputs: HashMap::default(),
        }
    }

    pub(crate) fn nested<'a>(
        index: u64,
        inputs: impl IntoIterator<Item = (&'a Edge, &'a PacketView)>,
    ) -> Self {
        Self {
            index,
            inputs: inputs
                .into_iter()
                .map(|(edge, view)| (edge.id(), view.clone()))
                .collect(),
        }
    }

    fn fetch(&self, edge: &Edge, reader: ConsumerId) -> Result<PacketView> {
        match self.inputs.get(&edge.id()) {
            Some(view) => Ok(view.clone()),
            None => edge.update(reader),
        }
    }
}

/// Fetch the inputs of `slot` and run it once.
///
/// The invocation index is the largest index among the fetched packets, or
/// the run index for nodes without inputs. An input carrying a failure fails
/// the invocation without running the node.
fn invoke(slot: &NodeSlot, boundary: &Boundary, device: &Arc<dyn Device>) -> Result<()> {
    let reader = ConsumerId::Node(slot.id);
    let received = slot
        .inputs
        .iter()
        .map(|edge| boundary.fetch(edge, reader))
        .collect::<Result<Vec<_>>>()?;
    if let Some(failure) = received.iter().find_map(PacketView::failure) {
        return Err(failure.clone());
    }
    let index = received
        .iter()
        .map(PacketView::index)
        .max()
        .unwrap_or(boundary.index);
    slot.invoke(received, index, &slot.outputs, device)
}

/// Failure placed on an output a successful invocation did not write.
pub(crate) fn unwritten(slot: &NodeSlot, index: u64, edge: &Edge) -> Error {
    Error::NodeExecution {
        node: slot.name.clone(),
        index: Some(index),
        source: NodeError::new(format!("output `{}` was not written", edge.name())),
    }
}

/// Put a failure on every output of `slot` still empty after its
/// invocation: the invocation's own error, or [`unwritten`] after a success.
///
/// Task edges block readers until written, and a direct edge left empty
/// would otherwise surface as a bare `NoData` further down.
fn close_unwritten(slot: &NodeSlot, index: u64, outcome: &Result<()>) {
    for edge in &slot.outputs {
        if edge.last_index().is_some() {
            continue;
        }
        let failure = match outcome {
            Err(error) => error.clone(),
            Ok(()) => unwritten(slot, index, edge),
        };
        if let Err(error) = edge.fail(index, failure) {
            warn!(node = %slot.name, edge = edge.name(), %error, "failed to close output");
        }
    }
}

/// Run every node once in topological order on the calling thread, stopping
/// at the first failure.
///
/// Expects the edges the graph owns to have been cleared since the last run.
pub(crate) fn run_sequential(
    nodes: &[Arc<NodeSlot>],
    order: &[usize],
    boundary: &Boundary,
    device: &Arc<dyn Device>,
) -> Result<()> {
    for &position in order {
        let slot = &*nodes[position];
        let outcome = invoke(slot, boundary, device);
        close_unwritten(slot, boundary.index, &outcome);
        outcome?;
    }
    Ok(())
}

/// Dependency-driven dispatch on a worker pool.
///
/// Children are split into `owned` (single parent) and `shared` (multiple
/// parents). An owned child runs right after its parent in the same task. A
/// shared child runs in the task of whichever parent finishes last, detected
/// by a countdown of unfinished parents; a Release/Acquire fence pair orders
/// the parents' edge writes before the child's reads.
#[derive(Debug)]
pub(crate) struct TaskRuntime {
    pool: ThreadPool,
    layouts: Vec<TaskLayout>,
    parents: Vec<ParentInfoSlot>,
    roots: Vec<usize>,
}

#[derive(Debug)]
struct TaskLayout {
    owned_children: Vec<usize>,
    shared_children: Vec<usize>,
}

#[derive(Debug)]
#[repr(align(128))]
struct ParentInfoSlot {
    /// Total number of parent nodes.
    parents_total: usize,
    /// Number of parent nodes that haven't finished in the current run.
    parents_left: AtomicUsize,
}

/// State of one Task run shared by all of its pool tasks.
struct TaskRun<'a> {
    runtime: &'a TaskRuntime,
    nodes: &'a [Arc<NodeSlot>],
    boundary: &'a Boundary,
    device: &'a Arc<dyn Device>,
    /// First failure of the run.
    failure: Mutex<Option<Error>>,
    /// Set on the first failure; later nodes are skipped but still counted
    /// down so the run drains.
    aborted: AtomicBool,
}

impl TaskRuntime {
    pub(crate) fn new(plan: &Plan, pool: ThreadPool) -> Self {
        let layouts = plan
            .children
            .iter()
            .map(|children| {
                let (owned_children, shared_children) = children
                    .iter()
                    .copied()
                    .partition(|&child| plan.parents[child].len() == 1);
                TaskLayout {
                    owned_children,
                    shared_children,
                }
            })
            .collect();
        let parents = plan
            .parents
            .iter()
            .map(|parents| ParentInfoSlot {
                parents_total: parents.len(),
                parents_left: AtomicUsize::new(parents.len()),
            })
            .collect();
        Self {
            pool,
            layouts,
            parents,
            roots: plan.order[..plan.num_roots].to_vec(),
        }
    }

    /// Run every node once, returning the first failure.
    pub(crate) fn run(
        &self,
        nodes: &[Arc<NodeSlot>],
        boundary: &Boundary,
        device: &Arc<dyn Device>,
    ) -> Result<()> {
        for parent in &self.parents {
            parent
                .parents_left
                .store(parent.parents_total, Ordering::Relaxed);
        }
        let run = TaskRun {
            runtime: self,
            nodes,
            boundary,
            device,
            failure: Mutex::new(None),
            aborted: AtomicBool::new(false),
        };
        self.pool.install(|| run.join(&self.roots));
        lock(&run.failure).take().map_or(Ok(()), Err)
    }
}

impl TaskRun<'_> {
    fn join(&self, positions: &[usize]) {
        match positions {
            [] => {}
            &[position] => self.exec(position),
            _ => {
                let (left, right) = positions.split_at(positions.len() / 2);
                rayon::join(|| self.join(left), || self.join(right));
            }
        }
    }

    fn exec(&self, position: usize) {
        let slot = &*self.nodes[position];
        let outcome = if self.aborted.load(Ordering::Acquire) {
            Err(self.first_failure())
        } else {
            invoke(slot, self.boundary, self.device)
                .inspect_err(|error| self.abort(position, error.clone()))
        };
        close_unwritten(slot, self.boundary.index, &outcome);

        let TaskLayout {
            owned_children,
            shared_children,
        } = &self.runtime.layouts[position];
        let mut ready = owned_children.clone();
        let num_owned = ready.len();

        if !shared_children.is_empty() {
            fence(Ordering::Release);
        }
        for &child in shared_children {
            let parent_info = &self.runtime.parents[child];
            if parent_info.parents_left.fetch_sub(1, Ordering::Relaxed) == 1 {
                ready.push(child);
            }
        }
        if ready.len() != num_owned {
            fence(Ordering::Acquire);
        }

        self.join(&ready);
    }

    fn abort(&self, position: usize, error: Error) {
        warn!(node = %self.nodes[position].name, %error, "task run aborted");
        lock(&self.failure).get_or_insert(error);
        self.aborted.store(true, Ordering::Release);
    }

    fn first_failure(&self) -> Error {
        lock(&self.failure)
            .clone()
            .expect("TaskRun::first_failure: [1]")
    }
}
