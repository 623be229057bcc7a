use crate::{
    edge::Edge,
    node::NodeSlot,
    types::{EdgeId, IndexMap, IndexSet},
};
use rustc_hash::FxBuildHasher;
use std::{collections::VecDeque, sync::Arc};
use thiserror::Error;

/// Error returned by `Graph::init` when the node/edge membership is invalid.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TopologyError {
    /// The dependency graph contains cycle(s).
    #[error("graph `{graph}` contains cycle(s)")]
    Cycle { graph: String },
    #[error("edge `{edge}` has two producers: `{first}` and `{second}`")]
    MultipleProducers {
        edge: String,
        first: String,
        second: String,
    },
    /// An edge is read inside the graph but neither produced by a node nor a
    /// graph input.
    #[error("edge `{edge}` read by `{node}` has no producer")]
    MissingProducer { edge: String, node: String },
    #[error("graph output `{edge}` has no producer")]
    UnproducedOutput { edge: String },
    /// An edge is produced but neither consumed nor a graph output.
    #[error("edge `{edge}` written by `{node}` has no consumer")]
    DanglingEdge { edge: String, node: String },
    /// A graph input that no node reads and that is not a graph output.
    #[error("graph input `{edge}` has no consumer")]
    UnconsumedInput { edge: String },
    #[error("graph input `{edge}` is written by `{node}`")]
    ProducedInput { edge: String, node: String },
    #[error("node `{node}` reads edge `{edge}` more than once")]
    DuplicateInput { node: String, edge: String },
    #[error("node name `{0}` is used twice")]
    DuplicateNode(String),
    /// Pipeline nodes are driven by their inputs, so each needs at least one.
    #[error("pipeline node `{0}` has no input edge")]
    PipelineSource(String),
}

/// How one edge is used at a single graph level.
#[derive(Debug)]
pub(crate) struct EdgeUse {
    pub(crate) edge: Edge,
    /// Position of the producing node.
    pub(crate) producer: Option<usize>,
    /// Positions of the consuming nodes.
    pub(crate) consumers: Vec<usize>,
}

impl EdgeUse {
    fn of<'a>(edges: &'a mut IndexMap<EdgeId, Self>, edge: &Edge) -> &'a mut Self {
        edges.entry(edge.id()).or_insert_with(|| Self {
            edge: edge.clone(),
            producer: None,
            consumers: vec![],
        })
    }
}

/// Validated schedule of one graph level.
#[derive(Debug)]
pub(crate) struct Plan {
    /// Node positions in topological order; roots come first.
    pub(crate) order: Vec<usize>,
    pub(crate) num_roots: usize,
    /// Per node position, the positions of nodes reading its outputs.
    pub(crate) children: Vec<IndexSet<usize>>,
    /// Per node position, the positions of nodes producing its inputs.
    pub(crate) parents: Vec<IndexSet<usize>>,
    /// Every edge the level touches, boundary edges first.
    pub(crate) edges: IndexMap<EdgeId, EdgeUse>,
}

/// Validate the wiring of `nodes` against the graph boundary and derive a
/// topological order.
///
/// # Errors
/// Any [`TopologyError`] except `DuplicateNode` and `PipelineSource`, which
/// the graph checks itself.
pub(crate) fn plan(
    graph: &str,
    nodes: &[Arc<NodeSlot>],
    inputs: &[Edge],
    outputs: &[Edge],
) -> Result<Plan, TopologyError> {
    // Phase 1: Record producer and consumers of every edge.
    let mut edges: IndexMap<EdgeId, EdgeUse> = IndexMap::default();
    for edge in inputs.iter().chain(outputs) {
        EdgeUse::of(&mut edges, edge);
    }
    for (position, node) in nodes.iter().enumerate() {
        let mut seen = IndexSet::with_capacity_and_hasher(node.inputs.len(), FxBuildHasher);
        for edge in &node.inputs {
            if !seen.insert(edge.id()) {
                return Err(TopologyError::DuplicateInput {
                    node: node.name.clone(),
                    edge: edge.name().to_owned(),
                });
            }
            EdgeUse::of(&mut edges, edge).consumers.push(position);
        }
        for edge in &node.outputs {
            let usage = EdgeUse::of(&mut edges, edge);
            if let Some(first) = usage.producer {
                return Err(TopologyError::MultipleProducers {
                    edge: edge.name().to_owned(),
                    first: nodes[first].name.clone(),
                    second: node.name.clone(),
                });
            }
            usage.producer = Some(position);
        }
    }

    // Phase 2: Every edge needs a source and a sink at this level. Graph
    // inputs are fed from outside; graph outputs are read from outside.
    for usage in edges.values() {
        let is_input = inputs.contains(&usage.edge);
        let is_output = outputs.contains(&usage.edge);
        let edge = usage.edge.name().to_owned();
        match usage.producer {
            Some(producer) if is_input => {
                return Err(TopologyError::ProducedInput {
                    edge,
                    node: nodes[producer].name.clone(),
                });
            }
            Some(producer) if usage.consumers.is_empty() && !is_output => {
                return Err(TopologyError::DanglingEdge {
                    edge,
                    node: nodes[producer].name.clone(),
                });
            }
            None if is_input && usage.consumers.is_empty() && !is_output => {
                return Err(TopologyError::UnconsumedInput { edge });
            }
            None if !is_input => {
                return Err(match usage.consumers.first() {
                    Some(&consumer) => TopologyError::MissingProducer {
                        edge,
                        node: nodes[consumer].name.clone(),
                    },
                    None => TopologyError::UnproducedOutput { edge },
                });
            }
            _ => {}
        }
    }

    // Phase 3: Derive node dependencies from the edges.
    let mut parents: Vec<IndexSet<usize>> = vec![IndexSet::default(); nodes.len()];
    let mut children: Vec<IndexSet<usize>> = vec![IndexSet::default(); nodes.len()];
    for usage in edges.values() {
        let Some(producer) = usage.producer else {
            continue;
        };
        for &consumer in &usage.consumers {
            if consumer == producer {
                // A node reading its own output.
                return Err(TopologyError::Cycle {
                    graph: graph.to_owned(),
                });
            }
            parents[consumer].insert(producer);
            children[producer].insert(consumer);
        }
    }

    // Phase 4: Seed the order with roots (nodes without parents).
    let mut placed = vec![false; nodes.len()];
    let mut order: Vec<usize> = (0..nodes.len())
        .filter(|&position| parents[position].is_empty())
        .collect();
    if order.is_empty() && !nodes.is_empty() {
        // No independent nodes: every connected component is cyclic.
        return Err(TopologyError::Cycle {
            graph: graph.to_owned(),
        });
    }
    let num_roots = order.len();
    for &root in &order {
        placed[root] = true;
    }

    // Phase 5: Kahn-like processing with progress detection.
    //
    // A candidate is placed once all of its parents are placed, otherwise it
    // is deferred; a missing parent re-enqueues it when placed. If no
    // candidate gets placed for as many iterations as the queue held at the
    // last placement, the remaining nodes form a cycle.
    let mut pending_queue = VecDeque::with_capacity(nodes.len() - num_roots);
    let mut pending_set = IndexSet::with_capacity_and_hasher(nodes.len(), FxBuildHasher);
    for &root in &order {
        for &child in &children[root] {
            if pending_set.insert(child) {
                pending_queue.push_back(child);
            }
        }
    }
    let mut last_progress_iter = 0usize;
    let mut last_progress_queue_len = pending_queue.len();
    let mut iter = 0usize;

    'process_pending: while let Some(position) = pending_queue.pop_front() {
        let removed = pending_set.swap_remove(&position);
        assert!(removed, "graph::setup::plan: [1]");
        if iter - last_progress_iter >= last_progress_queue_len {
            return Err(TopologyError::Cycle {
                graph: graph.to_owned(),
            });
        }
        iter += 1;
        for &parent in &parents[position] {
            if !placed[parent] {
                // Deferred until the missing parent is placed.
                continue 'process_pending;
            }
        }
        placed[position] = true;
        order.push(position);
        for &child in &children[position] {
            if !placed[child] && pending_set.insert(child) {
                pending_queue.push_back(child);
            }
        }
        last_progress_iter = iter;
        last_progress_queue_len = pending_queue.len();
    }

    if order.len() != nodes.len() {
        // Some components were never reached from a root.
        return Err(TopologyError::Cycle {
            graph: graph.to_owned(),
        });
    }

    Ok(Plan {
        order,
        num_roots,
        children,
        parents,
        edges,
    })
}
