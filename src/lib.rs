//! DAG executor with sequential, task-parallel and pipelined scheduling.
//!
//! A [`graph::Graph`] is a set of nodes connected by typed edges. Every graph
//! (and independently every nested subgraph) picks one discipline:
//! - `Sequential`: nodes run once per `run`, in topological order, on the
//!   calling thread.
//! - `Task`: nodes run once per `run` on a worker pool as soon as their
//!   producers are done. Children with a single parent run right after it in
//!   the same task; children with several parents are released by a counter
//!   guarded with Release/Acquire fences.
//! - `Pipeline`: every node is a persistent loop on its own worker, so
//!   consecutive stages work on different sequence indices at the same time.
//!   Edges keep a reference-counted backlog of versioned packets with one
//!   cursor per consumer, and a packet is freed once every consumer has moved
//!   past it.
//!
//! Key modules:
//! - `graph`: construction, topology validation and the lifecycle
//!   (`init`/`run`/`submit`/`deinit`).
//! - `node`: the `Node` trait and the `RunContext` a node runs against.
//! - `edge`: the `Edge` handle and its per-discipline strategies.
//! - `payload`/`device`: what travels over edges and where it is allocated.
//!
//! Quick start:
//! 1. Create a `Graph` with a device and its boundary edges.
//! 2. Add nodes with `add_node`, or whole graphs with `add_subgraph`.
//! 3. Pick a `ParallelType`, call `init`, then `submit` inputs and read
//!    outputs with `Edge::graph_output`.
//! 4. Call `deinit` (or drop the graph) to stop the workers.

/// Runtime settings of a graph (worker count and thread naming).
pub mod config;
/// Memory descriptors, host allocations and the `Device` abstraction.
///
/// A device turns a `Descriptor` into a `Payload`. `HostDevice` allocates on
/// the heap and optionally caps allocation size.
pub mod device;
/// Typed single-producer, multi-consumer channels between nodes.
///
/// The strategy behind an `Edge` is bound by the owning graph at `init`:
/// a direct slot for Sequential graphs, a blocking slot for Task graphs and a
/// versioned, reference-counted backlog for Pipeline graphs.
pub mod edge;
/// Error types returned by the crate.
pub mod error;
/// Graphs: construction, validation, scheduling and lifecycle.
///
/// Contains topology planning (producer/consumer checks, cycle detection,
/// topological order) and the three schedulers.
pub mod graph;
/// The `Node` trait, closure nodes and the per-invocation `RunContext`.
pub mod node;
/// Versioned packets as handed to consumers.
pub mod packet;
/// Values carried over edges: buffers, images, tensors, parameter objects and
/// opaque values.
pub mod payload;
mod pool;
mod sync;
/// Identifiers and the `ParallelType` discipline selector.
pub mod types;
