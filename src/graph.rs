mod execute;
mod pipeline;
mod setup;

/// Error returned by `Graph::init` when the provided node/edge membership is
/// invalid.
pub use crate::graph::setup::TopologyError;
use crate::{
    config::GraphConfig,
    device::Device,
    edge::{ConsumerId, Edge},
    error::{Error, Result, StateError},
    graph::{
        execute::{Boundary, TaskRuntime, run_sequential},
        pipeline::{PipelineRuntime, Ports},
    },
    node::{Node, NodeSlot, RunContext, Schedulable},
    payload::{Param, Payload},
    pool,
    sync::{Mutex, lock},
    types::{EdgeId, IndexMap, NodeId, ParallelType},
};
use std::{io, sync::Arc};
use tracing::{debug, info, warn};

/// A DAG of nodes connected by edges, itself usable as a node of an outer
/// graph.
///
/// Lifecycle:
/// - build: create edges, add nodes and subgraphs, pick a [`ParallelType`];
/// - `init`: validate the topology, bind a strategy to every edge, initialize
///   every member and start the workers;
/// - `run`/`submit`: execute once (Sequential, Task) or feed the running
///   pipeline (Pipeline);
/// - `deinit`: terminate the edges, join the workers, deinitialize members and
///   unbind the edges. A graph may be initialized again afterwards.
///
/// Dropping an initialized graph performs `deinit`.
#[must_use]
#[derive(Debug)]
pub struct Graph {
    id: NodeId,
    name: String,
    parallel_type: ParallelType,
    config: GraphConfig,
    device: Arc<dyn Device>,
    inputs: Vec<Edge>,
    outputs: Vec<Edge>,
    /// Edges created through [`Graph::create_edge`].
    edges: Vec<Edge>,
    nodes: Vec<Arc<NodeSlot>>,
    active: Option<Active>,
    /// Index the next [`Graph::submit`] writes under.
    next_index: u64,
}

/// State owned by an initialized graph.
#[derive(Debug)]
struct Active {
    runtime: Runtime,
    /// Node positions in topological order.
    order: Vec<usize>,
    /// Edges this graph bound and unbinds on deinit.
    bound: Vec<Edge>,
    /// Bound edges cleared before every Sequential or Task run.
    resettable: Vec<Edge>,
}

#[derive(Debug)]
enum Runtime {
    Sequential,
    Task(TaskRuntime),
    Pipeline(PipelineRuntime),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Role {
    /// Binds its boundary edges and is driven by the caller.
    Root,
    /// Driven by a composite node of the outer graph, which owns the
    /// boundary edges.
    Nested,
}

impl Graph {
    pub fn new(
        name: impl Into<String>,
        device: Arc<dyn Device>,
        inputs: impl IntoIterator<Item = Edge>,
        outputs: impl IntoIterator<Item = Edge>,
    ) -> Self {
        Self {
            id: NodeId::next(),
            name: name.into(),
            parallel_type: ParallelType::default(),
            config: GraphConfig::default(),
            device,
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
            edges: vec![],
            nodes: vec![],
            active: None,
            next_index: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn parallel_type(&self) -> ParallelType {
        self.parallel_type
    }

    #[must_use]
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Boundary input edges, in declaration order.
    #[must_use]
    pub fn inputs(&self) -> &[Edge] {
        &self.inputs
    }

    /// Boundary output edges, in declaration order.
    #[must_use]
    pub fn outputs(&self) -> &[Edge] {
        &self.outputs
    }

    /// Edges created through [`Graph::create_edge`].
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Names of the direct members, in insertion order.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|slot| slot.name.as_str())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.active.is_some()
    }

    fn ensure_uninitialized(&self) -> Result<()> {
        if self.active.is_some() {
            return Err(StateError::AlreadyInitialized(self.name.clone()).into());
        }
        Ok(())
    }

    /// # Errors
    /// [`StateError::AlreadyInitialized`].
    pub fn set_parallel_type(&mut self, parallel_type: ParallelType) -> Result<()> {
        self.ensure_uninitialized()?;
        self.parallel_type = parallel_type;
        Ok(())
    }

    /// # Errors
    /// [`StateError::AlreadyInitialized`].
    pub fn set_config(&mut self, config: GraphConfig) -> Result<()> {
        self.ensure_uninitialized()?;
        self.config = config;
        Ok(())
    }

    /// Create an edge owned by this graph.
    pub fn create_edge(&mut self, name: impl Into<String>) -> Edge {
        let edge = Edge::new(name);
        self.edges.push(edge.clone());
        edge
    }

    /// Add a leaf node reading `inputs` and writing `outputs`.
    ///
    /// # Errors
    /// [`StateError::AlreadyInitialized`] or [`TopologyError::DuplicateNode`].
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        inputs: &[&Edge],
        outputs: &[&Edge],
        node: impl Node + 'static,
    ) -> Result<NodeId> {
        self.push_slot(
            name.into(),
            inputs,
            outputs,
            None,
            Schedulable::Leaf(Box::new(node)),
        )
    }

    /// [`Graph::add_node`] with a parameter object the node reads through
    /// [`RunContext::param`].
    ///
    /// # Errors
    /// See [`Graph::add_node`].
    pub fn add_node_with_param(
        &mut self,
        name: impl Into<String>,
        inputs: &[&Edge],
        outputs: &[&Edge],
        node: impl Node + 'static,
        param: impl Param,
    ) -> Result<NodeId> {
        self.push_slot(
            name.into(),
            inputs,
            outputs,
            Some(Arc::new(param)),
            Schedulable::Leaf(Box::new(node)),
        )
    }

    /// Add `graph` as a composite node; its boundary edges become the node's
    /// inputs and outputs.
    ///
    /// # Errors
    /// See [`Graph::add_node`]; also fails if `graph` is initialized.
    pub fn add_subgraph(&mut self, graph: Graph) -> Result<NodeId> {
        graph.ensure_uninitialized()?;
        self.insert(NodeSlot {
            id: graph.id,
            name: graph.name.clone(),
            inputs: graph.inputs.clone(),
            outputs: graph.outputs.clone(),
            param: None,
            body: Mutex::new(Schedulable::Graph(Box::new(graph))),
        })
    }

    fn push_slot(
        &mut self,
        name: String,
        inputs: &[&Edge],
        outputs: &[&Edge],
        param: Option<Arc<dyn Param>>,
        body: Schedulable,
    ) -> Result<NodeId> {
        self.insert(NodeSlot {
            id: NodeId::next(),
            name,
            inputs: inputs.iter().copied().cloned().collect(),
            outputs: outputs.iter().copied().cloned().collect(),
            param,
            body: Mutex::new(body),
        })
    }

    fn insert(&mut self, slot: NodeSlot) -> Result<NodeId> {
        self.ensure_uninitialized()?;
        if self.nodes.iter().any(|other| other.name == slot.name) {
            return Err(TopologyError::DuplicateNode(slot.name).into());
        }
        let id = slot.id;
        self.nodes.push(Arc::new(slot));
        Ok(id)
    }

    /// Validate the topology, bind every edge, initialize every member and
    /// start the workers.
    ///
    /// On failure everything done so far is rolled back.
    ///
    /// # Errors
    /// [`StateError::AlreadyInitialized`], any [`TopologyError`], an edge
    /// already bound elsewhere, or the first failing member `init`.
    pub fn init(&mut self) -> Result<()> {
        self.init_as(Role::Root)
    }

    pub(crate) fn init_nested(&mut self) -> Result<()> {
        self.init_as(Role::Nested)
    }

    fn init_as(&mut self, role: Role) -> Result<()> {
        self.ensure_uninitialized()?;
        let parallel_type = self.parallel_type.resolve();
        let plan = setup::plan(&self.name, &self.nodes, &self.inputs, &self.outputs)?;
        if parallel_type == ParallelType::Pipeline {
            if let Some(slot) = self.nodes.iter().find(|slot| slot.inputs.is_empty()) {
                return Err(TopologyError::PipelineSource(slot.name.clone()).into());
            }
        }

        let mut bound = Vec::with_capacity(plan.edges.len());
        for usage in plan.edges.values() {
            let is_output = self.outputs.contains(&usage.edge);
            if role == Role::Nested && (is_output || self.inputs.contains(&usage.edge)) {
                continue;
            }
            let consumers = usage
                .consumers
                .iter()
                .map(|&position| ConsumerId::Node(self.nodes[position].id))
                .chain(is_output.then_some(ConsumerId::GraphOutput));
            if let Err(error) = usage.edge.bind(parallel_type, consumers) {
                self.rollback(&[], &bound);
                return Err(error);
            }
            bound.push(usage.edge.clone());
        }
        let ports = (role == Role::Nested && parallel_type == ParallelType::Pipeline)
            .then(|| Ports::new(&self.inputs, &self.outputs));
        for (id, port) in ports.iter().flat_map(Ports::iter) {
            let readers = plan.edges.get(&id).map_or(&[][..], |usage| usage.consumers.as_slice());
            let is_output = self.outputs.iter().any(|edge| edge.id() == id);
            let consumers = readers
                .iter()
                .map(|&position| ConsumerId::Node(self.nodes[position].id))
                .chain(is_output.then_some(ConsumerId::GraphOutput));
            if let Err(error) = port.bind(parallel_type, consumers) {
                self.rollback(&[], &bound);
                return Err(error);
            }
            bound.push(port.clone());
        }

        for (done, &position) in plan.order.iter().enumerate() {
            if let Err(error) = self.nodes[position].init() {
                self.rollback(&plan.order[..done], &bound);
                return Err(error);
            }
        }

        let runtime = match parallel_type {
            ParallelType::Task => pool::build(&self.config, &self.name, 1)
                .map(|pool| Runtime::Task(TaskRuntime::new(&plan, pool))),
            ParallelType::Pipeline => {
                PipelineRuntime::start(&self.name, &self.nodes, &self.device, &self.config, ports)
                    .map(Runtime::Pipeline)
            }
            ParallelType::None | ParallelType::Sequential => Ok(Runtime::Sequential),
        };
        let runtime = match runtime {
            Ok(runtime) => runtime,
            Err(error) => {
                self.rollback(&plan.order, &bound);
                return Err(error);
            }
        };

        let resettable = bound
            .iter()
            .filter(|&edge| !self.inputs.contains(edge))
            .cloned()
            .collect();
        info!(
            graph = %self.name,
            %parallel_type,
            nodes = self.nodes.len(),
            edges = bound.len(),
            "graph initialized"
        );
        self.active = Some(Active {
            runtime,
            order: plan.order,
            bound,
            resettable,
        });
        Ok(())
    }

    fn rollback(&self, initialized: &[usize], bound: &[Edge]) {
        for &position in initialized.iter().rev() {
            if let Err(error) = self.nodes[position].deinit() {
                warn!(graph = %self.name, %error, "deinit during rollback failed");
            }
        }
        for edge in bound {
            edge.unbind();
        }
    }

    fn active(&self) -> Result<&Active> {
        self.active
            .as_ref()
            .ok_or_else(|| StateError::NotInitialized(self.name.clone()).into())
    }

    /// Execute the graph once over the values currently on its inputs.
    ///
    /// Sequential and Task graphs run every node once and return the first
    /// failure. A Pipeline graph is already running; feed it by writing to its
    /// input edges (or through [`Graph::submit`]) and drain its outputs.
    ///
    /// # Errors
    /// [`StateError::NotInitialized`], [`Error::NoData`] for an unwritten
    /// input, or the first failing node.
    pub fn run(&mut self) -> Result<()> {
        if matches!(self.active()?.runtime, Runtime::Pipeline(_)) {
            return Ok(());
        }
        if let Some(edge) = self.inputs.iter().find(|edge| edge.last_index().is_none()) {
            return Err(Error::NoData {
                edge: edge.name().to_owned(),
            });
        }
        let index = match self.inputs.iter().filter_map(Edge::last_index).max() {
            Some(index) => index,
            None => {
                // Source-only graph: every run is a new index.
                let index = self.next_index;
                self.next_index += 1;
                index
            }
        };
        self.execute(&Boundary::root(index))
    }

    /// Write one payload per input edge under a fresh sequence index, then
    /// [`Graph::run`]. Returns the index.
    ///
    /// # Errors
    /// [`StateError::InputCount`], any write error, or the errors of
    /// [`Graph::run`].
    pub fn submit<I>(&mut self, inputs: I) -> Result<u64>
    where
        I: IntoIterator,
        I::Item: Into<Arc<Payload>>,
    {
        self.active()?;
        let payloads: Vec<Arc<Payload>> = inputs.into_iter().map(Into::into).collect();
        if payloads.len() != self.inputs.len() {
            return Err(StateError::InputCount {
                graph: self.name.clone(),
                expected: self.inputs.len(),
                found: payloads.len(),
            }
            .into());
        }
        let index = self
            .inputs
            .iter()
            .filter_map(Edge::last_index)
            .map(|last| last + 1)
            .fold(self.next_index, u64::max);
        for (edge, payload) in self.inputs.iter().zip(payloads) {
            edge.set(payload, index)?;
        }
        self.next_index = index + 1;
        self.run()?;
        Ok(index)
    }

    /// Run as the body of a composite node of an outer graph.
    pub(crate) fn run_nested(&self, ctx: &RunContext<'_>) -> Result<()> {
        if let Runtime::Pipeline(runtime) = &self.active()?.runtime {
            if let Some(ports) = runtime.ports() {
                return ports.relay(&self.inputs, &self.outputs, ctx.received(), ctx.index());
            }
        }
        let boundary = Boundary::nested(ctx.index(), self.inputs.iter().zip(ctx.received()));
        self.execute(&boundary)
    }

    fn execute(&self, boundary: &Boundary) -> Result<()> {
        let active = self.active()?;
        if matches!(active.runtime, Runtime::Pipeline(_)) {
            return Ok(());
        }
        for edge in &active.resettable {
            edge.clear();
        }
        match &active.runtime {
            Runtime::Sequential => run_sequential(&self.nodes, &active.order, boundary, &self.device),
            Runtime::Task(runtime) => runtime.run(&self.nodes, boundary, &self.device),
            Runtime::Pipeline(_) => Ok(()),
        }
    }

    /// Terminate every edge, join the workers, deinitialize every member and
    /// unbind the edges.
    ///
    /// Readers blocked on the graph's edges (including callers draining graph
    /// outputs) wake up with [`Error::Terminated`].
    ///
    /// # Errors
    /// [`StateError::NotInitialized`], or the first failing member `deinit`;
    /// the remaining members are deinitialized regardless.
    pub fn deinit(&mut self) -> Result<()> {
        let active = self
            .active
            .take()
            .ok_or_else(|| StateError::NotInitialized(self.name.clone()))?;
        self.shutdown(active)
    }

    fn shutdown(&self, active: Active) -> Result<()> {
        let Active {
            runtime,
            order,
            bound,
            ..
        } = active;
        for edge in &bound {
            edge.request_terminate();
        }
        if let Runtime::Pipeline(runtime) = runtime {
            runtime.join();
        }
        let mut first_error = None;
        for &position in order.iter().rev() {
            if let Err(error) = self.nodes[position].deinit() {
                warn!(graph = %self.name, %error, "member deinit failed");
                first_error.get_or_insert(error);
            }
        }
        for edge in &bound {
            edge.unbind();
        }
        debug!(graph = %self.name, "graph deinitialized");
        first_error.map_or(Ok(()), Err)
    }

    /// Write the graph as a Graphviz DOT document.
    ///
    /// Nodes are boxes, edges are ellipses, nested graphs are clusters.
    /// Blocks while a member is running, so dump a pipeline before `init` or
    /// after `deinit`.
    ///
    /// # Errors
    /// I/O errors of `out`.
    pub fn dump(&self, out: &mut impl io::Write) -> io::Result<()> {
        writeln!(out, "digraph \"{}\" {{", self.name)?;
        writeln!(out, "  label=\"{} ({})\";", self.name, self.parallel_type)?;
        let mut edges = IndexMap::default();
        self.collect_edges(&mut edges);
        for (id, name) in &edges {
            writeln!(out, "  {id} [shape=ellipse, label=\"{name}\"];")?;
        }
        self.dump_members(out, 1)?;
        writeln!(out, "}}")
    }

    fn collect_edges(&self, edges: &mut IndexMap<EdgeId, String>) {
        let boundary = self.inputs.iter().chain(&self.outputs).chain(&self.edges);
        for edge in boundary {
            edges.entry(edge.id()).or_insert_with(|| edge.name().to_owned());
        }
        for slot in &self.nodes {
            for edge in slot.inputs.iter().chain(&slot.outputs) {
                edges.entry(edge.id()).or_insert_with(|| edge.name().to_owned());
            }
            if let Schedulable::Graph(graph) = &*lock(&slot.body) {
                graph.collect_edges(edges);
            }
        }
    }

    fn dump_members(&self, out: &mut dyn io::Write, depth: usize) -> io::Result<()> {
        let pad = "  ".repeat(depth);
        for slot in &self.nodes {
            match &*lock(&slot.body) {
                Schedulable::Graph(graph) => {
                    writeln!(out, "{pad}subgraph cluster_{} {{", slot.id.get())?;
                    writeln!(out, "{pad}  label=\"{} ({})\";", graph.name, graph.parallel_type)?;
                    graph.dump_members(out, depth + 1)?;
                    writeln!(out, "{pad}}}")?;
                }
                Schedulable::Leaf(_) => {
                    let id = slot.id.get();
                    writeln!(out, "{pad}n{id} [shape=box, label=\"{}\"];", slot.name)?;
                    for edge in &slot.inputs {
                        writeln!(out, "{pad}{} -> n{id};", edge.id())?;
                    }
                    for edge in &slot.outputs {
                        writeln!(out, "{pad}n{id} -> {};", edge.id())?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            warn!(graph = %self.name, "graph dropped while initialized");
            if let Err(error) = self.shutdown(active) {
                warn!(graph = %self.name, %error, "shutdown on drop failed");
            }
        }
    }
}
