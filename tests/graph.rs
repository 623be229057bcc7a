#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use core::num::NonZeroUsize;
use cpg::{
    config::GraphConfig,
    device::{DataType, Descriptor, Device, DeviceError, HostDevice, TensorDesc},
    edge::Edge,
    error::{Error, StateError},
    graph::{Graph, TopologyError},
    node::{FnNode, Node, NodeError, RunContext},
    payload::{Payload, PayloadKind},
    types::ParallelType,
};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

fn host() -> Arc<dyn Device> {
    Arc::new(HostDevice::new())
}

fn num(payload: &Payload) -> i64 {
    *payload.as_opaque::<i64>().expect("i64 payload")
}

/// Node writing `f(input 0)` to output 0.
fn map(
    f: impl Fn(i64) -> i64 + Send + 'static,
) -> FnNode<impl FnMut(&mut RunContext<'_>) -> Result<(), NodeError> + Send> {
    FnNode::new(move |ctx: &mut RunContext<'_>| {
        let value = f(num(ctx.input(0)?));
        ctx.set_output(0, Payload::opaque(value))
    })
}

/// Node writing the sum of all inputs to output 0.
fn sum() -> FnNode<impl FnMut(&mut RunContext<'_>) -> Result<(), NodeError> + Send> {
    FnNode::new(|ctx: &mut RunContext<'_>| {
        let mut total = 0;
        for position in 0..ctx.num_inputs() {
            total += num(ctx.input(position)?);
        }
        ctx.set_output(0, Payload::opaque(total))
    })
}

fn threads(n: usize) -> GraphConfig {
    GraphConfig::default().with_num_threads(NonZeroUsize::new(n).unwrap())
}

#[test]
fn rejects_cycles_and_accepts_dags() {
    // in -> a -> x -> b -> out
    //       ^         |
    //       +--- y ---+
    let (input, x, y, out) = (Edge::new("in"), Edge::new("x"), Edge::new("y"), Edge::new("out"));
    let mut graph = Graph::new("cyclic", host(), [input.clone()], [out.clone()]);
    graph.add_node("a", &[&input, &y], &[&x], sum()).unwrap();
    graph.add_node("b", &[&x], &[&y, &out], map(|v| v)).unwrap();
    assert_eq!(
        graph.init().unwrap_err(),
        Error::Topology(TopologyError::Cycle {
            graph: "cyclic".into()
        })
    );
    assert!(!graph.is_initialized());
    assert!(!input.is_bound());

    let mut graph = Graph::new("dag", host(), [input.clone()], [out.clone()]);
    graph.add_node("a", &[&input], &[&x], map(|v| v)).unwrap();
    graph.add_node("b", &[&x], &[&out], map(|v| v)).unwrap();
    graph.init().unwrap();
    assert!(graph.is_initialized());
    graph.deinit().unwrap();
}

#[test]
fn reports_wiring_errors() {
    let (input, x, out) = (Edge::new("in"), Edge::new("x"), Edge::new("out"));

    let mut graph = Graph::new("missing", host(), [input.clone()], [out.clone()]);
    graph.add_node("a", &[&input, &x], &[&out], sum()).unwrap();
    assert_eq!(
        graph.init().unwrap_err(),
        Error::Topology(TopologyError::MissingProducer {
            edge: "x".into(),
            node: "a".into()
        })
    );

    let mut graph = Graph::new("dangling", host(), [input.clone()], [out.clone()]);
    graph
        .add_node("a", &[&input], &[&out, &x], map(|v| v))
        .unwrap();
    assert!(matches!(
        graph.init(),
        Err(Error::Topology(TopologyError::DanglingEdge { .. }))
    ));

    let mut graph = Graph::new("dup", host(), [input.clone()], [out.clone()]);
    graph.add_node("a", &[&input], &[&out], map(|v| v)).unwrap();
    assert_eq!(
        graph.add_node("a", &[&input], &[&x], map(|v| v)).unwrap_err(),
        Error::Topology(TopologyError::DuplicateNode("a".into()))
    );

    // Nobody would ever release the packets written to `unused`.
    let unused = Edge::new("unused");
    let mut graph = Graph::new(
        "unconsumed",
        host(),
        [input.clone(), unused.clone()],
        [out.clone()],
    );
    graph.add_node("a", &[&input], &[&out], map(|v| v)).unwrap();
    graph.set_parallel_type(ParallelType::Pipeline).unwrap();
    assert_eq!(
        graph.init().unwrap_err(),
        Error::Topology(TopologyError::UnconsumedInput {
            edge: "unused".into()
        })
    );
    assert!(!input.is_bound() && !unused.is_bound());

    let mut graph = Graph::new("source", host(), [], [out.clone()]);
    let generate =
        FnNode::new(|ctx: &mut RunContext<'_>| ctx.set_output(0, Payload::opaque(1i64)));
    graph.add_node("gen", &[], &[&out], generate).unwrap();
    graph.set_parallel_type(ParallelType::Pipeline).unwrap();
    assert_eq!(
        graph.init().unwrap_err(),
        Error::Topology(TopologyError::PipelineSource("gen".into()))
    );
}

#[test]
fn lifecycle_is_enforced() {
    let (input, out) = (Edge::new("in"), Edge::new("out"));
    let mut graph = Graph::new("life", host(), [input.clone()], [out.clone()]);
    graph.add_node("a", &[&input], &[&out], map(|v| v + 1)).unwrap();

    assert_eq!(
        graph.run().unwrap_err(),
        Error::State(StateError::NotInitialized("life".into()))
    );
    assert!(matches!(
        graph.deinit(),
        Err(Error::State(StateError::NotInitialized(_)))
    ));

    graph.init().unwrap();
    assert!(matches!(
        graph.init(),
        Err(Error::State(StateError::AlreadyInitialized(_)))
    ));
    assert!(matches!(
        graph.add_node("b", &[&out], &[], map(|v| v)),
        Err(Error::State(StateError::AlreadyInitialized(_)))
    ));
    assert!(matches!(
        graph.set_parallel_type(ParallelType::Task),
        Err(Error::State(StateError::AlreadyInitialized(_)))
    ));
    // Nothing written on the input yet.
    assert!(matches!(graph.run(), Err(Error::NoData { .. })));
    assert_eq!(
        graph.submit(Vec::<Payload>::new()).unwrap_err(),
        Error::State(StateError::InputCount {
            graph: "life".into(),
            expected: 1,
            found: 0
        })
    );

    graph.deinit().unwrap();
    assert!(!input.is_bound() && !out.is_bound());

    // A deinitialized graph can be initialized again, under another discipline.
    graph.set_parallel_type(ParallelType::Task).unwrap();
    graph.init().unwrap();
    graph.submit([Payload::opaque(1i64)]).unwrap();
    assert_eq!(num(&out.graph_output().unwrap()), 2);
    graph.deinit().unwrap();
}

#[test]
fn sequential_chain_composes_in_topological_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let edges: Vec<Edge> = (0..=5).map(|i| Edge::new(format!("e{i}"))).collect();
    let transforms: [fn(i64) -> i64; 5] = [
        |v| v + 1,
        |v| v * 2,
        |v| v - 3,
        |v| v * 10,
        |v| v + 7,
    ];
    let mut graph = Graph::new("chain", host(), [edges[0].clone()], [edges[5].clone()]);
    // Added in reverse so the order has to come from the topology.
    for stage in (0..5).rev() {
        let log = Arc::clone(&log);
        let f = transforms[stage];
        let node = FnNode::new(move |ctx: &mut RunContext<'_>| {
            log.lock().unwrap().push(stage);
            let value = f(num(ctx.input(0)?));
            ctx.set_output(0, Payload::opaque(value))
        });
        graph
            .add_node(format!("s{stage}"), &[&edges[stage]], &[&edges[stage + 1]], node)
            .unwrap();
    }
    graph.init().unwrap();

    for input in [4i64, -2, 100] {
        log.lock().unwrap().clear();
        let index = graph.submit([Payload::opaque(input)]).unwrap();
        let expected = transforms.iter().fold(input, |v, f| f(v));
        let view = edges[5].graph_output_packet(None).unwrap();
        assert_eq!(view.index(), index);
        assert_eq!(num(view.payload().unwrap()), expected);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
    graph.deinit().unwrap();
}

#[test]
fn task_diamond_joins_both_branches() {
    //      in
    //     /  \
    //    a    b
    //     \  /
    //      c
    let (input, left, right, out) = (
        Edge::new("in"),
        Edge::new("left"),
        Edge::new("right"),
        Edge::new("out"),
    );
    let mut graph = Graph::new("diamond", host(), [input.clone()], [out.clone()]);
    graph.add_node("c", &[&left, &right], &[&out], sum()).unwrap();
    graph.add_node("a", &[&input], &[&left], map(|v| v + 1)).unwrap();
    graph.add_node("b", &[&input], &[&right], map(|v| v * 2)).unwrap();
    graph.set_parallel_type(ParallelType::Task).unwrap();
    graph.set_config(threads(4)).unwrap();
    graph.init().unwrap();

    for x in 0..50i64 {
        graph.submit([Payload::opaque(x)]).unwrap();
        assert_eq!(num(&out.graph_output().unwrap()), (x + 1) + x * 2);
    }
    graph.deinit().unwrap();
}

#[test]
fn task_failure_aborts_the_rest_of_the_run() {
    let (input, x, y, out) = (Edge::new("in"), Edge::new("x"), Edge::new("y"), Edge::new("out"));
    let downstream_runs = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::new("abort", host(), [input.clone()], [out.clone()]);
    graph.add_node("a", &[&input], &[&x], map(|v| v)).unwrap();
    graph
        .add_node(
            "b",
            &[&x],
            &[&y],
            FnNode::new(|_| Err(NodeError::with_status(7, "boom"))),
        )
        .unwrap();
    let runs = Arc::clone(&downstream_runs);
    graph
        .add_node(
            "c",
            &[&y],
            &[&out],
            FnNode::new(move |ctx: &mut RunContext<'_>| {
                runs.fetch_add(1, Ordering::SeqCst);
                ctx.set_output(0, Payload::opaque(0i64))
            }),
        )
        .unwrap();
    graph.set_parallel_type(ParallelType::Task).unwrap();
    graph.init().unwrap();

    let Err(Error::NodeExecution {
        node,
        index,
        source,
    }) = graph.submit([Payload::opaque(1i64)])
    else {
        panic!("expected a node failure");
    };
    assert_eq!(node, "b");
    assert_eq!(index, Some(0));
    assert_eq!(source.status(), 7);
    assert_eq!(source.message(), "boom");
    assert_eq!(downstream_runs.load(Ordering::SeqCst), 0);
    graph.deinit().unwrap();
}

#[test]
fn task_output_left_unwritten_does_not_block_readers() {
    let (input, x, out) = (Edge::new("in"), Edge::new("x"), Edge::new("out"));
    let mut graph = Graph::new("unwritten", host(), [input.clone()], [out.clone()]);
    graph
        .add_node("a", &[&input], &[&x], FnNode::new(|_| Ok(())))
        .unwrap();
    graph.add_node("b", &[&x], &[&out], map(|v| v)).unwrap();
    graph.set_parallel_type(ParallelType::Task).unwrap();
    graph.set_config(threads(2)).unwrap();
    graph.init().unwrap();

    let error = graph.submit([Payload::opaque(1i64)]).unwrap_err();
    let Error::NodeExecution { node, source, .. } = &error else {
        panic!("unexpected {error:?}");
    };
    assert_eq!(node, "a");
    assert!(source.message().contains("`x` was not written"), "{source}");
    assert_eq!(out.graph_output().unwrap_err(), error);
    graph.deinit().unwrap();
}

#[test]
fn sequential_run_never_reuses_a_previous_value() {
    // in -> a -> mid -> b -> out; `a` only writes on its first invocation.
    let (input, mid, out) = (Edge::new("in"), Edge::new("mid"), Edge::new("out"));
    let calls = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::new("stale", host(), [input.clone()], [out.clone()]);
    let seen = Arc::clone(&calls);
    let once = FnNode::new(move |ctx: &mut RunContext<'_>| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            ctx.set_output(0, Payload::opaque(num(ctx.input(0)?) * 10))?;
        }
        Ok(())
    });
    graph.add_node("a", &[&input], &[&mid], once).unwrap();
    graph.add_node("b", &[&mid], &[&out], map(|v| v)).unwrap();
    graph.init().unwrap();

    assert_eq!(graph.submit([Payload::opaque(1i64)]).unwrap(), 0);
    assert_eq!(num(&out.graph_output().unwrap()), 10);

    let error = graph.submit([Payload::opaque(2i64)]).unwrap_err();
    let Error::NodeExecution { node, index, source } = &error else {
        panic!("unexpected {error:?}");
    };
    assert_eq!(node, "a");
    assert_eq!(*index, Some(1));
    assert!(source.message().contains("`mid` was not written"), "{source}");
    // Run 0's value is gone from the output.
    assert_eq!(out.graph_output().unwrap_err(), error);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    graph.deinit().unwrap();
}

#[test]
fn panicking_node_is_reported_as_failure() {
    let (input, out) = (Edge::new("in"), Edge::new("out"));
    let mut graph = Graph::new("panic", host(), [input.clone()], [out.clone()]);
    graph
        .add_node(
            "p",
            &[&input],
            &[&out],
            FnNode::new(|_: &mut RunContext<'_>| -> Result<(), NodeError> { panic!("kaput") }),
        )
        .unwrap();
    graph.init().unwrap();
    match graph.submit([Payload::opaque(0i64)]) {
        Err(Error::NodeExecution { node, source, .. }) => {
            assert_eq!(node, "p");
            assert!(source.message().contains("kaput"), "{source}");
        }
        other => panic!("unexpected {other:?}"),
    }
    graph.deinit().unwrap();
}

#[test]
fn nested_subgraphs_run_with_their_own_discipline() {
    // outer (Task):
    //   in -> [seq: s1 -> s2] -> m --\
    //   in -> [task: k1, k2 -> k3] -> n --> join -> out
    let input = Edge::new("in");
    let (m, n, out) = (Edge::new("m"), Edge::new("n"), Edge::new("out"));

    let mut seq = Graph::new("seq", host(), [input.clone()], [m.clone()]);
    let t = seq.create_edge("t");
    seq.add_node("s1", &[&input], &[&t], map(|v| v + 1)).unwrap();
    seq.add_node("s2", &[&t], &[&m], map(|v| v * 3)).unwrap();
    seq.set_parallel_type(ParallelType::Sequential).unwrap();

    let mut task = Graph::new("task", host(), [input.clone()], [n.clone()]);
    let (u, v) = (task.create_edge("u"), task.create_edge("v"));
    task.add_node("k1", &[&input], &[&u], map(|x| x * 2)).unwrap();
    task.add_node("k2", &[&input], &[&v], map(|x| x + 5)).unwrap();
    task.add_node("k3", &[&u, &v], &[&n], sum()).unwrap();
    task.set_parallel_type(ParallelType::Task).unwrap();
    task.set_config(threads(2)).unwrap();

    let mut outer = Graph::new("outer", host(), [input.clone()], [out.clone()]);
    outer.add_subgraph(seq).unwrap();
    outer.add_subgraph(task).unwrap();
    outer.add_node("join", &[&m, &n], &[&out], sum()).unwrap();
    outer.set_parallel_type(ParallelType::Task).unwrap();
    outer.init().unwrap();
    assert_eq!(input.parallel_type(), Some(ParallelType::Task));
    assert_eq!(m.parallel_type(), Some(ParallelType::Task));

    for x in [1i64, 10] {
        outer.submit([Payload::opaque(x)]).unwrap();
        let expected = (x + 1) * 3 + (x * 2 + x + 5);
        assert_eq!(num(&out.graph_output().unwrap()), expected);
    }
    outer.deinit().unwrap();
    assert!(!m.is_bound());
}

#[test]
fn nested_pipeline_relays_each_invocation() {
    // outer (Sequential):
    //   in -> pre -> mid -> [inner (Pipeline): a -> t -> b] -> out
    let (input, mid, out) = (Edge::new("in"), Edge::new("mid"), Edge::new("out"));
    let mut inner = Graph::new("inner", host(), [mid.clone()], [out.clone()]);
    let t = inner.create_edge("t");
    let double = FnNode::new(|ctx: &mut RunContext<'_>| {
        let value = num(ctx.input(0)?);
        if value < 0 {
            return Err(NodeError::new("negative"));
        }
        ctx.set_output(0, Payload::opaque(value * 2))
    });
    inner.add_node("a", &[&mid], &[&t], double).unwrap();
    inner.add_node("b", &[&t], &[&out], map(|v| v + 3)).unwrap();
    inner.set_parallel_type(ParallelType::Pipeline).unwrap();

    let mut outer = Graph::new("outer", host(), [input.clone()], [out.clone()]);
    outer.add_node("pre", &[&input], &[&mid], map(|v| v + 1)).unwrap();
    outer.add_subgraph(inner).unwrap();
    outer.init().unwrap();
    // The boundary keeps the outer discipline.
    assert_eq!(mid.parallel_type(), Some(ParallelType::Sequential));
    assert_eq!(t.parallel_type(), Some(ParallelType::Pipeline));

    for x in [1i64, 5] {
        let index = outer.submit([Payload::opaque(x)]).unwrap();
        let view = out.graph_output_packet(None).unwrap();
        assert_eq!(view.index(), index);
        assert_eq!(num(view.payload().unwrap()), (x + 1) * 2 + 3);
    }

    // A failure inside the pipeline fails the composite invocation only.
    match outer.submit([Payload::opaque(-10i64)]) {
        Err(Error::NodeExecution { node, source, .. }) => {
            assert_eq!(node, "a");
            assert_eq!(source.message(), "negative");
        }
        other => panic!("unexpected {other:?}"),
    }
    outer.submit([Payload::opaque(2i64)]).unwrap();
    assert_eq!(num(&out.graph_output().unwrap()), 9);

    outer.deinit().unwrap();
    assert!(!mid.is_bound() && !t.is_bound() && !out.is_bound());
}

#[derive(Debug)]
struct Tracked {
    name: &'static str,
    fail_init: bool,
    events: Arc<Mutex<Vec<String>>>,
}

impl Node for Tracked {
    fn init(&mut self) -> Result<(), NodeError> {
        self.events.lock().unwrap().push(format!("init {}", self.name));
        if self.fail_init {
            return Err(NodeError::new("no resources"));
        }
        Ok(())
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<(), NodeError> {
        let value = num(ctx.input(0)?);
        ctx.set_output(0, Payload::opaque(value))
    }

    fn deinit(&mut self) -> Result<(), NodeError> {
        self.events.lock().unwrap().push(format!("deinit {}", self.name));
        Ok(())
    }
}

#[test]
fn failed_init_rolls_back() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (input, x, out) = (Edge::new("in"), Edge::new("x"), Edge::new("out"));
    let mut graph = Graph::new("rollback", host(), [input.clone()], [out.clone()]);
    let tracked = |name, fail_init| Tracked {
        name,
        fail_init,
        events: Arc::clone(&events),
    };
    graph.add_node("a", &[&input], &[&x], tracked("a", false)).unwrap();
    graph.add_node("b", &[&x], &[&out], tracked("b", true)).unwrap();

    assert!(matches!(
        graph.init(),
        Err(Error::NodeExecution { ref node, index: None, .. }) if node == "b"
    ));
    assert_eq!(*events.lock().unwrap(), ["init a", "init b", "deinit a"]);
    assert!(!input.is_bound() && !x.is_bound() && !out.is_bound());
}

#[test]
fn deinit_runs_in_reverse_topological_order() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (input, x, out) = (Edge::new("in"), Edge::new("x"), Edge::new("out"));
    let mut graph = Graph::new("order", host(), [input.clone()], [out.clone()]);
    let tracked = |name| Tracked {
        name,
        fail_init: false,
        events: Arc::clone(&events),
    };
    graph.add_node("b", &[&x], &[&out], tracked("b")).unwrap();
    graph.add_node("a", &[&input], &[&x], tracked("a")).unwrap();
    graph.init().unwrap();
    graph.deinit().unwrap();
    assert_eq!(
        *events.lock().unwrap(),
        ["init a", "init b", "deinit b", "deinit a"]
    );
}

#[test]
fn edge_cannot_be_bound_by_two_graphs() {
    let (input, out) = (Edge::new("in"), Edge::new("out"));
    let mut first = Graph::new("first", host(), [input.clone()], [out.clone()]);
    first.add_node("a", &[&input], &[&out], map(|v| v)).unwrap();
    let mut second = Graph::new("second", host(), [input.clone()], [out.clone()]);
    second.add_node("a", &[&input], &[&out], map(|v| v)).unwrap();

    first.init().unwrap();
    assert_eq!(
        second.init().unwrap_err(),
        Error::State(StateError::AlreadyBound("in".into()))
    );
    // The failed init must not unbind what the first graph owns.
    assert!(input.is_bound());
    first.deinit().unwrap();
    second.init().unwrap();
    second.deinit().unwrap();
}

#[derive(Debug)]
struct Scale {
    factor: i64,
}

#[test]
fn node_reads_its_param() {
    let (input, out) = (Edge::new("in"), Edge::new("out"));
    let mut graph = Graph::new("param", host(), [input.clone()], [out.clone()]);
    graph
        .add_node_with_param(
            "scale",
            &[&input],
            &[&out],
            FnNode::new(|ctx: &mut RunContext<'_>| {
                let factor = ctx
                    .param::<Scale>()
                    .ok_or_else(|| NodeError::new("missing param"))?
                    .factor;
                assert!(ctx.param::<String>().is_none());
                let value = num(ctx.input(0)?) * factor;
                ctx.set_output(0, Payload::opaque(value))
            }),
            Scale { factor: 3 },
        )
        .unwrap();
    graph.init().unwrap();
    graph.submit([Payload::opaque(14i64)]).unwrap();
    assert_eq!(num(&out.graph_output().unwrap()), 42);
    graph.deinit().unwrap();
}

/// Node doubling an `f32` tensor into a freshly allocated output.
fn double_tensor() -> FnNode<impl FnMut(&mut RunContext<'_>) -> Result<(), NodeError> + Send> {
    FnNode::new(|ctx: &mut RunContext<'_>| {
        let values = ctx
            .input(0)?
            .as_tensor()
            .and_then(|tensor| tensor.to_f32_vec())
            .ok_or_else(|| NodeError::new("expected an f32 tensor"))?;
        let desc = ctx
            .device()
            .describe(ctx.input(0)?)
            .ok_or_else(|| NodeError::new("undescribable input"))?;
        let mut output = ctx.create_output(0, &desc)?;
        let doubled: Vec<f32> = values.iter().map(|value| value * 2.0).collect();
        let filled = output
            .as_tensor_mut()
            .is_some_and(|tensor| tensor.fill_f32(&doubled));
        if !filled {
            return Err(NodeError::new("tensor shape mismatch"));
        }
        ctx.notify_written(0, output)
    })
}

fn tensor(device: &dyn Device, values: &[f32]) -> Payload {
    let desc = Descriptor::Tensor(TensorDesc {
        data_type: DataType::F32,
        shape: vec![values.len()],
    });
    let mut payload = device.create_payload(&desc).unwrap();
    assert!(payload.as_tensor_mut().unwrap().fill_f32(values));
    payload
}

#[test]
fn device_allocations_flow_through_create_and_notify() {
    let device = host();
    let (input, out) = (Edge::new("in"), Edge::with_kind("out", PayloadKind::Tensor));
    let mut graph = Graph::new("tensors", Arc::clone(&device), [input.clone()], [out.clone()]);
    graph.add_node("double", &[&input], &[&out], double_tensor()).unwrap();
    graph.init().unwrap();

    graph
        .submit([tensor(&*device, &[1.0, 2.5, -4.0])])
        .unwrap();
    let result = out.graph_output().unwrap();
    assert_eq!(
        result.as_tensor().unwrap().to_f32_vec().unwrap(),
        vec![2.0, 5.0, -8.0]
    );
    assert_eq!(input.kind(), Some(PayloadKind::Tensor));
    graph.deinit().unwrap();
}

#[test]
fn device_limit_fails_the_invocation() {
    let device: Arc<dyn Device> = Arc::new(HostDevice::new().with_max_allocation(8));
    let (input, out) = (Edge::new("in"), Edge::new("out"));
    let mut graph = Graph::new("oom", Arc::clone(&device), [input.clone()], [out.clone()]);
    graph.add_node("double", &[&input], &[&out], double_tensor()).unwrap();
    graph.init().unwrap();

    // 2 floats fit, 4 do not.
    graph.submit([tensor(&*device, &[1.0, 2.0])]).unwrap();
    let big = tensor(&HostDevice::new(), &[1.0, 2.0, 3.0, 4.0]);
    let Err(Error::NodeExecution { source, .. }) = graph.submit([big]) else {
        panic!("allocation should have failed");
    };
    let expected = Error::Device(DeviceError::OutOfMemory {
        device: "host".into(),
        requested: 16,
        limit: 8,
    });
    assert_eq!(source.message(), expected.to_string());
    graph.deinit().unwrap();
}

#[test]
fn edge_payload_kind_is_fixed() {
    let typed = Edge::with_kind("typed", PayloadKind::Buffer);
    typed.bind(ParallelType::Sequential, []).unwrap();
    assert_eq!(
        typed.set(Payload::opaque(1i64), 0).unwrap_err(),
        Error::PayloadKind {
            edge: "typed".into(),
            expected: PayloadKind::Buffer,
            found: PayloadKind::Opaque
        }
    );

    let untyped = Edge::new("untyped");
    untyped.bind(ParallelType::None, []).unwrap();
    assert_eq!(untyped.parallel_type(), Some(ParallelType::Sequential));
    untyped.set(Payload::param(Scale { factor: 1 }), 0).unwrap();
    assert_eq!(untyped.kind(), Some(PayloadKind::Param));
    assert!(matches!(
        untyped.set(Payload::opaque(1i64), 1),
        Err(Error::PayloadKind { .. })
    ));
    assert!(matches!(
        untyped.notify_written(Payload::opaque(1i64)),
        Err(Error::State(StateError::NoPendingWrite(_)))
    ));
    assert!(typed.unbind() && untyped.unbind());
    assert!(!untyped.unbind());
    assert!(matches!(
        untyped.set(Payload::param(Scale { factor: 1 }), 0),
        Err(Error::State(StateError::Unbound(_)))
    ));
}

#[test]
fn dump_describes_nodes_edges_and_subgraphs() {
    let (input, mid, out) = (Edge::new("in"), Edge::new("mid"), Edge::new("out"));
    let mut inner = Graph::new("inner", host(), [mid.clone()], [out.clone()]);
    inner.add_node("leaf", &[&mid], &[&out], map(|v| v)).unwrap();
    inner.set_parallel_type(ParallelType::Task).unwrap();
    let mut outer = Graph::new("outer", host(), [input.clone()], [out.clone()]);
    let head = outer.add_node("head", &[&input], &[&mid], map(|v| v)).unwrap();
    let inner_id = outer.add_subgraph(inner).unwrap();

    let mut dot = Vec::new();
    outer.dump(&mut dot).unwrap();
    let dot = String::from_utf8(dot).unwrap();
    assert!(dot.starts_with("digraph \"outer\" {"), "{dot}");
    assert!(dot.contains(&format!("n{} [shape=box, label=\"head\"];", head.get())));
    assert!(dot.contains(&format!("subgraph cluster_{} {{", inner_id.get())));
    assert!(dot.contains("label=\"inner (task)\";"));
    assert!(dot.contains(&format!("{} -> n{};", input.id(), head.get())));
    assert!(dot.contains("[shape=ellipse, label=\"mid\"];"));
    assert!(dot.trim_end().ends_with('}'));
}
