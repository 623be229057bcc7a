#![allow(missing_docs)]
#![cfg(feature = "loom")]

use cpg::{
    device::HostDevice,
    edge::{ConsumerId, Edge},
    graph::Graph,
    node::FnNode,
    payload::Payload,
    types::ParallelType,
};
use loom::thread;
use std::sync::Arc;

/// Two consumer identities. The graph is never initialized; only the node
/// ids are used.
fn consumers() -> (ConsumerId, ConsumerId) {
    let mut graph = Graph::new("ids", Arc::new(HostDevice::new()), [], []);
    let a = graph.add_node("a", &[], &[], FnNode::new(|_| Ok(()))).unwrap();
    let b = graph.add_node("b", &[], &[], FnNode::new(|_| Ok(()))).unwrap();
    (ConsumerId::Node(a), ConsumerId::Node(b))
}

fn value(edge: &Edge, consumer: ConsumerId) -> (u64, u32) {
    let view = edge.update(consumer).expect("packet");
    let value = *view.payload().unwrap().as_opaque::<u32>().unwrap();
    (view.index(), value)
}

#[test]
fn loom_pipeline_consumers_see_every_packet_in_order() {
    loom::model(|| {
        let (a, b) = consumers();
        // Graph:
        //   producer --e--> a
        //             \---> b
        // Both consumers must observe 0 then 1, whatever the interleaving,
        // and packet 0 must be gone once both moved past it.
        let edge = Edge::new("e");
        edge.bind(ParallelType::Pipeline, [a, b]).unwrap();

        let producer = {
            let edge = edge.clone();
            thread::spawn(move || {
                edge.set(Payload::opaque(10u32), 0).unwrap();
                edge.set(Payload::opaque(11u32), 1).unwrap();
            })
        };
        let reader = {
            let edge = edge.clone();
            thread::spawn(move || [value(&edge, b), value(&edge, b)])
        };
        assert_eq!([value(&edge, a), value(&edge, a)], [(0, 10), (1, 11)]);
        assert_eq!(reader.join().unwrap(), [(0, 10), (1, 11)]);
        producer.join().unwrap();

        assert_eq!(edge.backlog_len(), 1);
        assert_eq!(edge.index(a), Some(1));
        assert_eq!(edge.index(b), Some(1));
    });
}

#[test]
fn loom_pipeline_terminate_wakes_blocked_consumer() {
    loom::model(|| {
        let (a, _) = consumers();
        let edge = Edge::new("e");
        edge.bind(ParallelType::Pipeline, [a]).unwrap();

        let reader = {
            let edge = edge.clone();
            thread::spawn(move || edge.update(a))
        };
        edge.request_terminate();
        assert!(reader.join().unwrap().unwrap_err().is_terminated());
    });
}

#[test]
fn loom_task_edge_hands_value_to_waiting_reader() {
    loom::model(|| {
        let (a, _) = consumers();
        let edge = Edge::new("e");
        edge.bind(ParallelType::Task, [a]).unwrap();

        let reader = {
            let edge = edge.clone();
            thread::spawn(move || value(&edge, a))
        };
        edge.set(Payload::opaque(7u32), 3).unwrap();
        assert_eq!(reader.join().unwrap(), (3, 7));
    });
}
