use crate::{
    edge::{ConsumerId, EdgeStrategy},
    error::{Error, Result, StateError},
    packet::{DataPacket, PacketData, PacketView},
    sync::{Condvar, Mutex, lock, wait, wait_timeout},
    types::{HashMap, ParallelType},
};
use core::time::Duration;
use std::{collections::VecDeque, time::Instant};
use tracing::trace;

/// Pipeline-mode edge: one producer feeding any number of independently
/// paced consumers.
///
/// The backlog holds every packet some registered consumer has not advanced
/// past yet, ordered by sequence index. Each consumer owns a cursor with the
/// next index it expects and the index of the packet it currently holds. A
/// packet is released when its consumer count drops to zero, so the backlog
/// spans the distance between the fastest and the slowest consumer rather
/// than the whole stream.
///
/// One mutex and one condition variable guard the edge; payloads are read
/// outside the lock through the `Arc` handed out in each [`PacketView`].
#[derive(Debug)]
pub(crate) struct PipelineEdge {
    name: String,
    consumers: usize,
    state: Mutex<Backlog>,
    available: Condvar,
}

#[derive(Debug)]
struct Backlog {
    packets: VecDeque<DataPacket>,
    cursors: HashMap<ConsumerId, Cursor>,
    last_index: Option<u64>,
    terminated: bool,
}

#[derive(Debug, Default)]
struct Cursor {
    /// Smallest index this consumer may take next.
    to_consume: u64,
    /// Index of the packet this consumer holds; released on its next advance.
    holding: Option<u64>,
}

impl Backlog {
    /// Backlog position of the first packet with an index of at least `index`.
    fn first_from(&self, index: u64) -> Option<usize> {
        let position = self.packets.partition_point(|packet| packet.index() < index);
        (position < self.packets.len()).then_some(position)
    }

    /// Backlog position of the packet with exactly `index`.
    fn find(&self, index: u64) -> Option<usize> {
        self.first_from(index)
            .filter(|&position| self.packets[position].index() == index)
    }

    fn release(&mut self, index: u64) {
        let position = self
            .find(index)
            .expect("Backlog::release: [1]");
        if self.packets[position].release() {
            // Consumers advance in index order, so a fully released packet is
            // always the oldest one.
            debug_assert_eq!(position, 0, "Backlog::release: [2]");
            self.packets.remove(position);
        }
    }
}

impl PipelineEdge {
    pub(crate) fn new(name: String, consumers: impl IntoIterator<Item = ConsumerId>) -> Self {
        let cursors: HashMap<_, _> = consumers
            .into_iter()
            .map(|consumer| (consumer, Cursor::default()))
            .collect();
        Self {
            name,
            consumers: cursors.len(),
            state: Mutex::new(Backlog {
                packets: VecDeque::new(),
                cursors,
                last_index: None,
                terminated: false,
            }),
            available: Condvar::new(),
        }
    }

    fn terminated(&self) -> Error {
        Error::Terminated {
            edge: self.name.clone(),
        }
    }

    fn unregistered(&self, consumer: ConsumerId) -> Error {
        StateError::UnregisteredConsumer {
            edge: self.name.clone(),
            consumer,
        }
        .into()
    }
}

impl EdgeStrategy for PipelineEdge {
    fn parallel_type(&self) -> ParallelType {
        ParallelType::Pipeline
    }

    fn publish(&self, index: u64, data: PacketData) -> Result<()> {
        let mut backlog = lock(&self.state);
        if backlog.terminated {
            return Err(self.terminated());
        }
        if let Some(last) = backlog.last_index {
            if index <= last {
                return Err(StateError::IndexNotIncreasing {
                    edge: self.name.clone(),
                    last,
                    index,
                }
                .into());
            }
        }
        backlog
            .packets
            .push_back(DataPacket::new(index, data, self.consumers));
        backlog.last_index = Some(index);
        trace!(edge = %self.name, index, backlog = backlog.packets.len(), "packet written");
        drop(backlog);
        self.available.notify_all();
        Ok(())
    }

    fn update(&self, consumer: ConsumerId, timeout: Option<Duration>) -> Result<PacketView> {
        let deadline = timeout.map(|timeout| (Instant::now() + timeout, timeout));
        let mut backlog = lock(&self.state);
        let Some(cursor) = backlog.cursors.get(&consumer) else {
            return Err(self.unregistered(consumer));
        };
        let wanted = cursor.to_consume;
        loop {
            if backlog.terminated {
                return Err(self.terminated());
            }
            if let Some(position) = backlog.first_from(wanted) {
                let view = backlog.packets[position].view();
                let state = &mut *backlog;
                let cursor = state
                    .cursors
                    .get_mut(&consumer)
                    .expect("PipelineEdge::update: [1]");
                let previous = cursor.holding.replace(view.index());
                cursor.to_consume = view
                    .index()
                    .checked_add(1)
                    .expect("PipelineEdge::update: [2]");
                if let Some(previous) = previous {
                    state.release(previous);
                }
                trace!(
                    edge = %self.name,
                    %consumer,
                    index = view.index(),
                    backlog = state.packets.len(),
                    "packet taken"
                );
                return Ok(view);
            }
            backlog = match deadline {
                None => wait(&self.available, backlog),
                Some((deadline, timeout)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::PipelineTimeout {
                            edge: self.name.clone(),
                            timeout,
                        });
                    }
                    wait_timeout(&self.available, backlog, deadline - now).0
                }
            };
        }
    }

    fn get(&self, consumer: ConsumerId) -> Result<PacketView> {
        let backlog = lock(&self.state);
        let Some(cursor) = backlog.cursors.get(&consumer) else {
            return Err(self.unregistered(consumer));
        };
        cursor
            .holding
            .and_then(|index| backlog.find(index))
            .map(|position| backlog.packets[position].view())
            .ok_or_else(|| Error::NoData {
                edge: self.name.clone(),
            })
    }

    fn index(&self, consumer: ConsumerId) -> Option<u64> {
        lock(&self.state).cursors.get(&consumer)?.holding
    }

    fn position(&self, consumer: ConsumerId) -> Option<usize> {
        let backlog = lock(&self.state);
        let holding = backlog.cursors.get(&consumer)?.holding?;
        backlog.find(holding)
    }

    fn last_index(&self) -> Option<u64> {
        lock(&self.state).last_index
    }

    fn backlog_len(&self) -> usize {
        lock(&self.state).packets.len()
    }

    fn request_terminate(&self) -> bool {
        let mut backlog = lock(&self.state);
        let first = !backlog.terminated;
        backlog.terminated = true;
        drop(backlog);
        if first {
            trace!(edge = %self.name, "termination requested");
        }
        self.available.notify_all();
        first
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{payload::Payload, types::NodeId};
    use std::sync::Arc;

    fn packet(value: u64) -> PacketData {
        Ok(Arc::new(Payload::opaque(value)))
    }

    fn value(view: &PacketView) -> u64 {
        *view
            .payload()
            .unwrap()
            .as_opaque::<u64>()
            .expect("opaque u64")
    }

    #[test]
    fn packet_is_released_after_every_consumer_advanced() {
        let (a, b) = (ConsumerId::Node(NodeId::next()), ConsumerId::Node(NodeId::next()));
        let edge = PipelineEdge::new("e".into(), [a, b]);
        edge.publish(0, packet(10)).unwrap();
        edge.publish(1, packet(11)).unwrap();

        assert_eq!(value(&edge.update(a, None).unwrap()), 10);
        assert_eq!(value(&edge.update(a, None).unwrap()), 11);
        // `a` advanced past 0, `b` has not even taken it.
        assert_eq!(edge.backlog_len(), 2);

        assert_eq!(edge.update(b, None).unwrap().index(), 0);
        assert_eq!(edge.backlog_len(), 2);
        assert_eq!(edge.update(b, None).unwrap().index(), 1);
        // Both advanced past 0; 1 is still held by both.
        assert_eq!(edge.backlog_len(), 1);
        assert_eq!(edge.position(a), Some(0));
        assert_eq!(edge.index(b), Some(1));
    }

    #[test]
    fn get_returns_held_packet_without_advancing() {
        let a = ConsumerId::Node(NodeId::next());
        let edge = PipelineEdge::new("e".into(), [a]);
        assert!(matches!(edge.get(a), Err(Error::NoData { .. })));
        edge.publish(3, packet(7)).unwrap();
        edge.publish(4, packet(8)).unwrap();
        assert_eq!(edge.update(a, None).unwrap().index(), 3);
        assert_eq!(value(&edge.get(a).unwrap()), 7);
        assert_eq!(value(&edge.get(a).unwrap()), 7);
        assert_eq!(edge.index(a), Some(3));
    }

    #[test]
    fn rejects_non_increasing_index_and_unknown_consumer() {
        let a = ConsumerId::Node(NodeId::next());
        let edge = PipelineEdge::new("e".into(), [a]);
        edge.publish(5, packet(0)).unwrap();
        assert_eq!(
            edge.publish(5, packet(0)).unwrap_err(),
            Error::State(StateError::IndexNotIncreasing {
                edge: "e".into(),
                last: 5,
                index: 5,
            })
        );
        let stranger = ConsumerId::GraphOutput;
        assert!(matches!(
            edge.update(stranger, None),
            Err(Error::State(StateError::UnregisteredConsumer { .. }))
        ));
    }

    #[test]
    fn termination_wins_over_pending_packets() {
        let a = ConsumerId::Node(NodeId::next());
        let edge = PipelineEdge::new("e".into(), [a]);
        edge.publish(0, packet(0)).unwrap();
        assert!(edge.request_terminate());
        assert!(!edge.request_terminate());
        assert!(edge.update(a, None).unwrap_err().is_terminated());
        assert!(edge.publish(1, packet(1)).unwrap_err().is_terminated());
    }

    #[test]
    fn timed_update_gives_up() {
        let a = ConsumerId::Node(NodeId::next());
        let edge = PipelineEdge::new("e".into(), [a]);
        let err = edge
            .update(a, Some(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(err, Error::PipelineTimeout { .. }));
    }
}
