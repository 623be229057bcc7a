use crate::{
    edge::{ConsumerId, EdgeStrategy},
    error::{Error, Result},
    packet::{PacketData, PacketView},
    sync::{Mutex, lock},
    types::ParallelType,
};
use core::time::Duration;

/// Sequential-mode edge: the latest write wins and reads never block.
///
/// The sequential scheduler runs producers before consumers on one thread, so
/// the value is always present when a consumer looks. The mutex is never
/// contended; it only makes the edge shareable.
#[derive(Debug)]
pub(crate) struct DirectEdge {
    name: String,
    current: Mutex<Option<PacketView>>,
}

impl DirectEdge {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            current: Mutex::new(None),
        }
    }
}

impl EdgeStrategy for DirectEdge {
    fn parallel_type(&self) -> ParallelType {
        ParallelType::Sequential
    }

    fn publish(&self, index: u64, data: PacketData) -> Result<()> {
        *lock(&self.current) = Some(PacketView::new(index, data));
        Ok(())
    }

    fn update(&self, consumer: ConsumerId, _timeout: Option<Duration>) -> Result<PacketView> {
        self.get(consumer)
    }

    fn get(&self, _consumer: ConsumerId) -> Result<PacketView> {
        lock(&self.current).clone().ok_or_else(|| Error::NoData {
            edge: self.name.clone(),
        })
    }

    fn index(&self, _consumer: ConsumerId) -> Option<u64> {
        self.last_index()
    }

    fn position(&self, _consumer: ConsumerId) -> Option<usize> {
        lock(&self.current).as_ref().map(|_| 0)
    }

    fn last_index(&self) -> Option<u64> {
        lock(&self.current).as_ref().map(PacketView::index)
    }

    fn backlog_len(&self) -> usize {
        usize::from(lock(&self.current).is_some())
    }

    fn clear(&self) {
        lock(&self.current).take();
    }

    fn request_terminate(&self) -> bool {
        false
    }
}
