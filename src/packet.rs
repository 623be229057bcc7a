use crate::{error::Error, payload::Payload};
use std::sync::Arc;

/// What a packet carries: a shared payload handle, or the failure recorded
/// for its sequence index.
pub(crate) type PacketData = Result<Arc<Payload>, Error>;

/// One versioned entry of a pipeline edge's backlog.
#[derive(Debug)]
pub(crate) struct DataPacket {
    index: u64,
    data: PacketData,
    /// Registered consumers that have not advanced past this packet yet.
    consumers_left: usize,
}

impl DataPacket {
    pub(crate) fn new(index: u64, data: PacketData, consumers: usize) -> Self {
        Self {
            index,
            data,
            consumers_left: consumers,
        }
    }

    pub(crate) fn index(&self) -> u64 {
        self.index
    }

    pub(crate) fn view(&self) -> PacketView {
        PacketView::new(self.index, self.data.clone())
    }

    /// Record that one consumer advanced past the packet. Returns `true` once
    /// every consumer has.
    pub(crate) fn release(&mut self) -> bool {
        self.consumers_left = self
            .consumers_left
            .checked_sub(1)
            .expect("DataPacket::release: [1]");
        self.consumers_left == 0
    }
}

/// A consumer's handle to one packet.
///
/// Holding a view keeps the payload alive; reading it needs no lock.
#[derive(Debug, Clone)]
pub struct PacketView {
    index: u64,
    data: PacketData,
}

impl PacketView {
    pub(crate) fn new(index: u64, data: PacketData) -> Self {
        Self { index, data }
    }

    /// Sequence index of the packet.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The payload, or the failure recorded for this index upstream.
    pub fn payload(&self) -> Result<&Arc<Payload>, Error> {
        self.data.as_ref().map_err(Clone::clone)
    }

    pub fn into_payload(self) -> Result<Arc<Payload>, Error> {
        self.data
    }

    pub(crate) fn failure(&self) -> Option<&Error> {
        self.data.as_ref().err()
    }
}
