use std::collections::VecDeque;

use crate::{ClassConfig, DropReason, Packet};

/// Per class FIFO with admission control.
///
/// Every entry carries a piece of scheduler metadata `M` alongside the packet (the virtual finish
/// time for WFQ, a sequence number for FIFO).
#[derive(Debug)]
pub(crate) struct ClassQueue<M = ()> {
    config: ClassConfig,
    packets: VecDeque<(M, Packet)>,
    bytes: u64,
}

impl<M> ClassQueue<M> {
    pub(crate) fn new(config: ClassConfig) -> Self {
        Self { config, packets: VecDeque::new(), bytes: 0 }
    }

    #[inline]
    pub(crate) fn config(&self) -> &ClassConfig {
        &self.config
    }

    /// Replaces the configuration. Packets already queued are kept even if they exceed the new
    /// limits; the limits only apply to future admissions.
    pub(crate) fn set_config(&mut self, config: ClassConfig) {
        self.config = config;
    }

    /// Checks whether `packet` may be admitted. Returns the drop reason if not.
    pub(crate) fn admit(&self, packet: &Packet) -> Result<(), DropReason> {
        if !self.config.active {
            return Err(DropReason::ClassInactive);
        }

        let packets_full =
            self.config.max_queue_packets.is_some_and(|limit| self.packets.len() >= limit);
        let bytes_full = self
            .config
            .max_queue_bytes
            .is_some_and(|limit| self.bytes + packet.size() as u64 > limit);

        if packets_full || bytes_full {
            return Err(DropReason::QueueFull);
        }

        Ok(())
    }

    pub(crate) fn push(&mut self, meta: M, packet: Packet) {
        self.bytes += packet.size() as u64;
        self.packets.push_back((meta, packet));
    }

    #[inline]
    pub(crate) fn front(&self) -> Option<&(M, Packet)> {
        self.packets.front()
    }

    pub(crate) fn pop(&mut self) -> Option<(M, Packet)> {
        let entry = self.packets.pop_front()?;
        self.bytes -= entry.1.size() as u64;
        Some(entry)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    #[inline]
    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Removes every packet larger than `limit` bytes, keeping the order of the rest.
    pub(crate) fn evict_larger_than(&mut self, limit: u64) -> Vec<Packet> {
        let (evicted, kept): (VecDeque<_>, VecDeque<_>) =
            self.packets.drain(..).partition(|(_, packet)| packet.size() as u64 > limit);

        self.packets = kept;
        self.bytes = self.packets.iter().map(|(_, packet)| packet.size() as u64).sum();
        evicted.into_iter().map(|(_, packet)| packet).collect()
    }

    /// Empties the queue, returning the packets in FIFO order.
    pub(crate) fn drain(&mut self) -> Vec<Packet> {
        self.bytes = 0;
        self.packets.drain(..).map(|(_, packet)| packet).collect()
    }
}
