use std::net::IpAddr;

use bytes::Bytes;
use tokio::time::Instant;

/// Identifier of a traffic class, unique within a pipeline.
pub type ClassId = u32;

/// A packet flowing through the shaping engine.
///
/// Packets are owned by exactly one queue at a time and are moved, never copied, between the
/// producer, the scheduler and the downstream sink. The class a packet belongs to is assigned once
/// (either explicitly by the producer with [`Packet::with_class`] or by a classifier) and never
/// changes afterwards.
#[derive(Debug, PartialEq, Eq)]
pub struct Packet {
    id: u64,
    size: u32,
    arrival_time: Instant,
    source: Option<IpAddr>,
    destination: Option<IpAddr>,
    source_port: u16,
    destination_port: u16,
    protocol: u8,
    priority: u8,
    dscp: u8,
    payload: Bytes,
    class_id: Option<ClassId>,
}

impl Packet {
    /// Creates a packet of `size` bytes that arrived now.
    pub fn new(size: u32) -> Self {
        Self {
            id: 0,
            size,
            arrival_time: Instant::now(),
            source: None,
            destination: None,
            source_port: 0,
            destination_port: 0,
            protocol: 0,
            priority: 0,
            dscp: 0,
            payload: Bytes::new(),
            class_id: None,
        }
    }

    /// Creates a packet carrying `payload`. The packet size is the payload length.
    pub fn from_payload(payload: Bytes) -> Self {
        let size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        Self { payload, ..Self::new(size) }
    }

    /// Sets the packet id, used to correlate drops and emissions.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Overrides the arrival time, which defaults to the creation instant.
    pub fn with_arrival_time(mut self, arrival_time: Instant) -> Self {
        self.arrival_time = arrival_time;
        self
    }

    /// Sets the source address and port.
    pub fn with_source(mut self, addr: IpAddr, port: u16) -> Self {
        self.source = Some(addr);
        self.source_port = port;
        self
    }

    /// Sets the destination address and port.
    pub fn with_destination(mut self, addr: IpAddr, port: u16) -> Self {
        self.destination = Some(addr);
        self.destination_port = port;
        self
    }

    /// Sets the IP protocol number (6 for TCP, 17 for UDP, ...).
    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the priority read by [`PriorityClassifier`](crate::PriorityClassifier).
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the DSCP code point. Only the low 6 bits are kept.
    pub fn with_dscp(mut self, dscp: u8) -> Self {
        self.dscp = dscp & 0x3f;
        self
    }

    /// Attaches a payload without changing the accounted size.
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Pins the packet to `class_id`, bypassing the pipeline classifier.
    pub fn with_class(mut self, class_id: ClassId) -> Self {
        self.class_id = Some(class_id);
        self
    }

    /// Caller assigned id. Zero unless set.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes, as accounted by the schedulers and token buckets.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// When the packet was created or received.
    #[inline]
    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    /// Source address, if known.
    #[inline]
    pub fn source(&self) -> Option<IpAddr> {
        self.source
    }

    /// Destination address, if known.
    #[inline]
    pub fn destination(&self) -> Option<IpAddr> {
        self.destination
    }

    /// Source port, zero if unknown.
    #[inline]
    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    /// Destination port, zero if unknown.
    #[inline]
    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }

    /// IP protocol number.
    #[inline]
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Priority read by priority classifiers.
    #[inline]
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// DSCP code point, 0 to 63.
    #[inline]
    pub fn dscp(&self) -> u8 {
        self.dscp
    }

    /// Payload bytes. Empty for synthetic packets.
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the packet, returning its payload.
    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// The assigned class, if the packet has been classified.
    #[inline]
    pub fn class_id(&self) -> Option<ClassId> {
        self.class_id
    }

    /// Assigns `class_id` unless a class was already assigned, and returns the effective class.
    pub fn assign_class(&mut self, class_id: ClassId) -> ClassId {
        *self.class_id.get_or_insert(class_id)
    }
}
