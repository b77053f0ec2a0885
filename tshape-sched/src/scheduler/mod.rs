//! Packet schedulers.
//!
//! A [`PacketScheduler`] owns one FIFO queue per traffic class and decides which class is served
//! next. It does not decide *when* a packet may leave: that is the job of the rate limiter sitting
//! beneath it. The pipeline therefore drives a scheduler with a two step protocol:
//!
//! 1. [`PacketScheduler::peek`] to learn which packet is next,
//! 2. [`PacketScheduler::dequeue`] once the rate limiter granted its size.
//!
//! `peek` is idempotent: as long as nothing is dequeued, repeated calls return the same packet, so
//! a packet held back by the rate limiter is the one offered on the next attempt.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use tshape_common::Clock;

use crate::{ClassConfig, ClassId, ConfigError, Packet, Rejected};

mod drr;
pub use drr::DeficitRoundRobin;

mod fifo;
pub use fifo::Fifo;

mod htb;
pub use htb::HierarchicalTokenBucket;

mod wfq;
pub use wfq::WeightedFairQueue;

/// The scheduling algorithm of a pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// A single token bucket in front of one FIFO in arrival order. Classes only provide
    /// admission limits.
    #[default]
    TokenBucket,
    /// Weighted fair queueing.
    Wfq,
    /// Deficit round robin.
    Drr,
    /// Per class rate and ceil buckets with priorities and borrowing.
    Htb,
}

impl Algorithm {
    /// The configuration tag of the algorithm.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TokenBucket => "token_bucket",
            Self::Wfq => "wfq",
            Self::Drr => "drr",
            Self::Htb => "htb",
        }
    }

    /// Creates an empty scheduler for this algorithm. HTB class buckets read time from `clock`.
    pub fn build(self, clock: Arc<dyn Clock>) -> Box<dyn PacketScheduler> {
        match self {
            Self::TokenBucket => Box::new(Fifo::new()),
            Self::Wfq => Box::new(WeightedFairQueue::new()),
            Self::Drr => Box::new(DeficitRoundRobin::new()),
            Self::Htb => Box::new(HierarchicalTokenBucket::new(clock)),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "token_bucket" | "tbf" => Ok(Self::TokenBucket),
            "wfq" => Ok(Self::Wfq),
            "drr" => Ok(Self::Drr),
            "htb" => Ok(Self::Htb),
            other => Err(ConfigError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Algorithm specific state of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassDetail {
    /// FIFO keeps no per class state.
    None,
    /// Weighted fair queueing.
    Wfq {
        /// Virtual finish time of the last admitted packet, in 2⁻³² byte units.
        finish_time: u128,
    },
    /// Deficit round robin.
    Drr {
        /// Unused credit carried to the next visit.
        deficit: u64,
    },
    /// Hierarchical token bucket.
    Htb {
        /// Tokens in the guaranteed rate bucket, if the class has one.
        rate_tokens: Option<u64>,
        /// Tokens in the ceil bucket, if the class has one.
        ceil_tokens: Option<u64>,
        /// Bytes sent above the guaranteed rate.
        borrowed_bytes: u64,
    },
}

/// A point in time view of a class queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSnapshot {
    /// Class identifier.
    pub id: ClassId,
    /// Class label, if configured.
    pub name: Option<String>,
    /// Queued packets.
    pub packets: usize,
    /// Queued bytes.
    pub bytes: u64,
    /// Whether the class admits packets.
    pub active: bool,
    /// Algorithm specific state.
    pub detail: ClassDetail,
}

/// A multi class packet scheduler.
pub trait PacketScheduler: fmt::Debug + Send {
    /// The algorithm this scheduler implements.
    fn algorithm(&self) -> Algorithm;

    /// Adds a class. Fails if the id is taken or the configuration is invalid for this algorithm.
    fn add_class(&mut self, config: ClassConfig) -> Result<(), ConfigError>;

    /// Replaces the configuration of an existing class. Queued packets are kept, except those the
    /// new configuration could never schedule, which are removed and returned.
    fn update_class(&mut self, config: ClassConfig) -> Result<Vec<Packet>, ConfigError>;

    /// Removes a class and returns the packets that were still queued in it.
    fn remove_class(&mut self, id: ClassId) -> Result<Vec<Packet>, ConfigError>;

    /// Whether class `id` exists.
    fn has_class(&self, id: ClassId) -> bool {
        self.class_config(id).is_some()
    }

    /// The configuration of class `id`, if it exists.
    fn class_config(&self, id: ClassId) -> Option<&ClassConfig>;

    /// Snapshots of every class, in ascending class id order.
    fn classes(&self) -> Vec<ClassSnapshot>;

    /// Admits a classified packet. The packet must carry a class id.
    ///
    /// On failure the packet is handed back with the reason, and the scheduler is unchanged.
    fn enqueue(&mut self, packet: Packet) -> Result<(), Rejected>;

    /// Returns the packet that [`PacketScheduler::dequeue`] would return, without removing it.
    fn peek(&mut self) -> Option<&Packet>;

    /// Removes and returns the next packet in scheduling order.
    fn dequeue(&mut self) -> Option<Packet>;

    /// For schedulers that hold packets back on their own (HTB), how long until a packet becomes
    /// eligible. `None` means the scheduler never holds back a queued packet.
    fn next_eligible_in(&self) -> Option<Duration> {
        None
    }

    /// Number of queued packets.
    fn len(&self) -> usize;

    /// Whether nothing is queued.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued bytes.
    fn backlog_bytes(&self) -> u64;

    /// Empties every queue and clears the algorithm state. Returns the packets that were queued.
    fn reset(&mut self) -> Vec<Packet>;
}

/// Resolves the class id carried by `packet`, or rejects it as unclassified.
pub(crate) fn class_of(packet: Packet) -> Result<(ClassId, Packet), Rejected> {
    match packet.class_id() {
        Some(id) => Ok((id, packet)),
        None => Err(Rejected::new(packet, crate::DropReason::UnknownClass)),
    }
}
