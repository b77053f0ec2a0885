use std::fmt;

use thiserror::Error;

use crate::{ClassId, Packet};

/// Invalid configuration, reported synchronously to whoever tried to apply it.
///
/// When one of these is returned, the pipeline or class it refers to is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A WFQ class with weight zero.
    #[error("class {0}: weight must be greater than zero")]
    ZeroWeight(ClassId),
    /// A DRR class with quantum zero.
    #[error("class {0}: quantum must be greater than zero")]
    ZeroQuantum(ClassId),
    /// A queue limit of zero packets or bytes.
    #[error("class {0}: queue limit must be greater than zero")]
    ZeroQueueLimit(ClassId),
    /// An HTB class with a zero ceil.
    #[error("class {0}: ceil bandwidth must be greater than zero")]
    ZeroCeil(ClassId),
    /// An HTB class whose guaranteed rate is above its ceil.
    #[error("class {0}: min bandwidth exceeds max bandwidth")]
    BandwidthBounds(ClassId),
    /// The class id is already taken.
    #[error("class {0} already exists")]
    DuplicateClass(ClassId),
    /// No class with this id.
    #[error("unknown class: {0}")]
    UnknownClass(ClassId),
    /// The default class is not among the configured classes.
    #[error("default class {0} is not configured")]
    MissingDefaultClass(ClassId),
    /// Removing the class the unknown class policy points at.
    #[error("class {0} is the default class and cannot be removed")]
    DefaultClassRemoval(ClassId),
    /// A configuration without any class.
    #[error("no traffic classes configured")]
    NoClasses,
    /// An algorithm tag that does not name a scheduler.
    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),
    /// A pipeline rate of zero.
    #[error("rate must be greater than zero")]
    ZeroRate,
    /// A burst of zero bytes.
    #[error("burst must be greater than zero")]
    ZeroBurst,
}

/// Why a packet was dropped.
///
/// Every packet that enters a pipeline and does not leave it through the downstream sink is
/// dropped with exactly one of these reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DropReason {
    /// The class queue was at its packet or byte limit.
    QueueFull,
    /// The classifier returned a class that does not exist and no default class is configured.
    UnknownClass,
    /// The class exists but is marked inactive.
    ClassInactive,
    /// The packet is larger than the bucket capacity and could never be transmitted.
    ExceedsBurst,
    /// The packet has a size of zero.
    Malformed,
    /// The packet was queued in a class that has been removed.
    ClassRemoved,
    /// The packet was queued when the pipeline was reconfigured.
    Reconfigured,
    /// The packet was queued when the pipeline stopped.
    Shutdown,
}

impl DropReason {
    /// Number of distinct drop reasons.
    pub const COUNT: usize = 8;

    /// Every reason, in [`DropReason::index`] order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::QueueFull,
        Self::UnknownClass,
        Self::ClassInactive,
        Self::ExceedsBurst,
        Self::Malformed,
        Self::ClassRemoved,
        Self::Reconfigured,
        Self::Shutdown,
    ];

    /// Dense index of the reason, usable for counter arrays.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Snake case name, as used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::UnknownClass => "unknown_class",
            Self::ClassInactive => "class_inactive",
            Self::ExceedsBurst => "exceeds_burst",
            Self::Malformed => "malformed",
            Self::ClassRemoved => "class_removed",
            Self::Reconfigured => "reconfigured",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A packet refused at admission, handed back to the caller together with the reason.
#[derive(Debug)]
pub struct Rejected {
    /// The refused packet.
    pub packet: Packet,
    /// Why it was refused.
    pub reason: DropReason,
}

impl Rejected {
    /// Pairs a refused packet with the reason.
    #[inline]
    pub fn new(packet: Packet, reason: DropReason) -> Self {
        Self { packet, reason }
    }
}
