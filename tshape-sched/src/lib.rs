#![doc(issue_tracker_base_url = "https://github.com/tshape-rs/tshape/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Packet scheduling primitives: the [`Packet`] type, traffic class configuration, the
//! [`TokenBucket`] rate limiter, classifiers and the [`PacketScheduler`] implementations
//! (WFQ, DRR, FIFO and HTB).

pub mod bucket;
pub use bucket::{BucketSnapshot, RateLimiter, TokenBucket};

mod class;
pub use class::ClassConfig;

pub mod classifier;
pub use classifier::{Classifier, DscpClassifier, FnClassifier, PriorityClassifier};

mod error;
pub use error::{ConfigError, DropReason, Rejected};

mod packet;
pub use packet::{ClassId, Packet};

mod queue;

pub mod scheduler;
pub use scheduler::{
    Algorithm, ClassDetail, ClassSnapshot, DeficitRoundRobin, Fifo, HierarchicalTokenBucket,
    PacketScheduler, WeightedFairQueue,
};

pub use tshape_common::{Clock, ManualClock, Rate, TokioClock};
