#![doc(issue_tracker_base_url = "https://github.com/tshape-rs/tshape/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Shaping pipelines and their manager.
//!
//! A [`ShapingPipeline`] classifies packets, queues them in a [`tshape_sched::PacketScheduler`]
//! and releases them through a token bucket from a background tokio task. A [`ShaperManager`]
//! keeps a registry of named pipelines.

mod config;
pub use config::{PipelineOptions, ShapingConfig, UnknownClassPolicy};

mod hooks;
pub use hooks::{DropHook, EmitHook};

mod manager;
pub use manager::{ManagerError, ShaperManager};

mod pipeline;
pub use pipeline::{PipelineError, PipelineState, ShapingPipeline, Verdict};

mod stats;
pub use stats::{ClassStats, Counters, ManagerStats, PipelineStats};
