#![doc(issue_tracker_base_url = "https://github.com/tshape-rs/tshape/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Traffic shaping for packet streams: token buckets, fair queueing schedulers (WFQ, DRR,
//! HTB) and asynchronous shaping pipelines.

pub use tshape_common::constants;
pub use tshape_pipeline::*;
pub use tshape_sched::*;
