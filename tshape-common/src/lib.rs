#![doc(issue_tracker_base_url = "https://github.com/tshape-rs/tshape/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Shared building blocks for the tshape crates: time sources, rate units and shared constants.

mod clock;
pub use clock::{Clock, ManualClock, TokioClock};

mod rate;
pub use rate::{ParseRateError, Rate};

/// Units shared by the rate and burst defaults.
pub mod constants {
    /// Standard Ethernet MTU in bytes.
    pub const MTU_ETHERNET: u32 = 1_500;

    /// Nanoseconds in one second. Token accounting is done in nano-byte units.
    pub const NANOS_PER_SEC: u64 = 1_000_000_000;
}
