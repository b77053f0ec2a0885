//! Pipeline and manager statistics.
//!
//! Counters are owned by each pipeline and updated inside the same critical section as the queue
//! operation they describe, so a snapshot never shows a packet both queued and dequeued. For any
//! snapshot:
//!
//! ```text
//! received = dequeued + dropped + backlog
//! ```
//!
//! in packets as well as in bytes.

use rustc_hash::FxHashMap;
use tshape_common::Rate;
use tshape_sched::{Algorithm, BucketSnapshot, ClassDetail, ClassId, ClassSnapshot, DropReason};

use crate::PipelineState;

/// A packet and byte counter pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Number of packets.
    pub packets: u64,
    /// Number of bytes.
    pub bytes: u64,
}

impl Counters {
    #[inline]
    pub(crate) fn record(&mut self, bytes: u64) {
        self.packets += 1;
        self.bytes += bytes;
    }

    fn add(&mut self, other: Self) {
        self.packets += other.packets;
        self.bytes += other.bytes;
    }
}

/// Counters of a single class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ClassCounters {
    received: Counters,
    enqueued: Counters,
    dequeued: Counters,
    dropped: Counters,
}

/// Live counters of a pipeline.
#[derive(Debug, Default)]
pub(crate) struct StatsCollector {
    received: Counters,
    enqueued: Counters,
    dequeued: Counters,
    dropped: Counters,
    drops_by_reason: [Counters; DropReason::COUNT],
    classes: FxHashMap<ClassId, ClassCounters>,
}

impl StatsCollector {
    fn class(&mut self, class: Option<ClassId>) -> Option<&mut ClassCounters> {
        class.map(|id| self.classes.entry(id).or_default())
    }

    pub(crate) fn on_received(&mut self, class: Option<ClassId>, bytes: u64) {
        self.received.record(bytes);
        if let Some(counters) = self.class(class) {
            counters.received.record(bytes);
        }
    }

    pub(crate) fn on_enqueued(&mut self, class: ClassId, bytes: u64) {
        self.enqueued.record(bytes);
        self.classes.entry(class).or_default().enqueued.record(bytes);
    }

    pub(crate) fn on_dequeued(&mut self, class: Option<ClassId>, bytes: u64) {
        self.dequeued.record(bytes);
        if let Some(counters) = self.class(class) {
            counters.dequeued.record(bytes);
        }
    }

    pub(crate) fn on_dropped(&mut self, class: Option<ClassId>, reason: DropReason, bytes: u64) {
        self.dropped.record(bytes);
        self.drops_by_reason[reason.index()].record(bytes);
        if let Some(counters) = self.class(class) {
            counters.dropped.record(bytes);
        }
    }

    /// Forgets the per class counters of a removed class. Pipeline totals are kept.
    pub(crate) fn forget_class(&mut self, class: ClassId) {
        self.classes.remove(&class);
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn snapshot(&self, view: PipelineView<'_>) -> PipelineStats {
        let classes = view
            .classes
            .into_iter()
            .map(|class| {
                let counters = self.classes.get(&class.id).copied().unwrap_or_default();
                ClassStats::new(class, counters)
            })
            .collect();

        PipelineStats {
            name: view.name.to_string(),
            state: view.state,
            algorithm: view.algorithm,
            rate: view.bucket.map(|bucket| bucket.rate),
            received: self.received,
            enqueued: self.enqueued,
            dequeued: self.dequeued,
            dropped: self.dropped,
            drops_by_reason: self.drops_by_reason,
            backlog: view.backlog,
            bucket: view.bucket,
            classes,
        }
    }
}

/// Pipeline state needed to build a [`PipelineStats`] snapshot.
pub(crate) struct PipelineView<'a> {
    pub(crate) name: &'a str,
    pub(crate) state: PipelineState,
    pub(crate) algorithm: Option<Algorithm>,
    pub(crate) bucket: Option<BucketSnapshot>,
    pub(crate) backlog: Counters,
    pub(crate) classes: Vec<ClassSnapshot>,
}

/// Statistics of a single traffic class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassStats {
    /// Class identifier.
    pub class_id: ClassId,
    /// Class label, if configured.
    pub name: Option<String>,
    /// Whether the class currently admits packets.
    pub active: bool,
    /// Packets classified into this class, admitted or not.
    pub received: Counters,
    /// Packets admitted to the class queue.
    pub enqueued: Counters,
    /// Packets shaped and emitted.
    pub dequeued: Counters,
    /// Packets dropped, at admission or later.
    pub dropped: Counters,
    /// Packets and bytes currently queued.
    pub backlog: Counters,
    /// Algorithm specific state (WFQ finish time, DRR deficit, HTB tokens).
    pub detail: ClassDetail,
}

impl ClassStats {
    fn new(class: ClassSnapshot, counters: ClassCounters) -> Self {
        Self {
            class_id: class.id,
            name: class.name,
            active: class.active,
            received: counters.received,
            enqueued: counters.enqueued,
            dequeued: counters.dequeued,
            dropped: counters.dropped,
            backlog: Counters { packets: class.packets as u64, bytes: class.bytes },
            detail: class.detail,
        }
    }
}

/// A snapshot of a pipeline's statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    /// Pipeline name.
    pub name: String,
    /// Lifecycle state when the snapshot was taken.
    pub state: PipelineState,
    /// `None` until the pipeline is configured.
    pub algorithm: Option<Algorithm>,
    /// Aggregate rate, `None` until the pipeline is configured.
    pub rate: Option<Rate>,
    /// Every packet offered to the pipeline while it was running.
    pub received: Counters,
    /// Packets admitted to a class queue.
    pub enqueued: Counters,
    /// Packets that left through the egress channel or the emit hook.
    pub dequeued: Counters,
    /// Packets dropped for any reason, at admission or later.
    pub dropped: Counters,
    drops_by_reason: [Counters; DropReason::COUNT],
    /// Packets and bytes currently queued.
    pub backlog: Counters,
    /// State of the pipeline token bucket.
    pub bucket: Option<BucketSnapshot>,
    /// Per class statistics, in ascending class id order.
    pub classes: Vec<ClassStats>,
}

impl PipelineStats {
    /// Drops attributed to `reason`.
    pub fn drops(&self, reason: DropReason) -> Counters {
        self.drops_by_reason[reason.index()]
    }

    /// Statistics of class `class_id`, if it exists.
    pub fn class(&self, class_id: ClassId) -> Option<&ClassStats> {
        self.classes.iter().find(|class| class.class_id == class_id)
    }

    /// Returns `true` if every received byte has been either dequeued or dropped.
    pub fn is_drained(&self) -> bool {
        self.backlog.packets == 0 && self.dequeued.bytes + self.dropped.bytes == self.received.bytes
    }
}

/// Manager wide statistics: every pipeline's snapshot, and their sums.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Per pipeline snapshots, sorted by name.
    pub pipelines: Vec<PipelineStats>,
    /// Received packets. These counters are sums over all pipelines.
    pub received: Counters,
    /// Admitted packets.
    pub enqueued: Counters,
    /// Emitted packets.
    pub dequeued: Counters,
    /// Dropped packets.
    pub dropped: Counters,
    drops_by_reason: [Counters; DropReason::COUNT],
    /// Packets and bytes currently queued.
    pub backlog: Counters,
}

impl ManagerStats {
    pub(crate) fn from_pipelines(mut pipelines: Vec<PipelineStats>) -> Self {
        pipelines.sort_by(|a, b| a.name.cmp(&b.name));

        let mut stats = Self::default();
        for pipeline in &pipelines {
            stats.received.add(pipeline.received);
            stats.enqueued.add(pipeline.enqueued);
            stats.dequeued.add(pipeline.dequeued);
            stats.dropped.add(pipeline.dropped);
            stats.backlog.add(pipeline.backlog);
            for reason in DropReason::ALL {
                stats.drops_by_reason[reason.index()].add(pipeline.drops(reason));
            }
        }

        stats.pipelines = pipelines;
        stats
    }

    /// Drops attributed to `reason`, across all pipelines.
    pub fn drops(&self, reason: DropReason) -> Counters {
        self.drops_by_reason[reason.index()]
    }

    /// The snapshot of pipeline `name`, if it is registered.
    pub fn pipeline(&self, name: &str) -> Option<&PipelineStats> {
        self.pipelines.iter().find(|pipeline| pipeline.name == name)
    }
}
