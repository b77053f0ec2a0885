use std::{fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex, Notify},
    task::JoinHandle,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn, Instrument};
use tshape_common::Rate;
use tshape_sched::{
    ClassConfig, ClassId, ConfigError, DropReason, Packet, PacketScheduler, RateLimiter, Rejected,
    TokenBucket,
};

use crate::{
    hooks::{DropHook, EmitHook, Hooks},
    stats::{Counters, PipelineView, StatsCollector},
    PipelineOptions, PipelineStats, ShapingConfig, UnknownClassPolicy,
};

mod driver;
use driver::Driver;

/// Result of a [`ShapingPipeline`] operation.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors returned by a [`ShapingPipeline`].
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Packets are only accepted while running.
    #[error("pipeline is not running (state: {0})")]
    NotRunning(PipelineState),
    /// The operation needs a configuration.
    #[error("pipeline is not configured")]
    NotConfigured,
    /// `configure` on a running pipeline.
    #[error("pipeline is running, stop it before configuring")]
    Running,
    /// `start` was called outside a tokio runtime.
    #[error("no tokio runtime to spawn the pipeline driver on")]
    NoRuntime,
    /// The configuration was refused.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Lifecycle of a pipeline.
///
/// ```text
/// Created ──configure──▶ Configured ──start──▶ Running ──stop──▶ Stopped
///                             ▲                                     │
///                             └──────────────configure──────────────┘
/// ```
///
/// A stopped pipeline can also be started again with its current configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Created without a configuration.
    Created,
    /// Configured, driver not started.
    Configured,
    /// The driver task is active.
    Running,
    /// Stopped. Can be reconfigured or started again.
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Created => "created",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

/// Outcome of [`ShapingPipeline::enqueue_packet`] on a running pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The packet was admitted to a class queue.
    Queued {
        /// The class it was admitted to.
        class_id: ClassId,
    },
    /// The packet was dropped. The drop hook has already been called.
    Dropped(DropReason),
}

impl Verdict {
    /// Whether the packet was admitted.
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

/// A configured scheduler together with the token bucket that paces it.
#[derive(Debug)]
pub(crate) struct Shaping {
    pub(crate) config: ShapingConfig,
    pub(crate) scheduler: Box<dyn PacketScheduler>,
    pub(crate) limiter: TokenBucket,
}

#[derive(Debug)]
struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub(crate) struct Inner {
    state: PipelineState,
    pub(crate) shaping: Option<Shaping>,
    pub(crate) stats: StatsCollector,
    running: Option<Running>,
}

impl Inner {
    fn shaping_mut(&mut self) -> Result<&mut Shaping> {
        self.shaping.as_mut().ok_or(PipelineError::NotConfigured)
    }
}

/// State shared between the pipeline handles and the driver task.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) options: PipelineOptions,
    pub(crate) inner: Mutex<Inner>,
    /// Signalled on every admission and reconfiguration.
    pub(crate) wake: Notify,
    pub(crate) hooks: Hooks,
    pub(crate) egress_tx: mpsc::Sender<Packet>,
    egress_rx: AsyncMutex<mpsc::Receiver<Packet>>,
    /// Cancelled when the last pipeline handle is dropped.
    closed: CancellationToken,
}

impl Drop for Shared {
    /// Discards what is still queued once the last handle and the driver are gone. Each packet
    /// is dropped with [`DropReason::Shutdown`] and passed to the drop hook, as on `stop`.
    fn drop(&mut self) {
        let Inner { shaping, stats, .. } = self.inner.get_mut();
        let Some(shaping) = shaping.as_mut() else {
            return;
        };

        let drops: Vec<_> = shaping
            .scheduler
            .reset()
            .into_iter()
            .map(|packet| {
                stats.on_dropped(packet.class_id(), DropReason::Shutdown, packet.size() as u64);
                (packet, DropReason::Shutdown)
            })
            .collect();

        if !drops.is_empty() {
            debug!(pipeline = %self.name, discarded = drops.len(), "pipeline dropped");
            self.hooks.dropped(drops);
        }
    }
}

/// A traffic shaping pipeline: a classifier, a packet scheduler and a token bucket, driven by a
/// background task.
///
/// Producers call [`ShapingPipeline::enqueue_packet`] from any thread. The call never blocks: the
/// packet is either queued or dropped and accounted. The driver task takes packets out of the
/// scheduler in algorithm order, waits for the token bucket to grant their size, and hands them
/// to the emit hook or to the egress channel read with [`ShapingPipeline::recv`].
///
/// The handle is cheap to clone. The driver task is cancelled once every handle is dropped, and
/// packets still queued at that point are dropped with [`DropReason::Shutdown`] and passed to the
/// drop hook, as if the pipeline had been stopped.
#[derive(Debug, Clone)]
pub struct ShapingPipeline {
    shared: Arc<Shared>,
    _guard: Arc<DropGuard>,
}

impl ShapingPipeline {
    /// Creates an unconfigured pipeline with default options.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, PipelineOptions::default())
    }

    /// Creates an unconfigured pipeline.
    pub fn with_options(name: impl Into<String>, options: PipelineOptions) -> Self {
        let (egress_tx, egress_rx) = mpsc::channel(options.egress_buffer);
        let closed = CancellationToken::new();

        let shared = Shared {
            name: name.into(),
            options,
            inner: Mutex::new(Inner {
                state: PipelineState::Created,
                shaping: None,
                stats: StatsCollector::default(),
                running: None,
            }),
            wake: Notify::new(),
            hooks: Hooks::default(),
            egress_tx,
            egress_rx: AsyncMutex::new(egress_rx),
            closed: closed.clone(),
        };

        Self { shared: Arc::new(shared), _guard: Arc::new(closed.drop_guard()) }
    }

    /// Creates a pipeline and configures it.
    pub fn configured(
        name: impl Into<String>,
        config: ShapingConfig,
        options: PipelineOptions,
    ) -> Result<Self> {
        let pipeline = Self::with_options(name, options);
        pipeline.configure(config)?;
        Ok(pipeline)
    }

    /// The name given at creation.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The current lifecycle state.
    pub fn state(&self) -> PipelineState {
        self.shared.inner.lock().state
    }

    /// Whether the driver task is active.
    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    /// Returns the current configuration, including class changes made since it was applied.
    pub fn config(&self) -> Option<ShapingConfig> {
        self.shared.inner.lock().shaping.as_ref().map(|shaping| shaping.config.clone())
    }

    /// Installs the drop hook, replacing any previous one.
    pub fn set_drop_hook(&self, hook: impl Fn(Packet, DropReason) + Send + Sync + 'static) {
        self.shared.hooks.set_drop(Some(Arc::new(hook) as DropHook));
    }

    /// Installs the emit hook. While it is set, shaped packets are passed to it instead of the
    /// egress channel.
    pub fn set_emit_hook(&self, hook: impl Fn(Packet) + Send + Sync + 'static) {
        self.shared.hooks.set_emit(Some(Arc::new(hook) as EmitHook));
    }

    /// Removes both hooks. Shaped packets go to the egress channel again.
    pub fn clear_hooks(&self) {
        self.shared.hooks.set_drop(None);
        self.shared.hooks.set_emit(None);
    }

    pub(crate) fn set_shared_drop_hook(&self, hook: DropHook) {
        self.shared.hooks.set_drop(Some(hook));
    }

    /// Applies a configuration to a pipeline that is not running.
    ///
    /// On error the pipeline keeps its previous configuration and state.
    pub fn configure(&self, config: ShapingConfig) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        if inner.state == PipelineState::Running {
            warn!(pipeline = %self.shared.name, "configure called on a running pipeline");
            return Err(PipelineError::Running);
        }

        inner.shaping = Some(self.build(config)?);
        inner.state = PipelineState::Configured;

        info!(pipeline = %self.shared.name, "pipeline configured");
        Ok(())
    }

    /// Replaces the configuration, in any state.
    ///
    /// Queued packets are moved into the new scheduler in their per class order. Packets whose
    /// class no longer exists, or that the new limits refuse, are dropped with
    /// [`DropReason::Reconfigured`]. On a pipeline that was never configured this is the same as
    /// [`ShapingPipeline::configure`].
    pub fn reconfigure(&self, config: ShapingConfig) -> Result<()> {
        let drops = {
            let mut inner = self.shared.inner.lock();
            let mut next = self.build(config)?;

            let mut drops = Vec::new();
            let Inner { shaping, stats, state, .. } = &mut *inner;

            if let Some(previous) = shaping.as_mut() {
                for packet in previous.scheduler.reset() {
                    let class = packet.class_id();
                    let size = packet.size() as u64;
                    if let Err(Rejected { packet, .. }) = next.scheduler.enqueue(packet) {
                        stats.on_dropped(class, DropReason::Reconfigured, size);
                        drops.push((packet, DropReason::Reconfigured));
                    }
                }
            }

            *shaping = Some(next);
            if *state == PipelineState::Created {
                *state = PipelineState::Configured;
            }

            info!(pipeline = %self.shared.name, dropped = drops.len(), "pipeline reconfigured");
            drops
        };

        self.shared.wake.notify_one();
        self.shared.hooks.dropped(drops);
        Ok(())
    }

    fn build(&self, config: ShapingConfig) -> Result<Shaping> {
        let scheduler = config.build_scheduler(&self.shared.options)?;
        let limiter = TokenBucket::with_clock(
            config.burst_bytes,
            config.rate,
            Arc::clone(&self.shared.options.clock),
        );

        Ok(Shaping { config, scheduler, limiter })
    }

    /// Spawns the driver task on the current tokio runtime.
    ///
    /// Starting a running pipeline is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            PipelineState::Running => {
                debug!(pipeline = %self.shared.name, "pipeline already running");
                return Ok(());
            }
            PipelineState::Created => return Err(PipelineError::NotConfigured),
            PipelineState::Configured | PipelineState::Stopped => {}
        }

        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        let cancel = self.shared.closed.child_token();
        let driver = Driver::new(Arc::clone(&self.shared), cancel.clone());
        let span = tracing::debug_span!("pipeline", name = %self.shared.name);
        let handle = runtime.spawn(driver.run().instrument(span));

        inner.running = Some(Running { cancel, handle });
        inner.state = PipelineState::Running;

        info!(pipeline = %self.shared.name, "pipeline started");
        Ok(())
    }

    /// Stops the driver task and waits for it to exit.
    ///
    /// Packets still queued are discarded: each is dropped with [`DropReason::Shutdown`] and
    /// passed to the drop hook. Stopping a pipeline that is not running is a no-op.
    pub async fn stop(&self) {
        let running = {
            let mut inner = self.shared.inner.lock();
            if inner.state != PipelineState::Running {
                return;
            }
            inner.state = PipelineState::Stopped;
            inner.running.take()
        };

        if let Some(Running { cancel, handle }) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!(pipeline = %self.shared.name, "pipeline driver failed: {:?}", e);
            }
        }

        let drops = {
            let mut inner = self.shared.inner.lock();
            let Inner { shaping, stats, .. } = &mut *inner;

            let queued = shaping.as_mut().map(|s| s.scheduler.reset()).unwrap_or_default();
            queued
                .into_iter()
                .map(|packet| {
                    stats.on_dropped(packet.class_id(), DropReason::Shutdown, packet.size() as u64);
                    (packet, DropReason::Shutdown)
                })
                .collect::<Vec<_>>()
        };

        info!(pipeline = %self.shared.name, discarded = drops.len(), "pipeline stopped");
        self.shared.hooks.dropped(drops);
    }

    /// Offers a packet to the pipeline.
    ///
    /// The class is the one carried by the packet, or else the classifier's choice. Unknown
    /// classes are resolved with the configured [`UnknownClassPolicy`]. Returns
    /// [`PipelineError::NotRunning`] if the pipeline is not running; in that case the packet is
    /// not accounted anywhere.
    pub fn enqueue_packet(&self, packet: Packet) -> Result<Verdict> {
        let admitted = {
            let mut inner = self.shared.inner.lock();
            if inner.state != PipelineState::Running {
                return Err(PipelineError::NotRunning(inner.state));
            }

            let Inner { shaping, stats, .. } = &mut *inner;
            let shaping = shaping.as_mut().ok_or(PipelineError::NotConfigured)?;
            admit(shaping, stats, packet)
        };

        match admitted {
            Ok(class_id) => {
                self.shared.wake.notify_one();
                Ok(Verdict::Queued { class_id })
            }
            Err(Rejected { packet, reason }) => {
                debug!(pipeline = %self.shared.name, id = packet.id(), %reason, "packet dropped");
                self.shared.hooks.dropped([(packet, reason)]);
                Ok(Verdict::Dropped(reason))
            }
        }
    }

    /// Adds a class. Works in any configured state.
    pub fn add_class(&self, config: ClassConfig) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        let shaping = inner.shaping_mut()?;

        let applied = self.shared.options.apply_defaults(config.clone());
        shaping.scheduler.add_class(applied)?;
        shaping.config.classes.push(config);
        drop(inner);

        self.shared.wake.notify_one();
        Ok(())
    }

    /// Replaces the configuration of an existing class. Queued packets stay queued, unless the
    /// new class burst is smaller than they are (HTB ceil): those are dropped with
    /// [`DropReason::ExceedsBurst`].
    pub fn update_class(&self, config: ClassConfig) -> Result<()> {
        let class_id = config.id;
        let drops = {
            let mut inner = self.shared.inner.lock();
            let Inner { shaping, stats, .. } = &mut *inner;
            let shaping = shaping.as_mut().ok_or(PipelineError::NotConfigured)?;

            let applied = self.shared.options.apply_defaults(config.clone());
            let evicted = shaping.scheduler.update_class(applied)?;
            if let Some(slot) = shaping.config.classes.iter_mut().find(|c| c.id == class_id) {
                *slot = config;
            }

            evicted
                .into_iter()
                .map(|packet| {
                    let size = packet.size() as u64;
                    stats.on_dropped(Some(class_id), DropReason::ExceedsBurst, size);
                    (packet, DropReason::ExceedsBurst)
                })
                .collect::<Vec<_>>()
        };

        debug!(
            pipeline = %self.shared.name,
            class = class_id,
            dropped = drops.len(),
            "class updated"
        );
        self.shared.wake.notify_one();
        self.shared.hooks.dropped(drops);
        Ok(())
    }

    /// Removes a class. Packets still queued in it are dropped with [`DropReason::ClassRemoved`].
    pub fn remove_class(&self, class_id: ClassId) -> Result<()> {
        let drops = {
            let mut inner = self.shared.inner.lock();
            let Inner { shaping, stats, .. } = &mut *inner;
            let shaping = shaping.as_mut().ok_or(PipelineError::NotConfigured)?;

            if shaping.config.default_class() == Some(class_id) {
                return Err(ConfigError::DefaultClassRemoval(class_id).into());
            }

            let queued = shaping.scheduler.remove_class(class_id)?;
            shaping.config.classes.retain(|c| c.id != class_id);

            let drops: Vec<_> = queued
                .into_iter()
                .map(|packet| {
                    let size = packet.size() as u64;
                    stats.on_dropped(Some(class_id), DropReason::ClassRemoved, size);
                    (packet, DropReason::ClassRemoved)
                })
                .collect();
            stats.forget_class(class_id);
            drops
        };

        debug!(
            pipeline = %self.shared.name,
            class = class_id,
            dropped = drops.len(),
            "class removed"
        );
        self.shared.hooks.dropped(drops);
        Ok(())
    }

    /// Changes the aggregate rate. Takes effect for the next packet.
    pub fn set_rate(&self, rate: Rate) -> Result<()> {
        if rate.is_zero() {
            return Err(ConfigError::ZeroRate.into());
        }

        let mut inner = self.shared.inner.lock();
        let shaping = inner.shaping_mut()?;
        shaping.limiter.set_rate(rate);
        shaping.config.rate = rate;
        drop(inner);

        debug!(pipeline = %self.shared.name, %rate, "rate updated");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Changes the token bucket capacity. Queued packets larger than the new capacity are
    /// dropped with [`DropReason::ExceedsBurst`] when they reach the head of the schedule.
    pub fn set_burst(&self, burst_bytes: u64) -> Result<()> {
        if burst_bytes == 0 {
            return Err(ConfigError::ZeroBurst.into());
        }

        let mut inner = self.shared.inner.lock();
        let shaping = inner.shaping_mut()?;
        shaping.limiter.set_capacity(burst_bytes);
        shaping.config.burst_bytes = burst_bytes;
        drop(inner);

        debug!(pipeline = %self.shared.name, burst_bytes, "burst updated");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// A snapshot of the pipeline counters, backlog and class state.
    pub fn statistics(&self) -> PipelineStats {
        let inner = self.shared.inner.lock();
        let shaping = inner.shaping.as_ref();

        let view = PipelineView {
            name: &self.shared.name,
            state: inner.state,
            algorithm: shaping.map(|s| s.config.algorithm),
            bucket: shaping.map(|s| s.limiter.snapshot()),
            backlog: shaping
                .map(|s| Counters {
                    packets: s.scheduler.len() as u64,
                    bytes: s.scheduler.backlog_bytes(),
                })
                .unwrap_or_default(),
            classes: shaping.map(|s| s.scheduler.classes()).unwrap_or_default(),
        };

        inner.stats.snapshot(view)
    }

    /// Clears every counter. Queued packets are not affected, so until they drain the counters
    /// do not balance.
    pub fn reset_statistics(&self) {
        self.shared.inner.lock().stats.reset();
    }

    /// Waits for the next shaped packet from the egress channel.
    ///
    /// Only one receiver is served at a time; concurrent callers queue up.
    pub async fn recv(&self) -> Option<Packet> {
        self.shared.egress_rx.lock().await.recv().await
    }

    /// Like [`ShapingPipeline::recv`], giving up after `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Packet> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    /// Returns a shaped packet if one is ready, without waiting.
    pub fn try_recv(&self) -> Option<Packet> {
        self.shared.egress_rx.try_lock().ok()?.try_recv().ok()
    }
}

/// Classifies and admits a packet, returning its class. Every outcome is accounted.
fn admit(
    shaping: &mut Shaping,
    stats: &mut StatsCollector,
    packet: Packet,
) -> std::result::Result<ClassId, Rejected> {
    let size = packet.size() as u64;
    let requested = packet
        .class_id()
        .or_else(|| shaping.config.classifier.as_ref().map(|c| c.classify(&packet)));

    let resolved = match requested {
        Some(id) if shaping.scheduler.has_class(id) => Some(id),
        _ => match shaping.config.unknown_class {
            UnknownClassPolicy::DefaultClass(id) if shaping.scheduler.has_class(id) => Some(id),
            _ => None,
        },
    };

    stats.on_received(resolved, size);

    let Some(class_id) = resolved else {
        stats.on_dropped(None, DropReason::UnknownClass, size);
        return Err(Rejected::new(packet, DropReason::UnknownClass));
    };

    let rejected = if size == 0 {
        Some(DropReason::Malformed)
    } else if size > shaping.limiter.capacity() {
        Some(DropReason::ExceedsBurst)
    } else {
        None
    };
    if let Some(reason) = rejected {
        stats.on_dropped(Some(class_id), reason, size);
        return Err(Rejected::new(packet, reason));
    }

    // An explicit class that does not exist was resolved to the default class.
    let packet =
        if packet.class_id() == Some(class_id) { packet } else { packet.with_class(class_id) };

    match shaping.scheduler.enqueue(packet) {
        Ok(()) => {
            stats.on_enqueued(class_id, size);
            Ok(class_id)
        }
        Err(rejected) => {
            stats.on_dropped(Some(class_id), rejected.reason, size);
            Err(rejected)
        }
    }
}
