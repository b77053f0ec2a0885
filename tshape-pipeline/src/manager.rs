use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::join_all;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, info};
use tshape_common::Rate;
use tshape_sched::{ClassConfig, ClassId, DropReason, Packet};

use crate::{
    hooks::DropHook, ManagerStats, PipelineError, PipelineOptions, PipelineStats, ShapingConfig,
    ShapingPipeline, Verdict,
};

/// Result of a [`ShaperManager`] operation.
pub type Result<T> = std::result::Result<T, ManagerError>;

/// Errors returned by the [`ShaperManager`].
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A pipeline with this name is already registered.
    #[error("pipeline already exists: {0}")]
    PipelineExists(String),
    /// No pipeline with this name.
    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),
    /// The pipeline refused the operation.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Drop hook that also receives the name of the pipeline the packet was dropped in.
type ManagerDropHook = Arc<dyn Fn(Packet, &str, DropReason) + Send + Sync>;

/// A registry of named [`ShapingPipeline`]s with shared lifecycle control and aggregated
/// statistics.
///
/// Every manager is independent: there is no global registry, and tests can create as many as
/// they need.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use tshape_pipeline::{ShaperManager, ShapingConfig};
/// use tshape_sched::{Algorithm, ClassConfig, Packet, Rate};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = ShaperManager::new();
/// let config = ShapingConfig::new(Algorithm::Wfq, Rate::from_bits_per_sec(8_000_000))
///     .with_class(ClassConfig::new(1).with_weight(2))
///     .with_class(ClassConfig::new(2))
///     .with_default_class(2);
///
/// manager.add_pipeline("eth0", config)?;
/// manager.start()?;
///
/// manager.process_packet("eth0", Packet::new(1500).with_class(1))?;
/// let shaped = manager.get_processed_packet("eth0", Duration::from_millis(100)).await?;
/// assert!(shaped.is_some());
///
/// manager.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ShaperManager {
    pipelines: RwLock<FxHashMap<String, ShapingPipeline>>,
    options: PipelineOptions,
    running: AtomicBool,
    drop_hook: RwLock<Option<ManagerDropHook>>,
}

impl std::fmt::Debug for ShaperManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaperManager")
            .field("pipelines", &self.pipeline_names())
            .field("options", &self.options)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ShaperManager {
    /// Creates an empty manager with default pipeline options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manager whose pipelines all use `options`.
    pub fn with_options(options: PipelineOptions) -> Self {
        Self { options, ..Default::default() }
    }

    /// Creates and configures a pipeline. If the manager is running, the pipeline is started
    /// right away.
    pub fn add_pipeline(
        &self,
        name: impl Into<String>,
        config: ShapingConfig,
    ) -> Result<ShapingPipeline> {
        let name = name.into();
        let mut pipelines = self.pipelines.write();
        if pipelines.contains_key(&name) {
            return Err(ManagerError::PipelineExists(name));
        }

        let pipeline = ShapingPipeline::configured(name.clone(), config, self.options.clone())?;
        if let Some(hook) = self.drop_hook.read().clone() {
            pipeline.set_shared_drop_hook(scoped_hook(&name, hook));
        }
        if self.is_running() {
            pipeline.start()?;
        }

        info!(pipeline = %name, "pipeline added");
        pipelines.insert(name, pipeline.clone());
        Ok(pipeline)
    }

    /// Stops and removes a pipeline, returning its final statistics.
    pub async fn remove_pipeline(&self, name: &str) -> Result<PipelineStats> {
        let pipeline = self
            .pipelines
            .write()
            .remove(name)
            .ok_or_else(|| ManagerError::PipelineNotFound(name.to_string()))?;

        pipeline.stop().await;
        info!(pipeline = %name, "pipeline removed");
        Ok(pipeline.statistics())
    }

    /// A handle to pipeline `name`.
    pub fn get_pipeline(&self, name: &str) -> Option<ShapingPipeline> {
        self.pipelines.read().get(name).cloned()
    }

    /// Names of all registered pipelines, sorted.
    pub fn pipeline_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.pipelines.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn pipeline(&self, name: &str) -> Result<ShapingPipeline> {
        self.get_pipeline(name).ok_or_else(|| ManagerError::PipelineNotFound(name.to_string()))
    }

    /// Offers a packet to the named pipeline. Never blocks.
    pub fn process_packet(&self, name: &str, packet: Packet) -> Result<Verdict> {
        Ok(self.pipeline(name)?.enqueue_packet(packet)?)
    }

    /// Waits up to `timeout` for the next shaped packet of the named pipeline.
    pub async fn get_processed_packet(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<Packet>> {
        let pipeline = self.pipeline(name)?;
        Ok(pipeline.recv_timeout(timeout).await)
    }

    /// Starts every registered pipeline, and every pipeline added from now on.
    pub fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let pipelines: Vec<_> = self.pipelines.read().values().cloned().collect();
        for pipeline in pipelines {
            pipeline.start()?;
        }

        info!("shaper manager started");
        Ok(())
    }

    /// Stops every pipeline and waits for their drivers to exit. Queued packets are discarded
    /// and accounted as [`DropReason::Shutdown`] drops.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let pipelines: Vec<_> = self.pipelines.read().values().cloned().collect();
        join_all(pipelines.iter().map(|pipeline| pipeline.stop())).await;

        info!(pipelines = pipelines.len(), "shaper manager stopped");
    }

    /// Whether [`ShaperManager::start`] was called more recently than `stop`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// See [`ShapingPipeline::add_class`].
    pub fn add_class(&self, name: &str, config: ClassConfig) -> Result<()> {
        Ok(self.pipeline(name)?.add_class(config)?)
    }

    /// See [`ShapingPipeline::update_class`].
    pub fn update_class(&self, name: &str, config: ClassConfig) -> Result<()> {
        Ok(self.pipeline(name)?.update_class(config)?)
    }

    /// See [`ShapingPipeline::remove_class`].
    pub fn remove_class(&self, name: &str, class_id: ClassId) -> Result<()> {
        Ok(self.pipeline(name)?.remove_class(class_id)?)
    }

    /// See [`ShapingPipeline::set_rate`].
    pub fn set_rate(&self, name: &str, rate: Rate) -> Result<()> {
        Ok(self.pipeline(name)?.set_rate(rate)?)
    }

    /// See [`ShapingPipeline::set_burst`].
    pub fn set_burst(&self, name: &str, burst_bytes: u64) -> Result<()> {
        Ok(self.pipeline(name)?.set_burst(burst_bytes)?)
    }

    /// Installs a drop hook on every current and future pipeline.
    pub fn set_drop_hook(&self, hook: impl Fn(Packet, &str, DropReason) + Send + Sync + 'static) {
        let hook: ManagerDropHook = Arc::new(hook);
        *self.drop_hook.write() = Some(Arc::clone(&hook));

        for (name, pipeline) in self.pipelines.read().iter() {
            pipeline.set_shared_drop_hook(scoped_hook(name, Arc::clone(&hook)));
        }
        debug!("drop hook installed");
    }

    /// Per pipeline statistics and manager wide totals.
    pub fn statistics(&self) -> ManagerStats {
        let pipelines: Vec<_> = self.pipelines.read().values().cloned().collect();
        ManagerStats::from_pipelines(pipelines.iter().map(ShapingPipeline::statistics).collect())
    }

    /// Clears the counters of every pipeline.
    pub fn reset_statistics(&self) {
        for pipeline in self.pipelines.read().values() {
            pipeline.reset_statistics();
        }
    }
}

/// Binds a manager drop hook to a pipeline name.
fn scoped_hook(name: &str, hook: ManagerDropHook) -> DropHook {
    let name: Arc<str> = Arc::from(name);
    Arc::new(move |packet: Packet, reason: DropReason| hook(packet, &*name, reason))
}
