use std::{collections::HashSet, fmt, sync::Arc, time::Duration};

use tshape_common::{constants::MTU_ETHERNET, Clock, Rate, TokioClock};
use tshape_sched::{Algorithm, ClassConfig, ClassId, Classifier, ConfigError, PacketScheduler};

/// The default interval the driver sleeps for while it waits for tokens.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Queue limit applied to classes that do not set one.
const DEFAULT_QUEUE_PACKETS: usize = 1000;
/// The default number of shaped packets buffered for [`recv`](crate::ShapingPipeline::recv).
const DEFAULT_EGRESS_BUFFER: usize = 1024;

/// What to do with packets whose class does not exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownClassPolicy {
    /// Drop the packet with [`DropReason::UnknownClass`](tshape_sched::DropReason::UnknownClass).
    #[default]
    Drop,
    /// Send the packet to this class instead. The class must exist.
    DefaultClass(ClassId),
}

/// The shaping configuration of a pipeline.
///
/// # Example
///
/// ```
/// use tshape_pipeline::ShapingConfig;
/// use tshape_sched::{Algorithm, ClassConfig, DscpClassifier, Rate};
///
/// let config = ShapingConfig::new(Algorithm::Drr, Rate::from_bits_per_sec(10_000_000))
///     .with_class(ClassConfig::new(1).with_quantum(3000))
///     .with_class(ClassConfig::new(2).with_quantum(1500))
///     .with_classifier(DscpClassifier::new(2).with_mapping(46, 1))
///     .with_default_class(2);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct ShapingConfig {
    /// Scheduling algorithm across classes.
    pub algorithm: Algorithm,
    /// Aggregate rate of the pipeline token bucket.
    pub rate: Rate,
    /// Capacity of the pipeline token bucket.
    pub burst_bytes: u64,
    /// Traffic classes. At least one is required.
    pub classes: Vec<ClassConfig>,
    /// What happens to packets of a class that does not exist.
    pub unknown_class: UnknownClassPolicy,
    /// Classifies packets that do not carry a class id. Without one, such packets go through
    /// the unknown class policy.
    pub classifier: Option<Arc<dyn Classifier>>,
}

impl fmt::Debug for ShapingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapingConfig")
            .field("algorithm", &self.algorithm)
            .field("rate", &self.rate)
            .field("burst_bytes", &self.burst_bytes)
            .field("classes", &self.classes)
            .field("unknown_class", &self.unknown_class)
            .field("classifier", &self.classifier.is_some())
            .finish()
    }
}

impl ShapingConfig {
    /// Creates a configuration without classes. The burst defaults to one eighth of a second of
    /// traffic, with a floor of 10 MTUs.
    pub fn new(algorithm: Algorithm, rate: Rate) -> Self {
        Self {
            algorithm,
            rate,
            burst_bytes: default_burst(rate),
            classes: Vec::new(),
            unknown_class: UnknownClassPolicy::Drop,
            classifier: None,
        }
    }

    /// Builds a configuration from already parsed input: an algorithm tag
    /// (`token_bucket`, `wfq`, `drr` or `htb`), a rate in **bits** per second and a burst in
    /// bytes. This is the only place where bits are converted to bytes.
    pub fn from_params(
        algorithm: &str,
        rate_bps: u64,
        burst_bytes: u64,
    ) -> Result<Self, ConfigError> {
        let algorithm = algorithm.parse()?;
        let rate = Rate::from_bits_per_sec(rate_bps);
        Ok(Self::new(algorithm, rate).with_burst(burst_bytes))
    }

    /// Sets the pipeline bucket capacity in bytes.
    pub fn with_burst(mut self, burst_bytes: u64) -> Self {
        self.burst_bytes = burst_bytes;
        self
    }

    /// Adds a class.
    pub fn with_class(mut self, class: ClassConfig) -> Self {
        self.classes.push(class);
        self
    }

    /// Adds several classes.
    pub fn with_classes(mut self, classes: impl IntoIterator<Item = ClassConfig>) -> Self {
        self.classes.extend(classes);
        self
    }

    /// Classifies packets that arrive without a class id.
    pub fn with_classifier(mut self, classifier: impl Classifier) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// Routes packets of unknown classes to `class_id`.
    pub fn with_default_class(mut self, class_id: ClassId) -> Self {
        self.unknown_class = UnknownClassPolicy::DefaultClass(class_id);
        self
    }

    /// The configured default class, if any.
    pub fn default_class(&self) -> Option<ClassId> {
        match self.unknown_class {
            UnknownClassPolicy::DefaultClass(id) => Some(id),
            UnknownClassPolicy::Drop => None,
        }
    }

    /// Checks the configuration without building anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate.is_zero() {
            return Err(ConfigError::ZeroRate);
        }
        if self.burst_bytes == 0 {
            return Err(ConfigError::ZeroBurst);
        }
        if self.classes.is_empty() {
            return Err(ConfigError::NoClasses);
        }

        let mut seen = HashSet::with_capacity(self.classes.len());
        for class in &self.classes {
            class.validate(self.algorithm)?;
            if !seen.insert(class.id) {
                return Err(ConfigError::DuplicateClass(class.id));
            }
        }

        match self.default_class() {
            Some(id) if !seen.contains(&id) => Err(ConfigError::MissingDefaultClass(id)),
            _ => Ok(()),
        }
    }

    /// Validates the configuration and builds the scheduler with every class added.
    pub(crate) fn build_scheduler(
        &self,
        options: &PipelineOptions,
    ) -> Result<Box<dyn PacketScheduler>, ConfigError> {
        self.validate()?;

        let mut scheduler = self.algorithm.build(Arc::clone(&options.clock));
        for class in &self.classes {
            scheduler.add_class(options.apply_defaults(class.clone()))?;
        }

        Ok(scheduler)
    }
}

fn default_burst(rate: Rate) -> u64 {
    (rate.bytes_per_sec() / 8).max(10 * MTU_ETHERNET as u64)
}

/// Runtime options of a pipeline, independent of its shaping configuration.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub(crate) poll_interval: Duration,
    pub(crate) default_queue_packets: usize,
    pub(crate) egress_buffer: usize,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_queue_packets: DEFAULT_QUEUE_PACKETS,
            egress_buffer: DEFAULT_EGRESS_BUFFER,
            clock: Arc::new(TokioClock),
        }
    }
}

impl PipelineOptions {
    /// Sets the longest time the driver sleeps before re-checking the token bucket. The driver
    /// normally sleeps exactly until enough tokens are available; this bounds the wait when the
    /// bucket is reconfigured in the meantime.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the packet limit for classes that have neither a byte nor a packet limit.
    pub fn default_queue_packets(mut self, packets: usize) -> Self {
        self.default_queue_packets = packets.max(1);
        self
    }

    /// Sets how many shaped packets can wait in the egress channel before the driver stops
    /// dequeueing. Ignored when an emit hook is installed.
    pub fn egress_buffer(mut self, size: usize) -> Self {
        self.egress_buffer = size.max(1);
        self
    }

    /// Sets the clock used by the token buckets.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn apply_defaults(&self, mut class: ClassConfig) -> ClassConfig {
        if class.is_unbounded() {
            class.max_queue_packets = Some(self.default_queue_packets);
        }
        class
    }
}
