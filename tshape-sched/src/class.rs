use tshape_common::{constants::MTU_ETHERNET, Rate};

use crate::{Algorithm, ClassId, ConfigError};

/// Default DRR quantum: one Ethernet MTU, so every visit can send at least one full sized packet.
pub const DEFAULT_QUANTUM: u32 = MTU_ETHERNET;

/// Configuration of a single traffic class.
///
/// Which fields matter depends on the scheduling algorithm:
///
/// - WFQ uses [`weight`](Self::weight).
/// - DRR uses [`quantum`](Self::quantum).
/// - HTB uses [`min_bandwidth`](Self::min_bandwidth) as the guaranteed rate,
///   [`max_bandwidth`](Self::max_bandwidth) as the ceil, [`priority`](Self::priority) and
///   [`burst`](Self::burst).
///
/// For WFQ and DRR the bandwidth bounds are advisory and only reported in snapshots. Queue limits
/// and the [`active`](Self::active) flag apply to every algorithm.
///
/// # Example
///
/// ```
/// use tshape_sched::{ClassConfig, Rate};
///
/// let voice = ClassConfig::new(1)
///     .with_name("voice")
///     .with_weight(4)
///     .with_max_bandwidth(Rate::from_bits_per_sec(2_000_000))
///     .with_max_queue_packets(64);
/// assert_eq!(voice.weight, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassConfig {
    /// Class identifier, unique within a pipeline.
    pub id: ClassId,
    /// Optional human readable label, only used in logs and snapshots.
    pub name: Option<String>,
    /// Relative share for WFQ. Must be greater than zero.
    pub weight: u32,
    /// Bytes of credit granted per DRR round. Must be greater than zero.
    pub quantum: u32,
    /// HTB priority. Lower values are served first.
    pub priority: u8,
    /// Guaranteed rate (HTB `rate`).
    pub min_bandwidth: Option<Rate>,
    /// Upper bound, including borrowed bandwidth (HTB `ceil`).
    pub max_bandwidth: Option<Rate>,
    /// Depth of the per class HTB buckets in bytes. Derived from the rate when unset.
    pub burst: Option<u64>,
    /// Queue limit in bytes.
    pub max_queue_bytes: Option<u64>,
    /// Queue limit in packets. Pipelines fill in a default when neither limit is set.
    pub max_queue_packets: Option<usize>,
    /// Packets classified into an inactive class are dropped.
    pub active: bool,
}

impl ClassConfig {
    /// Creates an active class with weight 1, an MTU sized quantum and no limits.
    pub fn new(id: ClassId) -> Self {
        Self {
            id,
            name: None,
            weight: 1,
            quantum: DEFAULT_QUANTUM,
            priority: 0,
            min_bandwidth: None,
            max_bandwidth: None,
            burst: None,
            max_queue_bytes: None,
            max_queue_packets: None,
            active: true,
        }
    }

    /// Sets a label for logs and snapshots.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the WFQ weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Sets the DRR quantum in bytes.
    pub fn with_quantum(mut self, quantum: u32) -> Self {
        self.quantum = quantum;
        self
    }

    /// Sets the HTB priority. Lower is served first.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the HTB guaranteed rate.
    pub fn with_min_bandwidth(mut self, rate: Rate) -> Self {
        self.min_bandwidth = Some(rate);
        self
    }

    /// Sets the HTB ceil.
    pub fn with_max_bandwidth(mut self, rate: Rate) -> Self {
        self.max_bandwidth = Some(rate);
        self
    }

    /// Sets the bucket depth in bytes.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    /// Limits the queue to `bytes`.
    pub fn with_max_queue_bytes(mut self, bytes: u64) -> Self {
        self.max_queue_bytes = Some(bytes);
        self
    }

    /// Limits the queue to `packets`.
    pub fn with_max_queue_packets(mut self, packets: usize) -> Self {
        self.max_queue_packets = Some(packets);
        self
    }

    /// Marks the class active or inactive.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Bucket depth for a class shaped at `rate`.
    ///
    /// Uses the configured burst if there is one, otherwise one eighth of a second worth of
    /// traffic, but never less than 10 MTUs so that full sized packets are not starved at low
    /// rates.
    pub fn effective_burst(&self, rate: Rate) -> u64 {
        self.burst.unwrap_or_else(|| {
            let min_burst = 10 * MTU_ETHERNET as u64;
            (rate.bytes_per_sec() / 8).max(min_burst)
        })
    }

    /// Returns `true` if the class has no queue limit of its own.
    pub fn is_unbounded(&self) -> bool {
        self.max_queue_bytes.is_none() && self.max_queue_packets.is_none()
    }

    /// Checks the class against the requirements of `algorithm`.
    pub fn validate(&self, algorithm: Algorithm) -> Result<(), ConfigError> {
        if self.max_queue_bytes == Some(0) || self.max_queue_packets == Some(0) {
            return Err(ConfigError::ZeroQueueLimit(self.id));
        }
        if self.burst == Some(0) {
            return Err(ConfigError::ZeroBurst);
        }

        match algorithm {
            Algorithm::Wfq if self.weight == 0 => Err(ConfigError::ZeroWeight(self.id)),
            Algorithm::Drr if self.quantum == 0 => Err(ConfigError::ZeroQuantum(self.id)),
            Algorithm::Htb => {
                if self.max_bandwidth.is_some_and(Rate::is_zero) {
                    return Err(ConfigError::ZeroCeil(self.id));
                }
                match (self.min_bandwidth, self.max_bandwidth) {
                    (Some(min), Some(max)) if min > max => {
                        Err(ConfigError::BandwidthBounds(self.id))
                    }
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }
}
