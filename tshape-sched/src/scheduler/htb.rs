use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tracing::{debug, trace};
use tshape_common::{Clock, Rate};

use super::{class_of, Algorithm, ClassDetail, ClassSnapshot, PacketScheduler};
use crate::{
    queue::ClassQueue, ClassConfig, ClassId, ConfigError, DropReason, Packet, RateLimiter,
    Rejected, TokenBucket,
};

/// Whether a class can send within its guarantee or only by borrowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Tier {
    /// Within the guaranteed rate.
    Green,
    /// Above the guaranteed rate but below the ceil.
    Yellow,
}

#[derive(Debug)]
struct HtbClass {
    queue: ClassQueue,
    /// Guaranteed rate, from `min_bandwidth`.
    rate: Option<TokenBucket>,
    /// Upper bound, from `max_bandwidth`. No ceil means the class may borrow without limit.
    ceil: Option<TokenBucket>,
    borrowed_bytes: u64,
}

impl HtbClass {
    fn new(config: ClassConfig, clock: &Arc<dyn Clock>) -> Self {
        let rate = config.min_bandwidth.map(|rate| bucket(&config, rate, clock));
        let ceil = config.max_bandwidth.map(|rate| bucket(&config, rate, clock));
        Self { queue: ClassQueue::new(config), rate, ceil, borrowed_bytes: 0 }
    }

    /// The tier of the head packet, or `None` if the head must wait for the ceil.
    fn tier(&self) -> Option<Tier> {
        let size = self.queue.front()?.1.size() as u64;

        if self.ceil.as_ref().is_some_and(|ceil| ceil.available() < size) {
            return None;
        }
        if self.rate.as_ref().is_some_and(|rate| rate.available() >= size) {
            Some(Tier::Green)
        } else {
            Some(Tier::Yellow)
        }
    }

    fn ceil_capacity(&self) -> Option<u64> {
        self.ceil.as_ref().map(TokenBucket::capacity)
    }
}

fn bucket(config: &ClassConfig, rate: Rate, clock: &Arc<dyn Clock>) -> TokenBucket {
    TokenBucket::with_clock(config.effective_burst(rate), rate, Arc::clone(clock))
}

/// Applies a new rate to an existing bucket, keeping its tokens, or creates or drops the bucket.
fn sync_bucket(
    slot: &mut Option<TokenBucket>,
    config: &ClassConfig,
    rate: Option<Rate>,
    clock: &Arc<dyn Clock>,
) {
    match (slot.as_ref(), rate) {
        (Some(existing), Some(rate)) => {
            existing.set_rate(rate);
            existing.set_capacity(config.effective_burst(rate));
        }
        (None, Some(rate)) => *slot = Some(bucket(config, rate, clock)),
        (_, None) => *slot = None,
    }
}

/// A single level hierarchical token bucket.
///
/// Every class may have a guaranteed rate (`min_bandwidth`) and a ceil (`max_bandwidth`), each
/// enforced by its own token bucket. Selection happens in two tiers:
///
/// 1. classes whose head fits both their rate and their ceil ("green"),
/// 2. classes whose head only fits their ceil and must borrow ("yellow").
///
/// Within a tier the lowest [`priority`](ClassConfig::priority) value wins, and classes of equal
/// priority take turns. A class whose head exceeds its ceil tokens is held back until they refill;
/// [`PacketScheduler::next_eligible_in`] reports how long that is.
#[derive(Debug)]
pub struct HierarchicalTokenBucket {
    classes: BTreeMap<ClassId, HtbClass>,
    clock: Arc<dyn Clock>,
    /// Selection made by the last `peek`, kept until the next dequeue.
    selected: Option<ClassId>,
    last_served: Option<ClassId>,
}

impl HierarchicalTokenBucket {
    /// Creates an empty HTB whose class buckets read time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { classes: BTreeMap::new(), clock, selected: None, last_served: None }
    }

    fn select(&mut self) -> Option<ClassId> {
        if let Some(id) = self.selected {
            if self.classes.get(&id).is_some_and(|class| !class.queue.is_empty()) {
                return Some(id);
            }
        }

        let candidates: Vec<_> = self
            .classes
            .iter()
            .filter_map(|(id, class)| {
                class.tier().map(|tier| ((tier, class.queue.config().priority), *id))
            })
            .collect();

        let best = candidates.iter().map(|(key, _)| *key).min()?;
        let mut peers = candidates.iter().filter(|(key, _)| *key == best).map(|(_, id)| *id);

        // Round robin among equals: the first peer after the last served class, else the first.
        let first = peers.clone().next()?;
        let id = match self.last_served {
            Some(last) => peers.find(|id| *id > last).unwrap_or(first),
            None => first,
        };

        trace!(class = id, tier = ?best.0, priority = best.1, "htb selected class");
        self.selected = Some(id);
        Some(id)
    }
}

impl PacketScheduler for HierarchicalTokenBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Htb
    }

    fn add_class(&mut self, config: ClassConfig) -> Result<(), ConfigError> {
        config.validate(Algorithm::Htb)?;
        if self.classes.contains_key(&config.id) {
            return Err(ConfigError::DuplicateClass(config.id));
        }

        debug!(
            class = config.id,
            rate = ?config.min_bandwidth,
            ceil = ?config.max_bandwidth,
            priority = config.priority,
            "added htb class"
        );
        self.classes.insert(config.id, HtbClass::new(config, &self.clock));
        Ok(())
    }

    fn update_class(&mut self, config: ClassConfig) -> Result<Vec<Packet>, ConfigError> {
        config.validate(Algorithm::Htb)?;
        let class = self.classes.get_mut(&config.id).ok_or(ConfigError::UnknownClass(config.id))?;

        sync_bucket(&mut class.rate, &config, config.min_bandwidth, &self.clock);
        sync_bucket(&mut class.ceil, &config, config.max_bandwidth, &self.clock);
        class.queue.set_config(config);

        // A queued packet larger than the new ceil depth would block its class forever.
        let evicted = match class.ceil_capacity() {
            Some(capacity) => class.queue.evict_larger_than(capacity),
            None => Vec::new(),
        };
        if !evicted.is_empty() {
            debug!(class = class.queue.config().id, evicted = evicted.len(), "htb ceil shrank");
        }

        self.selected = None;
        Ok(evicted)
    }

    fn remove_class(&mut self, id: ClassId) -> Result<Vec<Packet>, ConfigError> {
        let mut class = self.classes.remove(&id).ok_or(ConfigError::UnknownClass(id))?;
        if self.selected == Some(id) {
            self.selected = None;
        }
        Ok(class.queue.drain())
    }

    fn class_config(&self, id: ClassId) -> Option<&ClassConfig> {
        self.classes.get(&id).map(|class| class.queue.config())
    }

    fn classes(&self) -> Vec<ClassSnapshot> {
        self.classes
            .iter()
            .map(|(id, class)| ClassSnapshot {
                id: *id,
                name: class.queue.config().name.clone(),
                packets: class.queue.len(),
                bytes: class.queue.bytes(),
                active: class.queue.config().active,
                detail: ClassDetail::Htb {
                    rate_tokens: class.rate.as_ref().map(TokenBucket::available),
                    ceil_tokens: class.ceil.as_ref().map(TokenBucket::available),
                    borrowed_bytes: class.borrowed_bytes,
                },
            })
            .collect()
    }

    fn enqueue(&mut self, packet: Packet) -> Result<(), Rejected> {
        let (id, packet) = class_of(packet)?;
        let Some(class) = self.classes.get_mut(&id) else {
            return Err(Rejected::new(packet, DropReason::UnknownClass));
        };

        // A packet larger than the ceil bucket could never become eligible.
        if class.ceil_capacity().is_some_and(|capacity| packet.size() as u64 > capacity) {
            return Err(Rejected::new(packet, DropReason::ExceedsBurst));
        }
        if let Err(reason) = class.queue.admit(&packet) {
            return Err(Rejected::new(packet, reason));
        }

        class.queue.push((), packet);
        Ok(())
    }

    fn peek(&mut self) -> Option<&Packet> {
        let id = self.select()?;
        self.classes.get(&id)?.queue.front().map(|(_, packet)| packet)
    }

    fn dequeue(&mut self) -> Option<Packet> {
        let id = self.select()?;
        let class = self.classes.get_mut(&id)?;
        let (_, packet) = class.queue.pop()?;
        let size = packet.size() as u64;

        // Ceil tokens only grow between selection and dequeue, so this always succeeds.
        if let Some(ceil) = &class.ceil {
            let granted = ceil.consume(size);
            debug_assert!(granted, "selected htb class exceeded its ceil");
        }
        if !class.rate.as_ref().is_some_and(|rate| rate.consume(size)) {
            class.borrowed_bytes += size;
        }

        self.selected = None;
        self.last_served = Some(id);
        Some(packet)
    }

    fn next_eligible_in(&self) -> Option<Duration> {
        if self.selected.is_some() {
            return Some(Duration::ZERO);
        }

        self.classes
            .values()
            .filter_map(|class| {
                let size = class.queue.front()?.1.size() as u64;
                match &class.ceil {
                    Some(ceil) => ceil.time_until(size),
                    None => Some(Duration::ZERO),
                }
            })
            .min()
    }

    fn len(&self) -> usize {
        self.classes.values().map(|class| class.queue.len()).sum()
    }

    fn backlog_bytes(&self) -> u64 {
        self.classes.values().map(|class| class.queue.bytes()).sum()
    }

    fn reset(&mut self) -> Vec<Packet> {
        self.selected = None;
        self.last_served = None;
        self.classes
            .values_mut()
            .flat_map(|class| {
                class.borrowed_bytes = 0;
                if let Some(rate) = &class.rate {
                    rate.reset();
                }
                if let Some(ceil) = &class.ceil {
                    ceil.reset();
                }
                class.queue.drain()
            })
            .collect()
    }
}
