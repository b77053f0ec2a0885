use std::collections::BTreeMap;

use tracing::debug;

use super::{class_of, Algorithm, ClassDetail, ClassSnapshot, PacketScheduler};
use crate::{queue::ClassQueue, ClassConfig, ClassId, ConfigError, Packet, Rejected};

/// Fixed point shift applied to virtual time. `size / weight` is computed as
/// `(size << 32) / weight`, which keeps small weights and small packets distinguishable.
const VT_SHIFT: u32 = 32;

#[derive(Debug)]
struct WfqClass {
    queue: ClassQueue<u128>,
    last_finish: u128,
}

/// Weighted fair queueing.
///
/// Every admitted packet is stamped with a virtual finish time
/// `max(virtual_time, last_finish[class]) + size / weight[class]` and the packet with the smallest
/// finish time is served first. Virtual time only advances when a packet is serviced, so the
/// ordering is independent of wall clock time and of how late the dequeue loop wakes up. Over a
/// period where all classes stay backlogged, each class receives a share of the serviced bytes
/// proportional to its weight.
#[derive(Debug, Default)]
pub struct WeightedFairQueue {
    classes: BTreeMap<ClassId, WfqClass>,
    virtual_time: u128,
}

impl WeightedFairQueue {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time, in 2⁻³² byte units.
    pub fn virtual_time(&self) -> u128 {
        self.virtual_time
    }

    /// The class holding the head with the smallest finish time. Ties go to the lowest class id.
    fn select(&self) -> Option<ClassId> {
        self.classes
            .iter()
            .filter_map(|(id, class)| class.queue.front().map(|(finish, _)| (*finish, *id)))
            .min()
            .map(|(_, id)| id)
    }
}

impl PacketScheduler for WeightedFairQueue {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Wfq
    }

    fn add_class(&mut self, config: ClassConfig) -> Result<(), ConfigError> {
        config.validate(Algorithm::Wfq)?;
        if self.classes.contains_key(&config.id) {
            return Err(ConfigError::DuplicateClass(config.id));
        }

        debug!(class = config.id, weight = config.weight, "added wfq class");
        self.classes.insert(config.id, WfqClass { queue: ClassQueue::new(config), last_finish: 0 });
        Ok(())
    }

    fn update_class(&mut self, config: ClassConfig) -> Result<Vec<Packet>, ConfigError> {
        config.validate(Algorithm::Wfq)?;
        let class = self.classes.get_mut(&config.id).ok_or(ConfigError::UnknownClass(config.id))?;

        // Finish times of queued packets are kept: the new weight applies to new arrivals.
        class.queue.set_config(config);
        Ok(Vec::new())
    }

    fn remove_class(&mut self, id: ClassId) -> Result<Vec<Packet>, ConfigError> {
        let mut class = self.classes.remove(&id).ok_or(ConfigError::UnknownClass(id))?;
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
                detail: ClassDetail::Wfq { finish_time: class.last_finish },
            })
            .collect()
    }

    fn enqueue(&mut self, packet: Packet) -> Result<(), Rejected> {
        let (id, packet) = class_of(packet)?;
        let Some(class) = self.classes.get_mut(&id) else {
            return Err(Rejected::new(packet, crate::DropReason::UnknownClass));
        };

        if let Err(reason) = class.queue.admit(&packet) {
            return Err(Rejected::new(packet, reason));
        }

        let weight = class.queue.config().weight.max(1) as u128;
        let cost = ((packet.size() as u128) << VT_SHIFT) / weight;
        let finish = self.virtual_time.max(class.last_finish) + cost;

        class.last_finish = finish;
        class.queue.push(finish, packet);
        Ok(())
    }

    fn peek(&mut self) -> Option<&Packet> {
        let id = self.select()?;
        self.classes.get(&id)?.queue.front().map(|(_, packet)| packet)
    }

    fn dequeue(&mut self) -> Option<Packet> {
        let id = self.select()?;
        let (finish, packet) = self.classes.get_mut(&id)?.queue.pop()?;
        self.virtual_time = self.virtual_time.max(finish);
        Some(packet)
    }

    fn len(&self) -> usize {
        self.classes.values().map(|class| class.queue.len()).sum()
    }

    fn backlog_bytes(&self) -> u64 {
        self.classes.values().map(|class| class.queue.bytes()).sum()
    }

    fn reset(&mut self) -> Vec<Packet> {
        self.virtual_time = 0;
        self.classes
            .values_mut()
            .flat_map(|class| {
                class.last_finish = 0;
                class.queue.drain()
            })
            .collect()
    }
}
