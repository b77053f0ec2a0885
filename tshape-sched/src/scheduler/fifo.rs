use std::collections::BTreeMap;

use super::{class_of, Algorithm, ClassDetail, ClassSnapshot, PacketScheduler};
use crate::{queue::ClassQueue, ClassConfig, ClassId, ConfigError, DropReason, Packet, Rejected};

/// Plain first in, first out scheduling across all classes.
///
/// This is the scheduler behind the `token_bucket` algorithm: packets leave in arrival order and
/// the pipeline token bucket alone decides the pace. Classes still exist so that each one can have
/// its own queue limit and be switched off.
#[derive(Debug, Default)]
pub struct Fifo {
    classes: BTreeMap<ClassId, ClassQueue<u64>>,
    next_seq: u64,
}

impl Fifo {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    fn select(&self) -> Option<ClassId> {
        self.classes
            .iter()
            .filter_map(|(id, queue)| queue.front().map(|(seq, _)| (*seq, *id)))
            .min()
            .map(|(_, id)| id)
    }
}

impl PacketScheduler for Fifo {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn add_class(&mut self, config: ClassConfig) -> Result<(), ConfigError> {
        config.validate(Algorithm::TokenBucket)?;
        if self.classes.contains_key(&config.id) {
            return Err(ConfigError::DuplicateClass(config.id));
        }
        self.classes.insert(config.id, ClassQueue::new(config));
        Ok(())
    }

    fn update_class(&mut self, config: ClassConfig) -> Result<Vec<Packet>, ConfigError> {
        config.validate(Algorithm::TokenBucket)?;
        let queue = self.classes.get_mut(&config.id).ok_or(ConfigError::UnknownClass(config.id))?;
        queue.set_config(config);
        Ok(Vec::new())
    }

    fn remove_class(&mut self, id: ClassId) -> Result<Vec<Packet>, ConfigError> {
        let mut queue = self.classes.remove(&id).ok_or(ConfigError::UnknownClass(id))?;
        Ok(queue.drain())
    }

    fn class_config(&self, id: ClassId) -> Option<&ClassConfig> {
        self.classes.get(&id).map(ClassQueue::config)
    }

    fn classes(&self) -> Vec<ClassSnapshot> {
        self.classes
            .iter()
            .map(|(id, queue)| ClassSnapshot {
                id: *id,
                name: queue.config().name.clone(),
                packets: queue.len(),
                bytes: queue.bytes(),
                active: queue.config().active,
                detail: ClassDetail::None,
            })
            .collect()
    }

    fn enqueue(&mut self, packet: Packet) -> Result<(), Rejected> {
        let (id, packet) = class_of(packet)?;
        let Some(queue) = self.classes.get_mut(&id) else {
            return Err(Rejected::new(packet, DropReason::UnknownClass));
        };

        if let Err(reason) = queue.admit(&packet) {
            return Err(Rejected::new(packet, reason));
        }

        queue.push(self.next_seq, packet);
        self.next_seq += 1;
        Ok(())
    }

    fn peek(&mut self) -> Option<&Packet> {
        let id = self.select()?;
        self.classes.get(&id)?.front().map(|(_, packet)| packet)
    }

    fn dequeue(&mut self) -> Option<Packet> {
        let id = self.select()?;
        self.classes.get_mut(&id)?.pop().map(|(_, packet)| packet)
    }

    fn len(&self) -> usize {
        self.classes.values().map(ClassQueue::len).sum()
    }

    fn backlog_bytes(&self) -> u64 {
        self.classes.values().map(ClassQueue::bytes).sum()
    }

    fn reset(&mut self) -> Vec<Packet> {
        // Drain in arrival order so callers see the packets the way they were queued.
        let mut queued: Vec<(u64, Packet)> = Vec::with_capacity(self.len());
        for queue in self.classes.values_mut() {
            while let Some(entry) = queue.pop() {
                queued.push(entry);
            }
        }
        queued.sort_by_key(|(seq, _)| *seq);
        queued.into_iter().map(|(_, packet)| packet).collect()
    }
}
