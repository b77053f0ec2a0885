use std::{
    collections::BTreeMap,
    ops::Bound::{Excluded, Unbounded},
};

use tracing::debug;

use super::{class_of, Algorithm, ClassDetail, ClassSnapshot, PacketScheduler};
use crate::{queue::ClassQueue, ClassConfig, ClassId, ConfigError, DropReason, Packet, Rejected};

#[derive(Debug)]
struct DrrClass {
    queue: ClassQueue,
    deficit: u64,
}

/// Deficit round robin.
///
/// Backlogged classes are visited in ascending class id order. Each visit credits the class with
/// its quantum, then serves head packets as long as they fit in the accumulated deficit. A head
/// that does not fit ends the visit; the remaining deficit carries over to the next round. A class
/// whose queue runs empty loses its deficit, so idle classes cannot bank credit.
///
/// Over a round, each class sends roughly `quantum` bytes regardless of how its traffic is split
/// into packets.
#[derive(Debug, Default)]
pub struct DeficitRoundRobin {
    classes: BTreeMap<ClassId, DrrClass>,
    /// The class currently being visited.
    current: Option<ClassId>,
    /// Whether the current visit has already been credited with a quantum.
    credited: bool,
}

impl DeficitRoundRobin {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// The first backlogged class after `after` in round robin order, wrapping around.
    fn next_backlogged(&self, after: Option<ClassId>) -> Option<ClassId> {
        let backlogged = |(id, class): (&ClassId, &DrrClass)| (!class.queue.is_empty()).then_some(*id);

        match after {
            Some(after) => self
                .classes
                .range((Excluded(after), Unbounded))
                .find_map(backlogged)
                .or_else(|| self.classes.range(..=after).find_map(backlogged)),
            None => self.classes.iter().find_map(backlogged),
        }
    }

    fn start_visit(&mut self, id: Option<ClassId>) {
        self.current = id;
        self.credited = false;
    }

    /// Runs the round robin until the head of some class fits its deficit, and returns that class.
    ///
    /// Selection only changes state when no head fits, so calling it again before a dequeue
    /// returns the same class.
    fn select(&mut self) -> Option<ClassId> {
        loop {
            let id = match self.current {
                Some(id) if self.classes.get(&id).is_some_and(|c| !c.queue.is_empty()) => id,
                current => {
                    let next = self.next_backlogged(current)?;
                    self.start_visit(Some(next));
                    next
                }
            };

            let class = self.classes.get_mut(&id)?;
            let head = class.queue.front()?.1.size() as u64;
            if head <= class.deficit {
                return Some(id);
            }

            if !self.credited {
                class.deficit += class.queue.config().quantum as u64;
                self.credited = true;
                continue;
            }

            let next = self.next_backlogged(Some(id));
            self.start_visit(next);
        }
    }
}

impl PacketScheduler for DeficitRoundRobin {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Drr
    }

    fn add_class(&mut self, config: ClassConfig) -> Result<(), ConfigError> {
        config.validate(Algorithm::Drr)?;
        if self.classes.contains_key(&config.id) {
            return Err(ConfigError::DuplicateClass(config.id));
        }

        debug!(class = config.id, quantum = config.quantum, "added drr class");
        self.classes.insert(config.id, DrrClass { queue: ClassQueue::new(config), deficit: 0 });
        Ok(())
    }

    fn update_class(&mut self, config: ClassConfig) -> Result<Vec<Packet>, ConfigError> {
        config.validate(Algorithm::Drr)?;
        let class = self.classes.get_mut(&config.id).ok_or(ConfigError::UnknownClass(config.id))?;
        class.queue.set_config(config);
        Ok(Vec::new())
    }

    fn remove_class(&mut self, id: ClassId) -> Result<Vec<Packet>, ConfigError> {
        let mut class = self.classes.remove(&id).ok_or(ConfigError::UnknownClass(id))?;
        if self.current == Some(id) {
            let next = self.next_backlogged(Some(id));
            self.start_visit(next);
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
                detail: ClassDetail::Drr { deficit: class.deficit },
            })
            .collect()
    }

    fn enqueue(&mut self, packet: Packet) -> Result<(), Rejected> {
        let (id, packet) = class_of(packet)?;
        let Some(class) = self.classes.get_mut(&id) else {
            return Err(Rejected::new(packet, DropReason::UnknownClass));
        };

        match class.queue.admit(&packet) {
            Ok(()) => {
                class.queue.push((), packet);
                Ok(())
            }
            Err(reason) => Err(Rejected::new(packet, reason)),
        }
    }

    fn peek(&mut self) -> Option<&Packet> {
        let id = self.select()?;
        self.classes.get(&id)?.queue.front().map(|(_, packet)| packet)
    }

    fn dequeue(&mut self) -> Option<Packet> {
        let id = self.select()?;
        let class = self.classes.get_mut(&id)?;
        let (_, packet) = class.queue.pop()?;

        class.deficit -= packet.size() as u64;
        if class.queue.is_empty() {
            class.deficit = 0;
            let next = self.next_backlogged(Some(id));
            self.start_visit(next);
        }

        Some(packet)
    }

    fn len(&self) -> usize {
        self.classes.values().map(|class| class.queue.len()).sum()
    }

    fn backlog_bytes(&self) -> u64 {
        self.classes.values().map(|class| class.queue.bytes()).sum()
    }

    fn reset(&mut self) -> Vec<Packet> {
        self.start_visit(None);
        self.classes
            .values_mut()
            .flat_map(|class| {
                class.deficit = 0;
                class.queue.drain()
            })
            .collect()
    }
}
