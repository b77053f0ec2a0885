//! Packet classifiers.
//!
//! A classifier maps a [`Packet`] to the [`ClassId`] of the queue it should be admitted to. It is
//! a pure function: it must not mutate shared state and should return quickly, since it runs on
//! the producer's thread for every packet.

use std::{collections::HashMap, fmt};

use crate::{ClassId, Packet};

/// Picks the class of a packet.
pub trait Classifier: Send + Sync + 'static {
    /// Returns the class `packet` belongs to. Must not block.
    fn classify(&self, packet: &Packet) -> ClassId;
}

impl<F> Classifier for F
where
    F: Fn(&Packet) -> ClassId + Send + Sync + 'static,
{
    fn classify(&self, packet: &Packet) -> ClassId {
        self(packet)
    }
}

/// Maps the 6-bit DSCP code point to a class.
#[derive(Debug, Clone)]
pub struct DscpClassifier {
    table: [Option<ClassId>; 64],
    default_class: ClassId,
}

impl DscpClassifier {
    /// Creates a classifier that sends every code point to `default_class`.
    pub fn new(default_class: ClassId) -> Self {
        Self { table: [None; 64], default_class }
    }

    /// Maps `dscp` (low 6 bits) to `class_id`.
    pub fn with_mapping(mut self, dscp: u8, class_id: ClassId) -> Self {
        self.table[(dscp & 0x3f) as usize] = Some(class_id);
        self
    }

    /// A common 4 class layout: EF (46) → `voice`, AF4x → `video`, AF3x/AF2x/CS3 →
    /// `critical`, everything else → `best_effort`.
    pub fn diffserv(voice: ClassId, video: ClassId, critical: ClassId, best_effort: ClassId) -> Self {
        let mut classifier = Self::new(best_effort).with_mapping(46, voice);
        for dscp in [34, 36, 38] {
            classifier = classifier.with_mapping(dscp, video);
        }
        for dscp in [18, 20, 22, 24, 26, 28, 30] {
            classifier = classifier.with_mapping(dscp, critical);
        }
        classifier
    }
}

impl Classifier for DscpClassifier {
    fn classify(&self, packet: &Packet) -> ClassId {
        self.table[(packet.dscp() & 0x3f) as usize].unwrap_or(self.default_class)
    }
}

/// Maps the packet priority field to a class.
#[derive(Debug, Clone)]
pub struct PriorityClassifier {
    map: HashMap<u8, ClassId>,
    default_class: ClassId,
}

impl PriorityClassifier {
    /// Creates a classifier that sends every priority to `default_class`.
    pub fn new(default_class: ClassId) -> Self {
        Self { map: HashMap::new(), default_class }
    }

    /// Sends packets of `priority` to `class_id`.
    pub fn with_mapping(mut self, priority: u8, class_id: ClassId) -> Self {
        self.map.insert(priority, class_id);
        self
    }
}

impl Classifier for PriorityClassifier {
    fn classify(&self, packet: &Packet) -> ClassId {
        self.map.get(&packet.priority()).copied().unwrap_or(self.default_class)
    }
}

/// Wraps a closure as a named classifier, so it can be debug printed in configurations.
pub struct FnClassifier<F> {
    name: &'static str,
    f: F,
}

impl<F> FnClassifier<F>
where
    F: Fn(&Packet) -> ClassId + Send + Sync + 'static,
{
    /// Wraps `f`. The name is shown in debug output.
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> fmt::Debug for FnClassifier<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnClassifier").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<F> Classifier for FnClassifier<F>
where
    F: Fn(&Packet) -> ClassId + Send + Sync + 'static,
{
    fn classify(&self, packet: &Packet) -> ClassId {
        (self.f)(packet)
    }
}
