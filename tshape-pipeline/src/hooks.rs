//! Callbacks invoked by a pipeline for dropped and shaped packets.
//!
//! Hooks run synchronously where the event happens. Admission drops reach the drop hook on the
//! producer's thread, drops caused by `stop`, `remove_class`, `update_class` or `reconfigure` on
//! the caller's thread, and burst drops inside the driver task. Emit hooks always run inside the
//! driver task. They are always called without any pipeline lock held, so a hook may call back
//! into the pipeline. They should still be fast, since a slow emit hook stalls the pipeline.

use std::{fmt, sync::Arc};

use parking_lot::RwLock;
use tshape_sched::{DropReason, Packet};

/// Called once for every dropped packet.
pub type DropHook = Arc<dyn Fn(Packet, DropReason) + Send + Sync>;

/// Called once for every shaped packet, instead of sending it to the egress channel.
pub type EmitHook = Arc<dyn Fn(Packet) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Hooks {
    on_drop: RwLock<Option<DropHook>>,
    on_emit: RwLock<Option<EmitHook>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_drop", &self.on_drop.read().is_some())
            .field("on_emit", &self.on_emit.read().is_some())
            .finish()
    }
}

impl Hooks {
    pub(crate) fn set_drop(&self, hook: Option<DropHook>) {
        *self.on_drop.write() = hook;
    }

    pub(crate) fn set_emit(&self, hook: Option<EmitHook>) {
        *self.on_emit.write() = hook;
    }

    pub(crate) fn emit_hook(&self) -> Option<EmitHook> {
        self.on_emit.read().clone()
    }

    /// Hands every dropped packet to the drop hook, or discards them if there is none.
    pub(crate) fn dropped(&self, drops: impl IntoIterator<Item = (Packet, DropReason)>) {
        let hook = self.on_drop.read().clone();
        if let Some(hook) = hook {
            for (packet, reason) in drops {
                hook(packet, reason);
            }
        }
    }
}
