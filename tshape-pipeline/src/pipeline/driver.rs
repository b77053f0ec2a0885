use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc::Permit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use tshape_sched::{DropReason, Packet, RateLimiter};

use super::{Inner, Shared};
use crate::hooks::EmitHook;

/// Packets the driver emits or drops back to back before yielding to the runtime. An emit hook
/// never awaits, so without this a long backlog would hold the worker thread until it drains.
const YIELD_EVERY: usize = 64;

/// What the driver should do next.
#[derive(Debug)]
enum Step {
    /// The token bucket granted this packet. Hand it downstream.
    Emit(Packet),
    /// This packet can never be granted and was dropped.
    Drop(Packet, DropReason),
    /// A packet is waiting for tokens. Check again after this long.
    Wait(Duration),
    /// Nothing is queued.
    Idle,
}

/// Where shaped packets go. Downstream capacity is reserved before a packet is taken out of the
/// scheduler, so a dequeued packet is never lost to a full channel.
enum Sink<'a> {
    Hook(EmitHook),
    Channel(Permit<'a, Packet>),
}

impl Sink<'_> {
    fn send(self, packet: Packet) {
        match self {
            Self::Hook(hook) => hook(packet),
            Self::Channel(permit) => permit.send(packet),
        }
    }
}

/// The pipeline's background task: takes packets out of the scheduler in algorithm order and
/// releases them as the token bucket allows.
pub(crate) struct Driver {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Driver {
    pub(crate) fn new(shared: Arc<Shared>, cancel: CancellationToken) -> Self {
        Self { shared, cancel }
    }

    pub(crate) async fn run(self) {
        info!("driver started");

        let mut streak = 0;
        loop {
            let sink = match self.shared.hooks.emit_hook() {
                Some(hook) => Sink::Hook(hook),
                None => tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    permit = self.shared.egress_tx.reserve() => match permit {
                        Ok(permit) => Sink::Channel(permit),
                        // The receiver lives in `Shared`, so this only happens during teardown.
                        Err(_) => break,
                    },
                },
            };

            match self.next_step() {
                Step::Emit(packet) => {
                    trace!(id = packet.id(), size = packet.size(), "packet emitted");
                    sink.send(packet);
                    streak += 1;
                }
                Step::Drop(packet, reason) => {
                    drop(sink);
                    debug!(id = packet.id(), size = packet.size(), %reason, "packet dropped");
                    self.shared.hooks.dropped([(packet, reason)]);
                    streak += 1;
                }
                Step::Wait(wait) => {
                    drop(sink);
                    streak = 0;
                    trace!(?wait, "waiting for tokens");

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = self.shared.wake.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Step::Idle => {
                    drop(sink);
                    streak = 0;

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = self.shared.wake.notified() => {}
                    }
                }
            }

            if streak >= YIELD_EVERY {
                streak = 0;
                tokio::task::yield_now().await;
            }
        }

        info!("driver stopped");
    }

    /// Makes one scheduling decision. Selection, token consumption, dequeue and accounting happen
    /// under a single lock.
    fn next_step(&self) -> Step {
        let poll_interval = self.shared.options.poll_interval;

        let mut inner = self.shared.inner.lock();
        let Inner { shaping, stats, .. } = &mut *inner;
        let Some(shaping) = shaping.as_mut() else {
            return Step::Idle;
        };

        let Some(head) = shaping.scheduler.peek() else {
            // Empty, or every queued packet is held back by its class (HTB ceil).
            return match shaping.scheduler.next_eligible_in() {
                Some(wait) if !shaping.scheduler.is_empty() => Step::Wait(wait.min(poll_interval)),
                _ => Step::Idle,
            };
        };

        let size = head.size() as u64;

        if size > shaping.limiter.capacity() {
            // The burst was lowered below the size of an already queued packet.
            return match shaping.scheduler.dequeue() {
                Some(packet) => {
                    stats.on_dropped(packet.class_id(), DropReason::ExceedsBurst, size);
                    Step::Drop(packet, DropReason::ExceedsBurst)
                }
                None => Step::Idle,
            };
        }

        if shaping.limiter.consume(size) {
            return match shaping.scheduler.dequeue() {
                Some(packet) => {
                    stats.on_dequeued(packet.class_id(), size);
                    Step::Emit(packet)
                }
                None => Step::Idle,
            };
        }

        let wait = shaping.limiter.time_until(size).unwrap_or(poll_interval);
        Step::Wait(wait.min(poll_interval))
    }
}
