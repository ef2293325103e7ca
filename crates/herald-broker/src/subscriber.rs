//! Per-connection delivery loop.
//!
//! A [`Subscriber`] owns the connection's [`Schedule`] and drains it into the
//! connection's [`Outbound`] transport. At most one delivery pass runs per
//! connection at a time; a pass that finds the slot taken returns at once and
//! asks the running pass to look again before it leaves.
use herald_common::ids::ConnectionId;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::channel::Channel;
use crate::schedule::Schedule;
use crate::timings::{self, Stage};
use crate::{DeliveryError, Outbound, SendOutcome};
use crate::{t_now_if, t_should_sample};

enum Pass {
    // Scheduler ran dry.
    Drained(usize),
    // Transport refused more data; its completion hook retriggers delivery.
    Blocked(usize),
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Subscriber {
    id: ConnectionId,
    outbound: Arc<dyn Outbound>,
    schedule: RwLock<Schedule>,
    // Single-flight slot for delivery passes.
    in_flight: AtomicBool,
    // Set when a tick was turned away while a pass was running.
    rerun: AtomicBool,
    // Last pass found nothing; cleared by any forced recheck.
    idle: AtomicBool,
    // Streamer worker that owns this connection.
    worker: OnceLock<usize>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("idle", &self.idle.load(Ordering::Relaxed))
            .field("worker", &self.worker.get())
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    pub fn new(id: ConnectionId, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            id,
            outbound,
            schedule: RwLock::new(Schedule::default()),
            in_flight: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            worker: OnceLock::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn outbound(&self) -> &Arc<dyn Outbound> {
        &self.outbound
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    pub(crate) fn worker(&self) -> Option<usize> {
        self.worker.get().copied()
    }

    pub(crate) fn assign_worker(&self, worker: usize) -> bool {
        self.worker.set(worker).is_ok()
    }

    /// Add a cursor for `channel`. Returns false when already subscribed.
    pub fn subscribe(&self, channel: Arc<Channel>, ignore_previous: bool) -> bool {
        let mut schedule = self.schedule.write();
        if schedule.contains(channel.name()) {
            return false;
        }
        tracing::debug!(
            connection = %self.id,
            channel = channel.name(),
            ignore_previous,
            "subscribed"
        );
        schedule.insert(channel, ignore_previous);
        self.idle.store(false, Ordering::Relaxed);
        true
    }

    pub fn unsubscribe(&self, channel: &str) -> bool {
        let removed = self.schedule.write().remove(channel);
        if removed {
            tracing::debug!(connection = %self.id, channel, "unsubscribed");
        }
        removed
    }

    pub fn unsubscribe_all(&self) {
        self.schedule.write().clear();
    }

    /// Subscribed channel names, highest priority first.
    pub fn subscriptions(&self) -> Vec<String> {
        self.schedule
            .read()
            .cursors()
            .map(|cursor| cursor.channel().name().to_string())
            .collect()
    }

    /// Run the delivery loop and return the number of messages handed to the
    /// transport. `force_recheck` discards the "nothing pending" shortcut.
    ///
    /// Only a hard transport failure is reported as an error; the caller is
    /// expected to tear the connection down.
    pub fn tick(&self, force_recheck: bool) -> Result<usize, DeliveryError> {
        if force_recheck {
            self.idle.store(false, Ordering::Relaxed);
        }
        let schedule = self.schedule.read();
        if schedule.is_empty() {
            return Ok(0);
        }
        // The transport's completion path will call back in.
        if self.outbound.is_write_in_progress() {
            return Ok(0);
        }
        if !force_recheck && self.idle.load(Ordering::Relaxed) {
            return Ok(0);
        }

        let sample = t_should_sample();
        let tick_start = t_now_if(sample);
        let mut sent = 0;
        let result = loop {
            if !self.try_enter() {
                // Flag the running pass, then retry once: if it already left
                // without seeing the flag, this caller runs the pass itself.
                self.rerun.store(true, Ordering::SeqCst);
                if !self.try_enter() {
                    break Ok(sent);
                }
            }
            self.rerun.store(false, Ordering::SeqCst);
            let pass = {
                let _in_flight = InFlight(&self.in_flight);
                self.drain(&schedule)
            };
            match pass {
                Ok(Pass::Drained(count)) => {
                    sent += count;
                    if !self.rerun.load(Ordering::SeqCst) {
                        break Ok(sent);
                    }
                }
                Ok(Pass::Blocked(count)) => break Ok(sent + count),
                Err(err) => break Err(err),
            }
        };

        if let Some(start) = tick_start {
            let tick_ns = start.elapsed().as_nanos() as u64;
            timings::record(Stage::Pass, tick_ns);
            t_histogram!("herald_delivery_tick_ns").record(tick_ns as f64);
        }
        result
    }

    fn try_enter(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn drain(&self, schedule: &Schedule) -> Result<Pass, DeliveryError> {
        let mut sent = 0;
        let mut from_tier = 0;
        // Once a tier runs dry the pass moves down and does not climb back up.
        while let Some((tier, lease)) = schedule.next_ready_from(from_tier) {
            from_tier = tier;
            let outcome = self.outbound.try_send(lease.payload());
            let delivered = outcome == SendOutcome::Sent;
            if delivered {
                metrics::counter!(
                    "herald_channel_sent_total",
                    "channel" => lease.channel().name().to_owned()
                )
                .increment(1);
            }
            schedule.tiers()[tier].complete(lease, delivered);
            match outcome {
                SendOutcome::Sent => sent += 1,
                SendOutcome::Busy => return Ok(Pass::Blocked(sent)),
                SendOutcome::Failed => {
                    tracing::debug!(connection = %self.id, "transport failed during delivery");
                    return Err(DeliveryError::TransportFailed(self.id));
                }
            }
        }
        self.idle.store(true, Ordering::Relaxed);
        Ok(Pass::Drained(sent))
    }
}
