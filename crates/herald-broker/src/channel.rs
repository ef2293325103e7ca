//! Bounded, monotonically numbered message log for one channel.
//!
//! # Reclamation
//! Envelopes live in a slab. The `live` deque holds the slab keys of deliverable
//! entries in sequence order. An entry that leaves `live` (eviction or kill-key
//! removal) while a [`Lease`] still references it is parked on the pending-free
//! list and only handed to [`MessageFactory::dispose`] when the last lease is
//! released. Disposal always runs after the log lock is dropped.
use bytes::Bytes;
use herald_common::{ChannelInfo, ChannelOptions};
use parking_lot::Mutex;
use slab::Slab;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::MessageFactory;

#[derive(Debug)]
struct Envelope {
    seq: u64,
    kill_key: String,
    category: i32,
    payload: Bytes,
    // Leases currently handed out for this entry.
    refs: u32,
    // Evicted from `live` but still referenced.
    pending_free: bool,
    created_at: Instant,
}

#[derive(Debug, Default)]
struct FillRateWindow {
    started_at: Option<Instant>,
    count: u32,
}

impl FillRateWindow {
    fn admit(&mut self, period: Duration, max_messages: u32, now: Instant) -> bool {
        match self.started_at {
            Some(started_at) if now.duration_since(started_at) < period => {
                if self.count >= max_messages {
                    return false;
                }
                self.count += 1;
            }
            _ => {
                // Window elapsed (or never opened): start a fresh one with this push.
                self.started_at = Some(now);
                self.count = 1;
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct LogState {
    live: VecDeque<usize>,
    slots: Slab<Envelope>,
    pending_free: SmallVec<[usize; 4]>,
    // Last assigned sequence number; 0 means nothing was ever pushed.
    last_seq: u64,
    fill_rate: FillRateWindow,
}

impl LogState {
    // Take an entry out of circulation. Returns the payload when it can be freed now.
    fn retire(&mut self, key: usize) -> Option<Bytes> {
        let envelope = &mut self.slots[key];
        if envelope.refs == 0 {
            return Some(self.slots.remove(key).payload);
        }
        envelope.pending_free = true;
        self.pending_free.push(key);
        None
    }
}

/// Push rejected by the fill-rate throttle. The payload is handed back to the
/// caller, which owns its disposal.
#[derive(Debug)]
pub struct Throttled {
    pub payload: Bytes,
}

/// A counted reference to one log entry. Dropping it releases the reference.
pub struct Lease {
    channel: Arc<Channel>,
    slot: usize,
    seq: u64,
    payload: Bytes,
}

impl Lease {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("channel", &self.channel.name)
            .field("seq", &self.seq)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.channel.release_slot(self.slot, self.seq);
    }
}

/// One named channel: the bounded log plus its QoS options.
pub struct Channel {
    name: String,
    options: ChannelOptions,
    state: Mutex<LogState>,
    factory: Arc<dyn MessageFactory>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn new(
        name: impl Into<String>,
        options: ChannelOptions,
        factory: Arc<dyn MessageFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            options,
            state: Mutex::new(LogState::default()),
            factory,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Sequence number of the newest entry ever pushed (0 before the first push).
    pub fn high_water_mark(&self) -> u64 {
        self.state.lock().last_seq
    }

    pub fn len(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_free_len(&self) -> usize {
        self.state.lock().pending_free.len()
    }

    pub fn info(&self) -> ChannelInfo {
        let state = self.state.lock();
        ChannelInfo {
            name: self.name.clone(),
            depth: state.live.len(),
            pending_free: state.pending_free.len(),
            high_water_mark: state.last_seq,
        }
    }

    /// Append a payload and return its sequence number.
    ///
    /// The oldest live entry is evicted once the log is over capacity.
    pub fn push(&self, payload: Bytes, kill_key: &str, category: i32) -> Result<u64, Throttled> {
        let (seq, evicted) = {
            let mut state = self.state.lock();
            let now = Instant::now();
            if let Some(period) = self.options.fill_rate_period()
                && !state
                    .fill_rate
                    .admit(period, self.options.fill_rate_max_messages, now)
            {
                drop(state);
                metrics::counter!("herald_channel_throttled_total", "channel" => self.name.clone())
                    .increment(1);
                return Err(Throttled { payload });
            }

            let seq = state
                .last_seq
                .checked_add(1)
                .expect("channel sequence overflow");
            state.last_seq = seq;
            #[cfg(debug_assertions)]
            if let Some(&last) = state.live.back() {
                debug_assert!(state.slots[last].seq < seq);
            }
            let key = state.slots.insert(Envelope {
                seq,
                kill_key: kill_key.to_owned(),
                category,
                payload,
                refs: 0,
                pending_free: false,
                created_at: now,
            });
            state.live.push_back(key);

            let evicted = if state.live.len() > self.options.max_messages {
                metrics::counter!("herald_channel_evicted_total", "channel" => self.name.clone())
                    .increment(1);
                state.live.pop_front().and_then(|oldest| state.retire(oldest))
            } else {
                None
            };
            (seq, evicted)
        };

        if let Some(payload) = evicted {
            self.factory.dispose(payload);
        }
        Ok(seq)
    }

    /// Remove the first live entry carrying `kill_key` whose category differs
    /// from `category`. Returns whether an entry was removed.
    pub fn remove(&self, kill_key: &str, category: i32) -> bool {
        let freed = {
            let mut state = self.state.lock();
            let position = state.live.iter().position(|key| {
                let envelope = &state.slots[*key];
                envelope.kill_key == kill_key && envelope.category != category
            });
            let Some(key) = position.and_then(|position| state.live.remove(position)) else {
                return false;
            };
            state.retire(key)
        };

        if let Some(payload) = freed {
            self.factory.dispose(payload);
        }
        true
    }

    /// First live, unexpired entry with a sequence number above `cursor`.
    pub fn next_after(self: &Arc<Self>, cursor: u64) -> Option<Lease> {
        let max_age = self.options.max_age();
        let mut state = self.state.lock();
        let now = Instant::now();
        let LogState { live, slots, .. } = &mut *state;

        let start = live.partition_point(|key| slots[*key].seq <= cursor);
        let key = live.iter().skip(start).copied().find(|key| {
            max_age.is_none_or(|max_age| now.duration_since(slots[*key].created_at) <= max_age)
        })?;

        let envelope = &mut slots[key];
        envelope.refs += 1;
        Some(Lease {
            channel: Arc::clone(self),
            slot: key,
            seq: envelope.seq,
            payload: envelope.payload.clone(),
        })
    }

    /// Give a lease back. Equivalent to dropping it.
    pub fn release(&self, lease: Lease) {
        debug_assert!(std::ptr::eq(Arc::as_ptr(&lease.channel), self));
        drop(lease);
    }

    fn release_slot(&self, slot: usize, seq: u64) {
        let freed = {
            let mut state = self.state.lock();
            // Slot keys are reused; the sequence number tells a stale lease apart.
            let free_now = match state.slots.get_mut(slot) {
                Some(envelope) if envelope.seq == seq => {
                    envelope.refs = envelope.refs.saturating_sub(1);
                    envelope.pending_free && envelope.refs == 0
                }
                _ => return,
            };
            if !free_now {
                return;
            }
            state.pending_free.retain(|key| *key != slot);
            state.slots.remove(slot).payload
        };
        self.factory.dispose(freed);
    }

    /// Free every live entry regardless of outstanding leases. Used at shutdown,
    /// after delivery has been quiesced. Returns the number of entries freed.
    pub fn drain_all(&self) -> usize {
        let drained: Vec<Bytes> = {
            let mut state = self.state.lock();
            let LogState { live, slots, .. } = &mut *state;
            live.drain(..).map(|key| slots.remove(key).payload).collect()
        };
        let count = drained.len();
        for payload in drained {
            self.factory.dispose(payload);
        }
        count
    }
}
