//! Per-connection subscription cursors grouped into priority tiers.
//!
//! Tiers are ordered by descending priority. Inside a tier cursors are ordered by
//! descending quota (ties keep insertion order) and served round robin: the
//! "current" cursor keeps the turn until it has sent `quota` messages.
//!
//! The layout (which tiers and cursors exist) only changes under the owning
//! connection's write lock. Turn state (`current`, per-turn counters, last
//! delivered sequence) is mutated during a delivery pass under the read lock,
//! which is safe because the single-flight flag admits one pass at a time.
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::channel::{Channel, Lease};

#[derive(Debug)]
pub(crate) struct Cursor {
    channel: Arc<Channel>,
    last_delivered: AtomicU64,
    turn_count: AtomicU32,
}

impl Cursor {
    fn new(channel: Arc<Channel>, ignore_previous: bool) -> Self {
        let last_delivered = if ignore_previous {
            channel.high_water_mark()
        } else {
            0
        };
        Self {
            channel,
            last_delivered: AtomicU64::new(last_delivered),
            turn_count: AtomicU32::new(0),
        }
    }

    fn quota(&self) -> u32 {
        self.channel.options().quota
    }

    fn next_ready(&self) -> Option<Lease> {
        self.channel
            .next_after(self.last_delivered.load(Ordering::Relaxed))
    }

    pub(crate) fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    #[cfg(test)]
    pub(crate) fn last_delivered(&self) -> u64 {
        self.last_delivered.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub(crate) struct Tier {
    priority: u32,
    cursors: Vec<Cursor>,
    current: AtomicUsize,
}

impl Tier {
    fn new(cursor: Cursor) -> Self {
        Self {
            priority: cursor.channel.options().priority,
            cursors: vec![cursor],
            current: AtomicUsize::new(0),
        }
    }

    fn insert(&mut self, cursor: Cursor) {
        let quota = cursor.quota();
        let index = if quota > self.cursors[0].quota() {
            0
        } else {
            self.cursors
                .iter()
                .rposition(|existing| existing.quota() >= quota)
                .map_or(0, |position| position + 1)
        };
        // Keep the turn on the same cursor when it shifts right.
        let current = self.current.get_mut();
        if index <= *current {
            *current += 1;
        }
        self.cursors.insert(index, cursor);
    }

    fn remove(&mut self, channel: &str) -> bool {
        let Some(index) = self
            .cursors
            .iter()
            .position(|cursor| cursor.channel.name() == channel)
        else {
            return false;
        };
        self.cursors.remove(index);
        let current = self.current.get_mut();
        if index < *current {
            *current -= 1;
        }
        // Removing the current cursor hands the turn to its successor.
        if *current >= self.cursors.len() {
            *current = 0;
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn priority(&self) -> u32 {
        self.priority
    }

    #[cfg(test)]
    pub(crate) fn cursors(&self) -> &[Cursor] {
        &self.cursors
    }

    /// Scan from the current cursor (wrapping once) for the first channel with
    /// a deliverable message. The cursor that yields it takes the turn.
    pub(crate) fn next_ready(&self) -> Option<Lease> {
        let len = self.cursors.len();
        let start = self.current.load(Ordering::Relaxed) % len;
        let mut index = start;
        loop {
            if let Some(lease) = self.cursors[index].next_ready() {
                self.current.store(index, Ordering::Relaxed);
                return Some(lease);
            }
            index = (index + 1) % len;
            if index == start {
                return None;
            }
        }
    }

    /// Account for one delivery attempt made by the current cursor and release
    /// the lease. Every attempt counts toward the quota; the cursor position
    /// only moves past messages that were sent.
    pub(crate) fn complete(&self, lease: Lease, sent: bool) {
        let index = self.current.load(Ordering::Relaxed) % self.cursors.len();
        let cursor = &self.cursors[index];
        debug_assert!(Arc::ptr_eq(&cursor.channel, lease.channel()));
        if sent {
            cursor.last_delivered.store(lease.seq(), Ordering::Relaxed);
        }
        let turn_count = cursor.turn_count.fetch_add(1, Ordering::Relaxed) + 1;
        drop(lease);

        if turn_count >= cursor.quota() {
            cursor.turn_count.store(0, Ordering::Relaxed);
            self.current
                .store((index + 1) % self.cursors.len(), Ordering::Relaxed);
        }
    }
}

/// All subscriptions of one connection.
#[derive(Debug, Default)]
pub(crate) struct Schedule {
    tiers: Vec<Tier>,
}

impl Schedule {
    pub(crate) fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub(crate) fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub(crate) fn contains(&self, channel: &str) -> bool {
        self.cursors().any(|cursor| cursor.channel.name() == channel)
    }

    pub(crate) fn cursors(&self) -> impl Iterator<Item = &Cursor> {
        self.tiers.iter().flat_map(|tier| tier.cursors.iter())
    }

    pub(crate) fn insert(&mut self, channel: Arc<Channel>, ignore_previous: bool) {
        let priority = channel.options().priority;
        let cursor = Cursor::new(channel, ignore_previous);
        match self
            .tiers
            .iter()
            .position(|tier| tier.priority <= priority)
        {
            Some(index) if self.tiers[index].priority == priority => {
                self.tiers[index].insert(cursor)
            }
            Some(index) => self.tiers.insert(index, Tier::new(cursor)),
            None => self.tiers.push(Tier::new(cursor)),
        }
    }

    pub(crate) fn remove(&mut self, channel: &str) -> bool {
        let Some(index) = self.tiers.iter_mut().position(|tier| tier.remove(channel)) else {
            return false;
        };
        if self.tiers[index].cursors.is_empty() {
            self.tiers.remove(index);
        }
        true
    }

    pub(crate) fn clear(&mut self) {
        self.tiers.clear();
    }

    /// First tier at or below `from_tier` with a deliverable message.
    pub(crate) fn next_ready_from(&self, from_tier: usize) -> Option<(usize, Lease)> {
        self.tiers
            .iter()
            .enumerate()
            .skip(from_tier)
            .find_map(|(index, tier)| tier.next_ready().map(|lease| (index, lease)))
    }
}
