// Recording doubles shared by the unit tests.
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use crate::{MessageFactory, Outbound, SendOutcome};

pub(crate) fn payload(text: &'static str) -> Bytes {
    Bytes::from_static(text.as_bytes())
}

/// Records every disposed payload and counts pre-encode calls.
#[derive(Debug, Default)]
pub(crate) struct CountingFactory {
    disposed: Mutex<Vec<Bytes>>,
    encoded: AtomicUsize,
}

impl CountingFactory {
    pub(crate) fn disposed(&self) -> Vec<Bytes> {
        self.disposed.lock().clone()
    }

    pub(crate) fn disposed_count(&self) -> usize {
        self.disposed.lock().len()
    }

    pub(crate) fn encoded(&self) -> usize {
        self.encoded.load(Ordering::Relaxed)
    }
}

impl MessageFactory for CountingFactory {
    fn pre_encode(&self, payload: Bytes) -> Bytes {
        self.encoded.fetch_add(1, Ordering::Relaxed);
        payload
    }

    fn dispose(&self, payload: Bytes) {
        self.disposed.lock().push(payload);
    }
}

/// Transport that replays scripted outcomes (then `Sent`) and records what it
/// accepted.
#[derive(Debug, Default)]
pub(crate) struct ScriptedOutbound {
    sent: Mutex<Vec<Bytes>>,
    script: Mutex<VecDeque<SendOutcome>>,
    attempts: AtomicUsize,
    write_in_progress: AtomicBool,
    usage: AtomicI64,
}

impl ScriptedOutbound {
    pub(crate) fn script(&self, outcomes: impl IntoIterator<Item = SendOutcome>) {
        self.script.lock().extend(outcomes);
    }

    pub(crate) fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    pub(crate) fn usage(&self) -> i64 {
        self.usage.load(Ordering::Relaxed)
    }

    pub(crate) fn set_write_in_progress(&self, value: bool) {
        self.write_in_progress.store(value, Ordering::Relaxed);
    }
}

impl Outbound for ScriptedOutbound {
    fn try_send(&self, payload: &Bytes) -> SendOutcome {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let outcome = self.script.lock().pop_front().unwrap_or(SendOutcome::Sent);
        if outcome == SendOutcome::Sent {
            self.sent.lock().push(payload.clone());
        }
        outcome
    }

    fn is_write_in_progress(&self) -> bool {
        self.write_in_progress.load(Ordering::Relaxed)
    }

    fn acquire_usage(&self) {
        self.usage.fetch_add(1, Ordering::Relaxed);
    }

    fn release_usage(&self) {
        self.usage.fetch_sub(1, Ordering::Relaxed);
    }
}
