use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{DeliverySamples, Stage};

// Process-wide; installed once by `enable_collection`.
struct Collector {
    samples: Mutex<DeliverySamples>,
    sample_every: usize,
    enabled: AtomicBool,
    seen: AtomicUsize,
}

static COLLECTOR: OnceLock<Collector> = OnceLock::new();

/// Start sampling one in `sample_every` operations. Later calls only
/// re-enable an existing collector.
pub fn enable_collection(sample_every: usize) {
    let collector = COLLECTOR.get_or_init(|| Collector {
        samples: Mutex::new(DeliverySamples::default()),
        sample_every: sample_every.max(1),
        enabled: AtomicBool::new(true),
        seen: AtomicUsize::new(0),
    });
    collector.enabled.store(true, Ordering::Relaxed);
}

pub fn set_enabled(enabled: bool) {
    if let Some(collector) = COLLECTOR.get() {
        collector.enabled.store(enabled, Ordering::Relaxed);
    }
}

pub fn should_sample() -> bool {
    COLLECTOR.get().is_some_and(|collector| {
        collector.enabled.load(Ordering::Relaxed)
            && collector.seen.fetch_add(1, Ordering::Relaxed) % collector.sample_every == 0
    })
}

pub fn record(stage: Stage, value: u64) {
    if let Some(collector) = COLLECTOR.get() {
        collector.samples.lock().stage_mut(stage).push(value);
    }
}

pub fn take_samples() -> Option<DeliverySamples> {
    let collector = COLLECTOR.get()?;
    Some(std::mem::take(&mut *collector.samples.lock()))
}
