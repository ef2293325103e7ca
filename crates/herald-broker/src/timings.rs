//! Sampled latency capture for the inject and delivery paths.
//!
//! Collection only exists with the `telemetry` feature; without it every
//! function here compiles to a no-op and [`take_samples`] yields nothing.
use std::time::Duration;

/// Point on the hot path a sample was taken at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Channel registry lookup during inject.
    Lookup,
    /// Appending to the channel log.
    Push,
    /// One delivery loop run for a connection.
    Pass,
}

/// Nanosecond samples drained from the collector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliverySamples {
    pub lookup_ns: Vec<u64>,
    pub push_ns: Vec<u64>,
    pub pass_ns: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSummary {
    pub count: usize,
    pub p50: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl DeliverySamples {
    pub fn stage(&self, stage: Stage) -> &[u64] {
        match stage {
            Stage::Lookup => &self.lookup_ns,
            Stage::Push => &self.push_ns,
            Stage::Pass => &self.pass_ns,
        }
    }

    #[cfg(any(test, feature = "telemetry"))]
    fn stage_mut(&mut self, stage: Stage) -> &mut Vec<u64> {
        match stage {
            Stage::Lookup => &mut self.lookup_ns,
            Stage::Push => &mut self.push_ns,
            Stage::Pass => &mut self.pass_ns,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lookup_ns.is_empty() && self.push_ns.is_empty() && self.pass_ns.is_empty()
    }

    /// Nearest-rank percentiles for one stage; `None` when it has no samples.
    pub fn summary(&self, stage: Stage) -> Option<StageSummary> {
        let mut sorted = self.stage(stage).to_vec();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();
        let rank = |pct: usize| {
            let index = (sorted.len() * pct).div_ceil(100).saturating_sub(1);
            Duration::from_nanos(sorted[index])
        };
        Some(StageSummary {
            count: sorted.len(),
            p50: rank(50),
            p99: rank(99),
            max: Duration::from_nanos(sorted[sorted.len() - 1]),
        })
    }
}

#[cfg(feature = "telemetry")]
mod telemetry {
    include!("timings_telemetry.rs");
}

#[cfg(not(feature = "telemetry"))]
mod telemetry {
    use super::{DeliverySamples, Stage};

    pub fn enable_collection(_sample_every: usize) {}

    pub fn set_enabled(_enabled: bool) {}

    pub fn should_sample() -> bool {
        false
    }

    pub fn record(_stage: Stage, _value: u64) {}

    pub fn take_samples() -> Option<DeliverySamples> {
        None
    }
}

pub use telemetry::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_uses_nearest_rank() {
        let samples = DeliverySamples {
            pass_ns: (1..=100).rev().collect(),
            ..DeliverySamples::default()
        };
        let summary = samples.summary(Stage::Pass).expect("samples");
        assert_eq!(summary.count, 100);
        assert_eq!(summary.p50, Duration::from_nanos(50));
        assert_eq!(summary.p99, Duration::from_nanos(99));
        assert_eq!(summary.max, Duration::from_nanos(100));
        assert!(samples.summary(Stage::Lookup).is_none());
    }

    #[test]
    fn single_sample_is_every_percentile() {
        let mut samples = DeliverySamples::default();
        samples.stage_mut(Stage::Push).push(7);
        let summary = samples.summary(Stage::Push).expect("samples");
        assert_eq!(summary.p50, summary.max);
        assert!(!samples.is_empty());
    }

    #[cfg(not(feature = "telemetry"))]
    #[test]
    fn collection_is_inert_without_telemetry() {
        enable_collection(1);
        set_enabled(true);
        assert!(!should_sample());
        record(Stage::Lookup, 100);
        assert!(take_samples().is_none());
    }
}
