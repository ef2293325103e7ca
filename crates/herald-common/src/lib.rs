// Shared data types and small helpers used across crates.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("config error: {0}")]
    Config(String),
}

pub mod ids {
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;

    /// Stable connection identifier used for tracing and streamer bookkeeping.
    ///
    /// ```
    /// use herald_common::ids::ConnectionId;
    ///
    /// let id: ConnectionId = "42".parse().expect("id");
    /// assert_eq!(id, ConnectionId(42));
    /// assert_eq!(id.to_string(), "conn-42");
    /// ```
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
    pub struct ConnectionId(pub u64);

    impl fmt::Display for ConnectionId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "conn-{}", self.0)
        }
    }

    impl FromStr for ConnectionId {
        type Err = Error;

        fn from_str(input: &str) -> Result<Self> {
            // Accept both the bare number and the display form.
            let digits = input.strip_prefix("conn-").unwrap_or(input);
            let value = digits
                .parse::<u64>()
                .map_err(|_| Error::InvalidId(input.into()))?;
            Ok(Self(value))
        }
    }
}

const DEFAULT_MAX_MESSAGES: usize = 100;
const DEFAULT_PRIORITY: u32 = 1;
const DEFAULT_QUOTA: u32 = 10;

/// Quality-of-service options for one channel.
///
/// Durations are carried as milliseconds so the struct reads naturally from
/// YAML/JSON; use the accessor methods to get [`Duration`] values.
///
/// ```
/// use herald_common::ChannelOptions;
///
/// let options = ChannelOptions::default();
/// assert_eq!(options.max_messages, 100);
/// assert!(options.fill_rate_period().is_none());
/// options.validate().expect("defaults are valid");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    // Live log capacity; oldest entries are evicted past this.
    pub max_messages: usize,
    // Higher values are drained first.
    pub priority: u32,
    // Messages sent from this channel before a same-priority sibling gets a turn.
    pub quota: u32,
    // Fill-rate window; 0 disables throttling.
    pub fill_rate_period_ms: u64,
    // Max accepted pushes per window; 0 disables throttling.
    pub fill_rate_max_messages: u32,
    // Messages older than this are never delivered.
    pub max_age_ms: Option<u64>,
    // Every new connection is subscribed automatically.
    pub global: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            priority: DEFAULT_PRIORITY,
            quota: DEFAULT_QUOTA,
            fill_rate_period_ms: 0,
            fill_rate_max_messages: 0,
            max_age_ms: None,
            global: false,
        }
    }
}

impl ChannelOptions {
    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_quota(mut self, quota: u32) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_fill_rate(mut self, period: Duration, max_messages: u32) -> Self {
        self.fill_rate_period_ms = period.as_millis() as u64;
        self.fill_rate_max_messages = max_messages;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_ms = Some(max_age.as_millis() as u64);
        self
    }

    pub fn with_global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    /// Active throttle window. A zero period or a zero cap means unlimited.
    pub fn fill_rate_period(&self) -> Option<Duration> {
        (self.fill_rate_period_ms > 0 && self.fill_rate_max_messages > 0)
            .then(|| Duration::from_millis(self.fill_rate_period_ms))
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_messages == 0 {
            return Err(Error::Config("max_messages must be greater than zero".into()));
        }
        if self.quota == 0 {
            return Err(Error::Config("quota must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Point-in-time view of one channel, used by diagnostics endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    // Live (deliverable) entries.
    pub depth: usize,
    // Evicted entries still referenced by an in-flight delivery.
    pub pending_free: usize,
    pub high_water_mark: u64,
}

impl fmt::Display for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "capacity={} priority={} quota={} global={}",
            self.max_messages, self.priority, self.quota, self.global
        )
    }
}
