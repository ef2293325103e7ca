use anyhow::{Context, Result, bail};
use herald_broker::BrokerOptions;
use herald_common::ChannelOptions;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

// Broker service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Streamer worker threads.
    pub streamers: usize,
    // Longest a streamer sleeps with nothing to do.
    pub streamer_idle_ms: u64,
    // Disable timing collection for lower overhead.
    pub disable_timings: bool,
    // Sample one in N operations when timings are on.
    pub timings_sample_every: usize,
    // Channels created at startup.
    pub channels: Vec<ChannelConfig>,
}

/// One channel declared in the YAML config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(flatten)]
    pub options: ChannelOptions,
}

const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";
const DEFAULT_STREAMERS: usize = 1;
const DEFAULT_STREAMER_IDLE_MS: u64 = 10;
const DEFAULT_DISABLE_TIMINGS: bool = false;
const DEFAULT_TIMINGS_SAMPLE_EVERY: usize = 128;

#[derive(Debug, Deserialize)]
struct BrokerConfigOverride {
    metrics_bind: Option<String>,
    streamers: Option<usize>,
    streamer_idle_ms: Option<u64>,
    disable_timings: Option<bool>,
    timings_sample_every: Option<usize>,
    #[serde(default)]
    channels: Vec<ChannelConfig>,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let metrics_bind = std::env::var("HERALD_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse HERALD_METRICS_BIND")?;
        let streamers = std::env::var("HERALD_STREAMERS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STREAMERS);
        let streamer_idle_ms = std::env::var("HERALD_STREAMER_IDLE_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STREAMER_IDLE_MS);
        let disable_timings = std::env::var("HERALD_DISABLE_TIMINGS")
            .ok()
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(DEFAULT_DISABLE_TIMINGS);
        let timings_sample_every = std::env::var("HERALD_TIMINGS_SAMPLE_EVERY")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_TIMINGS_SAMPLE_EVERY);
        Ok(Self {
            metrics_bind,
            streamers,
            streamer_idle_ms,
            disable_timings,
            timings_sample_every,
            channels: Vec::new(),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("HERALD_BROKER_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read HERALD_BROKER_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: BrokerConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse broker config yaml")?;
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.streamers
            && value > 0
        {
            self.streamers = value;
        }
        if let Some(value) = override_cfg.streamer_idle_ms
            && value > 0
        {
            self.streamer_idle_ms = value;
        }
        if let Some(value) = override_cfg.disable_timings {
            self.disable_timings = value;
        }
        if let Some(value) = override_cfg.timings_sample_every
            && value > 0
        {
            self.timings_sample_every = value;
        }
        for channel in &override_cfg.channels {
            channel
                .options
                .validate()
                .with_context(|| format!("channel {}", channel.name))?;
            if override_cfg
                .channels
                .iter()
                .filter(|other| other.name == channel.name)
                .count()
                > 1
            {
                bail!("channel {} declared more than once", channel.name);
            }
        }
        self.channels = override_cfg.channels;
        Ok(())
    }

    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            streamers: self.streamers,
            idle_interval: Duration::from_millis(self.streamer_idle_ms),
        }
    }
}
