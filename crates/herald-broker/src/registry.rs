// Name -> channel map plus the snapshot of global channel names.
use ahash::RandomState;
use arc_swap::ArcSwap;
use bytes::Bytes;
use hashbrown::HashMap;
use herald_common::{ChannelInfo, ChannelOptions};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::channel::{Channel, Throttled};
use crate::timings::{self, Stage};
use crate::{BrokerError, MessageFactory, Result};
use crate::{t_now_if, t_should_sample};

pub(crate) struct Registry {
    channels: RwLock<HashMap<String, Arc<Channel>, RandomState>>,
    // Rebuilt on create/remove; read lock-free by `connect`.
    globals: ArcSwap<Vec<String>>,
    factory: Arc<dyn MessageFactory>,
}

impl Registry {
    pub(crate) fn new(factory: Arc<dyn MessageFactory>) -> Self {
        Self {
            channels: RwLock::new(HashMap::with_hasher(RandomState::new())),
            globals: ArcSwap::from_pointee(Vec::new()),
            factory,
        }
    }

    pub(crate) fn create(&self, name: &str, options: ChannelOptions) -> Result<Arc<Channel>> {
        options.validate().map_err(BrokerError::InvalidOptions)?;
        let mut channels = self.channels.write();
        if channels.contains_key(name) {
            return Err(BrokerError::ChannelExists(name.to_string()));
        }
        let global = options.global;
        let channel = Arc::new(Channel::new(name, options, Arc::clone(&self.factory)));
        channels.insert(name.to_string(), Arc::clone(&channel));
        if global {
            let mut globals = self.globals.load().as_ref().clone();
            globals.push(name.to_string());
            self.globals.store(Arc::new(globals));
        }
        Ok(channel)
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<Channel>> {
        let mut channels = self.channels.write();
        let channel = channels.remove(name)?;
        if channel.options().global {
            let globals = self
                .globals
                .load()
                .iter()
                .filter(|global| global.as_str() != name)
                .cloned()
                .collect();
            self.globals.store(Arc::new(globals));
        }
        Some(channel)
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().get(name).cloned()
    }

    pub(crate) fn globals(&self) -> Vec<Arc<Channel>> {
        let names = self.globals.load();
        let channels = self.channels.read();
        names
            .iter()
            .filter_map(|name| channels.get(name.as_str()).cloned())
            .collect()
    }

    pub(crate) fn dispose(&self, payload: Bytes) {
        self.factory.dispose(payload);
    }

    /// Look up, pre-encode and push. Every failure path disposes the payload.
    pub(crate) fn inject(
        &self,
        payload: Bytes,
        channel: &str,
        kill_key: &str,
        category: i32,
    ) -> Result<u64> {
        let sample = t_should_sample();
        let lookup_start = t_now_if(sample);
        let Some(target) = self.get(channel) else {
            self.factory.dispose(payload);
            return Err(BrokerError::ChannelNotFound(channel.to_string()));
        };
        if let Some(start) = lookup_start {
            let lookup_ns = start.elapsed().as_nanos() as u64;
            timings::record(Stage::Lookup, lookup_ns);
            t_histogram!("herald_inject_lookup_ns").record(lookup_ns as f64);
        }

        let payload = self.factory.pre_encode(payload);
        let push_start = t_now_if(sample);
        let pushed = target.push(payload, kill_key, category);
        if let Some(start) = push_start {
            let push_ns = start.elapsed().as_nanos() as u64;
            timings::record(Stage::Push, push_ns);
            t_histogram!("herald_inject_push_ns").record(push_ns as f64);
        }

        match pushed {
            Ok(seq) => {
                metrics::counter!("herald_channel_fill_total", "channel" => channel.to_owned())
                    .increment(1);
                Ok(seq)
            }
            Err(Throttled { payload }) => {
                self.factory.dispose(payload);
                Err(BrokerError::Throttled {
                    channel: channel.to_string(),
                })
            }
        }
    }

    pub(crate) fn evict(&self, kill_key: &str, category: i32, channel: &str) -> Result<bool> {
        let target = self
            .get(channel)
            .ok_or_else(|| BrokerError::ChannelNotFound(channel.to_string()))?;
        Ok(target.remove(kill_key, category))
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn infos(&self) -> Vec<ChannelInfo> {
        let channels: Vec<Arc<Channel>> = self.channels.read().values().cloned().collect();
        let mut infos: Vec<ChannelInfo> = channels.iter().map(|channel| channel.info()).collect();
        infos.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Free every live entry in every channel. Returns the number freed.
    pub(crate) fn drain_all(&self) -> usize {
        let channels: Vec<Arc<Channel>> = self.channels.read().values().cloned().collect();
        channels.iter().map(|channel| channel.drain_all()).sum()
    }
}
