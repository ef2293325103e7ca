// Broker service main entry point.
mod observability;

use anyhow::{Context, Result};
use broker::config;
use herald_broker::{Broker, timings};
use std::future::Future;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("herald-broker");

    let config = config::BrokerConfig::from_env_or_yaml()?;
    if config.disable_timings {
        timings::set_enabled(false);
    } else {
        timings::enable_collection(config.timings_sample_every);
    }

    let broker = Arc::new(Broker::new(config.broker_options()).context("start broker")?);
    for channel in &config.channels {
        broker
            .create_channel(&channel.name, channel.options.clone())
            .with_context(|| format!("create channel {}", channel.name))?;
    }
    tracing::info!(
        streamers = config.streamers,
        channels = config.channels.len(),
        "broker started"
    );

    // Expose Prometheus metrics on the configured bind address.
    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        Arc::clone(&broker),
        config.metrics_bind,
    ));

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    metrics_task.abort();
    // Joining the streamer threads blocks.
    tokio::task::spawn_blocking(move || broker.shutdown())
        .await
        .context("join broker shutdown")?;
    tracing::info!("broker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_without_config_file() -> Result<()> {
        let _g1 = EnvGuard::set("HERALD_METRICS_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::unset("HERALD_BROKER_CONFIG");
        run_with_shutdown(async {}).await?;
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_creates_configured_channels() -> Result<()> {
        let path = std::env::temp_dir().join(format!("herald-main-{}.yaml", std::process::id()));
        let mut file = std::fs::File::create(&path)?;
        writeln!(file, "streamers: 2")?;
        writeln!(file, "channels:")?;
        writeln!(file, "  - name: alerts")?;
        writeln!(file, "    priority: 10")?;
        drop(file);
        let _g1 = EnvGuard::set("HERALD_METRICS_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::set("HERALD_BROKER_CONFIG", path.to_str().expect("utf-8 path"));
        let result = run_with_shutdown(async {}).await;
        std::fs::remove_file(&path)?;
        result
    }

    #[tokio::test]
    #[serial]
    async fn invalid_channel_config_fails_startup() -> Result<()> {
        let path = std::env::temp_dir().join(format!("herald-bad-{}.yaml", std::process::id()));
        std::fs::write(&path, "channels:\n  - name: broken\n    max_messages: 0\n")?;
        let _g1 = EnvGuard::set("HERALD_METRICS_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::set("HERALD_BROKER_CONFIG", path.to_str().expect("utf-8 path"));
        let result = run_with_shutdown(async {}).await;
        std::fs::remove_file(&path)?;
        assert!(result.is_err());
        Ok(())
    }
}
