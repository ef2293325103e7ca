// Console demo that pushes prioritized channels to in-memory connections.
use anyhow::{Context, Result};
use broker::transport::Inbox;
use bytes::Bytes;
use herald_broker::timings::{self, Stage};
use herald_broker::{Broker, BrokerOptions};
use herald_common::ChannelOptions;
use herald_common::ids::ConnectionId;
use std::sync::Arc;
use tokio::time::{Duration, timeout};

const CONNECTIONS: u64 = 4;
const TICKS: usize = 20;
const ALERTS: usize = 3;

#[tokio::main]
async fn main() -> Result<()> {
    println!("== Herald Push Demo ==");
    println!("Goal: show priority tiers, retention and backpressure on one broker.");

    timings::enable_collection(1);

    println!("Step 1/5: booting broker with 2 streamers.");
    let broker = Arc::new(Broker::new(BrokerOptions {
        streamers: 2,
        ..BrokerOptions::default()
    })?);
    broker.create_channel(
        "alerts",
        ChannelOptions::default().with_priority(10).with_quota(1),
    )?;
    broker.create_channel(
        "ticks",
        ChannelOptions::default()
            .with_priority(1)
            .with_max_messages(TICKS)
            .with_global(true),
    )?;

    println!("Step 2/5: retaining {TICKS} ticks before anyone connects.");
    for i in 0..TICKS {
        broker.inject(Bytes::from(format!("tick-{i}")), "ticks", "", 0)?;
    }

    println!("Step 3/5: connecting {CONNECTIONS} clients with 4-slot queues.");
    let mut inboxes = Vec::new();
    for id in 0..CONNECTIONS {
        let inbox = Inbox::connect(&broker, ConnectionId(id), 4)?;
        broker.subscribe(inbox.id(), "alerts", false)?;
        inboxes.push(inbox);
    }

    println!("Step 4/5: raising {ALERTS} alerts while the tick backlog drains.");
    for i in 0..ALERTS {
        broker.inject(Bytes::from(format!("alert-{i}")), "alerts", "", 0)?;
    }

    println!("Step 5/5: reading every connection.");
    let mut readers = Vec::new();
    for mut inbox in inboxes {
        readers.push(tokio::spawn(async move {
            let mut received = Vec::new();
            while received.len() < TICKS + ALERTS {
                match timeout(Duration::from_secs(2), inbox.recv()).await {
                    Ok(Some(payload)) => received.push(payload),
                    _ => break,
                }
            }
            let id = inbox.id();
            inbox.close();
            (id, received)
        }));
    }
    for reader in readers {
        let (id, received) = reader.await.context("join reader")?;
        let first_alert = received
            .iter()
            .position(|payload| payload.starts_with(b"alert"))
            .map_or_else(|| "none".to_string(), |index| index.to_string());
        println!(
            "{id}: received {} messages, first alert at position {first_alert}",
            received.len()
        );
    }

    for info in broker.channel_infos() {
        println!(
            "channel {}: depth={} pending_free={} high_water_mark={}",
            info.name, info.depth, info.pending_free, info.high_water_mark
        );
    }
    if let Some(samples) = timings::take_samples() {
        for stage in [Stage::Lookup, Stage::Push, Stage::Pass] {
            if let Some(summary) = samples.summary(stage) {
                println!(
                    "timings {stage:?}: n={} p50={:?} p99={:?} max={:?}",
                    summary.count, summary.p50, summary.p99, summary.max
                );
            }
        }
    }

    tokio::task::spawn_blocking(move || broker.shutdown())
        .await
        .context("join broker shutdown")?;
    println!("Done.");
    Ok(())
}
