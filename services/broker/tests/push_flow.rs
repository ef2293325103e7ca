use broker::transport::Inbox;
use bytes::Bytes;
use herald_broker::{Broker, BrokerOptions};
use herald_common::ChannelOptions;
use herald_common::ids::ConnectionId;
use std::sync::Arc;
use tokio::time::{Duration, timeout};

async fn collect(inbox: &mut Inbox, count: usize) -> Vec<Bytes> {
    let mut received = Vec::with_capacity(count);
    while received.len() < count {
        let payload = timeout(Duration::from_secs(5), inbox.recv())
            .await
            .expect("delivery stalled")
            .expect("queue open");
        received.push(payload);
    }
    received
}

#[tokio::test]
async fn global_backlog_and_alerts_reach_a_slow_reader() {
    let broker = Arc::new(
        Broker::new(BrokerOptions {
            streamers: 2,
            idle_interval: Duration::from_millis(5),
        })
        .expect("broker"),
    );
    broker
        .create_channel(
            "ticks",
            ChannelOptions::default()
                .with_max_messages(5)
                .with_global(true),
        )
        .expect("create");
    broker
        .create_channel("alerts", ChannelOptions::default().with_priority(10))
        .expect("create");

    for i in 0..8 {
        broker
            .inject(Bytes::from(format!("tick-{i}")), "ticks", "", 0)
            .expect("inject");
    }

    let mut inbox = Inbox::connect(&broker, ConnectionId(1), 1).expect("connect");
    broker
        .subscribe(inbox.id(), "alerts", false)
        .expect("subscribe");

    // Only the five retained ticks are left; eviction dropped the first three.
    let mut received = collect(&mut inbox, 5).await;
    broker
        .inject(Bytes::from_static(b"alert-0"), "alerts", "", 0)
        .expect("inject");
    received.extend(collect(&mut inbox, 1).await);

    let expected: Vec<Bytes> = (3..8)
        .map(|i| Bytes::from(format!("tick-{i}")))
        .chain([Bytes::from_static(b"alert-0")])
        .collect();
    assert_eq!(received, expected);

    let ticks = broker.channel_info("ticks").expect("info");
    assert_eq!(ticks.depth, 5);
    assert_eq!(ticks.high_water_mark, 8);

    inbox.close();
    broker.shutdown();
}

#[tokio::test]
async fn evicted_entry_is_never_delivered() {
    let broker = Arc::new(Broker::new(BrokerOptions::default()).expect("broker"));
    broker
        .create_channel("quotes", ChannelOptions::default())
        .expect("create");
    broker
        .inject(Bytes::from_static(b"EURUSD 1.08"), "quotes", "EURUSD", 1)
        .expect("inject");
    broker
        .inject(Bytes::from_static(b"USDJPY 151"), "quotes", "USDJPY", 1)
        .expect("inject");
    assert!(broker.evict("EURUSD", 0, "quotes").expect("evict"));

    let mut inbox = Inbox::connect(&broker, ConnectionId(7), 8).expect("connect");
    broker
        .subscribe(inbox.id(), "quotes", false)
        .expect("subscribe");
    let received = collect(&mut inbox, 1).await;
    assert_eq!(received, vec![Bytes::from_static(b"USDJPY 151")]);

    inbox.close();
    broker.shutdown();
}
