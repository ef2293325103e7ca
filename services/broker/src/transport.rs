//! In-memory connection transport over a bounded Tokio channel.
//!
//! The broker side (`QueueOutbound`) never blocks: a full queue reports
//! `Busy`, a dropped reader reports `Failed`. The reader side (`Inbox`) calls
//! the broker's completion hook after draining once a send was refused, which
//! restarts the delivery loop.
use anyhow::{Context, Result};
use bytes::Bytes;
use herald_broker::{Broker, Outbound, SendOutcome};
use herald_common::ids::ConnectionId;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug)]
pub struct QueueOutbound {
    tx: mpsc::Sender<Bytes>,
    // A send may have been refused since the reader last looked.
    stalled: AtomicBool,
    usage: AtomicUsize,
}

impl QueueOutbound {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let outbound = Arc::new(Self {
            tx,
            stalled: AtomicBool::new(false),
            usage: AtomicUsize::new(0),
        });
        (outbound, rx)
    }

    /// Streamers currently holding this connection.
    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Acquire)
    }

    fn take_stalled(&self) -> bool {
        self.stalled.swap(false, Ordering::AcqRel)
    }
}

impl Outbound for QueueOutbound {
    fn try_send(&self, payload: &Bytes) -> SendOutcome {
        // Raised before the attempt so a reader that frees a slot afterwards
        // always sees it.
        self.stalled.store(true, Ordering::Release);
        match self.tx.try_send(payload.clone()) {
            Ok(()) => {
                self.stalled.store(false, Ordering::Release);
                SendOutcome::Sent
            }
            Err(TrySendError::Full(_)) => SendOutcome::Busy,
            Err(TrySendError::Closed(_)) => SendOutcome::Failed,
        }
    }

    fn acquire_usage(&self) {
        self.usage.fetch_add(1, Ordering::AcqRel);
    }

    fn release_usage(&self) {
        self.usage.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Reader half of a connection registered with the broker.
pub struct Inbox {
    id: ConnectionId,
    broker: Arc<Broker>,
    outbound: Arc<QueueOutbound>,
    rx: mpsc::Receiver<Bytes>,
}

impl Inbox {
    /// Register a connection whose transport buffers up to `capacity` payloads.
    pub fn connect(broker: &Arc<Broker>, id: ConnectionId, capacity: usize) -> Result<Self> {
        let (outbound, rx) = QueueOutbound::new(capacity);
        broker
            .connect(id, outbound.clone())
            .with_context(|| format!("connect {id}"))?;
        Ok(Self {
            id,
            broker: Arc::clone(broker),
            outbound,
            rx,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn outbound(&self) -> &Arc<QueueOutbound> {
        &self.outbound
    }

    /// Next delivered payload; `None` once the broker side is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        let payload = self.rx.recv().await?;
        if self.outbound.take_stalled()
            && let Err(err) = self.broker.on_write_available(self.id)
        {
            tracing::warn!(connection = %self.id, error = %err, "resume after backpressure failed");
        }
        Some(payload)
    }

    /// Unregister from the broker and close the queue.
    pub fn close(mut self) {
        self.rx.close();
        self.broker.disconnect(self.id);
    }
}
