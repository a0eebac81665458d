//! Generic bounded-queue processing loop shared by every typed bus.
//!
//! Grounded on `ciris_engine.logic.buses.base_bus.BaseBus`. Most buses in this crate
//! execute calls synchronously at the call site rather than through the queue; the
//! queue exists to support deferred work and future streaming, matching the original's
//! comment to the same effect.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Common envelope for every bus message. Concrete buses extend this with a typed
/// payload (see `LLMBusMessage` et al.).
#[derive(Debug, Clone, Serialize)]
pub struct BusMessage {
    pub id: Uuid,
    pub handler_name: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: std::collections::HashMap<String, String>,
}

impl BusMessage {
    pub fn new(handler_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            handler_name: handler_name.into(),
            timestamp: Utc::now(),
            metadata: std::collections::HashMap::new(),
        }
    }
}

/// Implemented by each typed bus to process a message pulled off its queue.
#[async_trait]
pub trait MessageProcessor<M: Send + 'static>: Send + Sync + 'static {
    async fn process(&self, message: M);
}

#[derive(Debug, Default, Serialize)]
pub struct BusQueueStats {
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub processed_count: u64,
    pub failed_count: u64,
    pub running: bool,
}

/// Generic bounded-queue skeleton. `P` is the message-processing implementation for
/// one concrete bus; `M` is that bus's message payload type.
pub struct BaseBus<M: Send + 'static, P: MessageProcessor<M>> {
    sender: mpsc::Sender<M>,
    receiver: Mutex<Option<mpsc::Receiver<M>>>,
    processor: Arc<P>,
    capacity: usize,
    running: AtomicBool,
    processed_count: AtomicU64,
    failed_count: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Send + 'static, P: MessageProcessor<M>> BaseBus<M, P> {
    pub fn new(processor: P, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            processor: Arc::new(processor),
            capacity,
            running: AtomicBool::new(false),
            processed_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            task: Mutex::new(None),
        }
    }

    /// Non-blocking enqueue. Returns `false` (and logs) when the queue is full.
    pub fn enqueue(&self, message: M) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                error!("bus queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("bus queue closed, dropping message");
                false
            }
        }
    }

    /// Idempotent: a no-op if already running.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut receiver_guard = self.receiver.lock().await;
        let Some(mut receiver) = receiver_guard.take() else {
            return;
        };
        drop(receiver_guard);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                match tokio::time::timeout(POLL_TIMEOUT, receiver.recv()).await {
                    Ok(Some(message)) => {
                        debug!("processing bus message");
                        this.processor.process(message).await;
                        this.processed_count.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(None) => break, // sender dropped
                    Err(_) => continue, // poll timeout, loop to re-check `running`
                }
            }
            *this.receiver.lock().await = Some(receiver);
        });
        *self.task.lock().await = Some(handle);
    }

    /// Idempotent; completes quickly even on an idle bus since the processing loop
    /// polls on a short bounded timeout.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("bus processing task ended abnormally: {e}");
            }
        }
    }

    pub fn record_failure(&self) {
        self.failed_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BusQueueStats {
        BusQueueStats {
            queue_size: self.capacity - self.sender.capacity(),
            queue_capacity: self.capacity,
            processed_count: self.processed_count.load(Ordering::Relaxed),
            failed_count: self.failed_count.load(Ordering::Relaxed),
            running: self.running.load(Ordering::SeqCst),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingProcessor(Arc<AtomicU32>);

    #[async_trait]
    impl MessageProcessor<u32> for CountingProcessor {
        async fn process(&self, message: u32) {
            self.0.fetch_add(message, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn enqueue_drops_when_queue_full() {
        // Processing loop is never started, so the channel's one slot stays occupied.
        let bus = Arc::new(BaseBus::new(CountingProcessor(Arc::new(AtomicU32::new(0))), 1));
        assert!(bus.enqueue(1));
        assert!(!bus.enqueue(2));
    }

    #[tokio::test]
    async fn start_stop_is_idempotent_and_fast() {
        let bus = Arc::new(BaseBus::new(CountingProcessor(Arc::new(AtomicU32::new(0))), 10));
        bus.start().await;
        bus.start().await; // no-op
        assert!(bus.is_running());

        let started = std::time::Instant::now();
        bus.stop().await;
        bus.stop().await; // no-op
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!bus.is_running());
    }

    #[tokio::test]
    async fn messages_are_processed_once_running() {
        let counter = Arc::new(AtomicU32::new(0));
        let bus = Arc::new(BaseBus::new(CountingProcessor(counter.clone()), 10));
        bus.start().await;
        bus.enqueue(5);
        bus.enqueue(7);
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.stop().await;
        assert_eq!(counter.load(Ordering::Relaxed), 12);
        assert_eq!(bus.stats().processed_count, 2);
    }
}
