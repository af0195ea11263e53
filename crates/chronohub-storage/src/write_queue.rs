//! Write-behind delivery from the fast tier to long-term single storage.
//!
//! ```text
//!   insert ──► fast tier (ack) ──► add(intent) ──► [bounded queue] ──► worker pool ──► single store
//!                                      │                                  │
//!                                 full: drop + count          fast tier miss: drop as expired
//! ```
//!
//! Producers never wait: a full queue drops the intent and the verifier picks the item up on its
//! next pass. Delivery is at-least-once and unordered; single store writes are idempotent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chronohub_core::{ChannelContentKey, ContentKey};
use chronohub_observability::metrics::{
    WRITE_QUEUE_ACCEPTED_TOTAL, WRITE_QUEUE_AGE, WRITE_QUEUE_DEPTH, WRITE_QUEUE_DROPPED_TOTAL,
    WRITE_QUEUE_RESULTS_TOTAL,
};

use crate::config::WriteQueueConfig;
use crate::dao::ContentDao;
use crate::error::{Error, Result};

struct QueuedIntent {
    intent: ChannelContentKey,
    enqueued: Instant,
}

enum Delivery {
    Written,
    Expired,
}

/// Counters for one queue instance.
#[derive(Debug, Default)]
pub struct WriteQueueStats {
    pub accepted: AtomicU64,
    pub dropped: AtomicU64,
    pub written: AtomicU64,
    pub expired: AtomicU64,
    pub failed: AtomicU64,
}

pub struct WriteQueue {
    config: WriteQueueConfig,
    sender: mpsc::Sender<QueuedIntent>,
    receiver: Arc<Mutex<mpsc::Receiver<QueuedIntent>>>,
    spoke: Arc<dyn ContentDao>,
    single: Arc<dyn ContentDao>,
    stats: WriteQueueStats,
    started: AtomicBool,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteQueue {
    pub fn new(
        config: WriteQueueConfig,
        spoke: Arc<dyn ContentDao>,
        single: Arc<dyn ContentDao>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_size.max(1));
        Self {
            config,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            spoke,
            single,
            stats: WriteQueueStats::default(),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Queues a copy of `key` to long-term storage. Returns false if the intent was dropped.
    pub fn add(&self, channel: &str, key: &ContentKey) -> bool {
        let item = QueuedIntent {
            intent: ChannelContentKey::new(channel, key.clone()),
            enqueued: Instant::now(),
        };
        match self.sender.try_send(item) {
            Ok(()) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                WRITE_QUEUE_ACCEPTED_TOTAL.inc();
                WRITE_QUEUE_DEPTH.set(self.len() as i64);
                true
            }
            Err(mpsc::error::TrySendError::Full(item)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                WRITE_QUEUE_DROPPED_TOTAL.inc();
                warn!(intent = %item.intent, queue_size = self.config.queue_size, "Write queue full, intent dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                WRITE_QUEUE_DROPPED_TOTAL.inc();
                warn!(intent = %item.intent, "Write queue closed, intent dropped");
                false
            }
        }
    }

    /// Intents waiting for a worker.
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &WriteQueueStats {
        &self.stats
    }

    /// Spawns the worker pool.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        let mut workers = self.workers.lock().await;
        for worker in 0..self.config.threads.max(1) {
            workers.push(tokio::spawn(self.clone().run_worker(worker)));
        }
        info!(
            threads = workers.len(),
            queue_size = self.config.queue_size,
            "Write queue started"
        );
        Ok(())
    }

    /// Waits up to `shutdown_wait_secs` for the queue to drain, then stops the workers.
    ///
    /// Intents still queued after the wait are abandoned; the verifier repairs them later.
    pub async fn shutdown(&self) {
        let deadline = Instant::now() + Duration::from_secs(self.config.shutdown_wait_secs);
        while !self.is_empty() && Instant::now() < deadline && self.started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.shutdown.cancel();
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Write queue worker did not stop cleanly");
            }
        }

        let remaining = self.len();
        if remaining > 0 {
            warn!(remaining, "Write queue stopped with intents still queued");
        } else {
            info!("Write queue drained and stopped");
        }
    }

    async fn run_worker(self: Arc<Self>, worker: usize) {
        let poll = Duration::from_millis(self.config.poll_timeout_ms);
        debug!(worker, "Write queue worker started");
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = self.dequeue(poll) => next,
            };
            if let Some(item) = next {
                self.deliver(item).await;
            }
        }
        debug!(worker, "Write queue worker stopped");
    }

    async fn dequeue(&self, poll: Duration) -> Option<QueuedIntent> {
        let mut receiver = self.receiver.lock().await;
        let item = tokio::time::timeout(poll, receiver.recv()).await.ok().flatten();
        WRITE_QUEUE_DEPTH.set(self.len() as i64);
        item
    }

    async fn deliver(&self, item: QueuedIntent) {
        let QueuedIntent { intent, enqueued } = item;
        let result = match self.copy(&intent).await {
            Ok(Delivery::Written) => {
                self.stats.written.fetch_add(1, Ordering::Relaxed);
                WRITE_QUEUE_AGE.observe(enqueued.elapsed().as_secs_f64());
                "written"
            }
            Ok(Delivery::Expired) => {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                warn!(intent = %intent, "Item left the fast tier before it was copied");
                "expired"
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(intent = %intent, error = %e, "Long-term write abandoned");
                "failed"
            }
        };
        WRITE_QUEUE_RESULTS_TOTAL.with_label_values(&[result]).inc();
    }

    async fn copy(&self, intent: &ChannelContentKey) -> Result<Delivery> {
        let Some(content) = self.spoke.get(&intent.channel, &intent.key).await? else {
            return Ok(Delivery::Expired);
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.single.insert(&intent.channel, content.clone()).await {
                Ok(_) => {
                    debug!(intent = %intent, attempt, "Copied to long-term storage");
                    return Ok(Delivery::Written);
                }
                Err(e) if attempt + 1 < max_attempts => {
                    let backoff = self.config.backoff(attempt);
                    warn!(
                        intent = %intent,
                        attempt = attempt + 1,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Long-term write failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{create_single, create_spoke, eventually, FlakyDao};
    use chronohub_core::Content;

    fn test_config() -> WriteQueueConfig {
        WriteQueueConfig {
            queue_size: 10,
            threads: 2,
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            poll_timeout_ms: 50,
            shutdown_wait_secs: 2,
        }
    }

    #[tokio::test]
    async fn test_copies_to_single_store() {
        let (spoke, _store, _dir) = create_spoke(60).await;
        let single = create_single();
        let queue = Arc::new(WriteQueue::new(test_config(), spoke.clone(), single.clone()));
        queue.start().await.unwrap();

        let key = spoke.insert("orders", Content::new("payload")).await.unwrap();
        assert!(queue.add("orders", &key));

        let copied = eventually(Duration::from_secs(2), || async {
            single.get("orders", &key).await.unwrap().is_some()
        })
        .await;
        assert!(copied);
        queue.shutdown().await;
        assert_eq!(queue.stats().written.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let (spoke, _store, _dir) = create_spoke(60).await;
        let config = WriteQueueConfig {
            queue_size: 1,
            ..test_config()
        };
        let queue = WriteQueue::new(config, spoke, create_single());
        let key = ContentKey::new_now();
        assert!(queue.add("orders", &key));
        assert!(!queue.add("orders", &key));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_item_is_expired_not_retried() {
        let (spoke, _store, _dir) = create_spoke(60).await;
        let queue = Arc::new(WriteQueue::new(test_config(), spoke, create_single()));
        queue.start().await.unwrap();
        queue.add("orders", &ContentKey::new_now());

        let expired = eventually(Duration::from_secs(2), || async {
            queue.stats().expired.load(Ordering::SeqCst) == 1
        })
        .await;
        assert!(expired);
        queue.shutdown().await;
        assert_eq!(queue.stats().failed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (spoke, _store, _dir) = create_spoke(60).await;
        let single = create_single();
        let flaky = Arc::new(FlakyDao::new(single.clone(), 2));
        let queue = Arc::new(WriteQueue::new(test_config(), spoke.clone(), flaky));
        queue.start().await.unwrap();

        let key = spoke.insert("orders", Content::new("payload")).await.unwrap();
        queue.add("orders", &key);
        queue.shutdown().await;

        assert!(single.get("orders", &key).await.unwrap().is_some());
        assert_eq!(queue.stats().written.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let (spoke, _store, _dir) = create_spoke(60).await;
        let flaky = Arc::new(FlakyDao::new(create_single(), 10));
        let queue = Arc::new(WriteQueue::new(test_config(), spoke.clone(), flaky));
        queue.start().await.unwrap();

        let key = spoke.insert("orders", Content::new("payload")).await.unwrap();
        queue.add("orders", &key);
        queue.shutdown().await;
        assert_eq!(queue.stats().failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (spoke, _store, _dir) = create_spoke(60).await;
        let queue = Arc::new(WriteQueue::new(test_config(), spoke, create_single()));
        queue.start().await.unwrap();
        assert!(matches!(queue.start().await, Err(Error::AlreadyStarted)));
        queue.shutdown().await;
    }
}
