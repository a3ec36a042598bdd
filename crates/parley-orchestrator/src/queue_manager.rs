//! Per-contact FIFO queues with per-contact exclusive processing.
//!
//! The outer map lock only guards map structure; each contact has its own
//! small mutex holding its pending messages and its `locked` flag. Different
//! contacts never contend with each other.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use parley_core::duration_to_ms;
use parley_types::{ContactKey, MessagePayload, OrchestratorError, QueuedMessage};
use serde::Serialize;

use crate::locks::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};

const QUEUE_REASON_PROCESS_FAILED: &str = "queued_message_failed";
const QUEUE_REASON_PROCESS_PANICKED: &str = "queued_message_panicked";

#[async_trait]
/// Trait contract for `QueuedMessageProcessor` behavior.
pub trait QueuedMessageProcessor: Send + Sync {
    async fn process(&self, message: QueuedMessage) -> Result<(), OrchestratorError>;
}

/// Result of handing a message to the queue manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// A drain worker was started for the contact.
    Scheduled { message_id: u64 },
    /// The contact is being processed; the message waits its turn.
    Deferred { message_id: u64, depth: usize },
}

impl SubmitOutcome {
    pub fn message_id(self) -> u64 {
        match self {
            Self::Scheduled { message_id } | Self::Deferred { message_id, .. } => message_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Public struct `EnqueueReceipt` returned by [`ResponseQueueManager::enqueue`].
pub struct EnqueueReceipt {
    pub message_id: u64,
    pub depth: usize,
    pub locked: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
/// Public struct `QueueMetrics` used by the session monitor.
pub struct QueueMetrics {
    pub queue_depths: BTreeMap<String, usize>,
    pub average_latency_ms: f64,
    pub processed_total: u64,
    pub failed_total: u64,
    pub active_workers: usize,
}

#[derive(Debug, Default)]
struct ContactQueue {
    pending: VecDeque<QueuedMessage>,
    locked: bool,
}

#[derive(Debug)]
struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn average_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total = self
            .samples
            .iter()
            .map(|sample| duration_to_ms(*sample) as f64)
            .sum::<f64>();
        total / self.samples.len() as f64
    }
}

#[derive(Debug)]
struct QueueInner {
    queues: RwLock<HashMap<ContactKey, Arc<Mutex<ContactQueue>>>>,
    latency: Mutex<LatencyWindow>,
    next_message_id: AtomicU64,
    processed_total: AtomicU64,
    failed_total: AtomicU64,
    active_workers: AtomicUsize,
}

/// Response queue manager. Cloning shares the same queues.
#[derive(Debug, Clone)]
pub struct ResponseQueueManager {
    inner: Arc<QueueInner>,
}

impl ResponseQueueManager {
    pub fn new(latency_window: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queues: RwLock::new(HashMap::new()),
                latency: Mutex::new(LatencyWindow {
                    samples: VecDeque::new(),
                    capacity: latency_window.max(1),
                }),
                next_message_id: AtomicU64::new(1),
                processed_total: AtomicU64::new(0),
                failed_total: AtomicU64::new(0),
                active_workers: AtomicUsize::new(0),
            }),
        }
    }

    /// Appends a message to the contact's queue. Never blocks on processing.
    pub fn enqueue(&self, key: &ContactKey, payload: MessagePayload) -> EnqueueReceipt {
        let message_id = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed);
        let message = QueuedMessage {
            id: message_id,
            key: key.clone(),
            payload,
            enqueued_at: Utc::now(),
            processed: false,
        };
        loop {
            {
                let queues = read_unpoisoned(&self.inner.queues);
                if let Some(queue) = queues.get(key) {
                    let mut queue = lock_unpoisoned(queue);
                    queue.pending.push_back(message);
                    return EnqueueReceipt {
                        message_id,
                        depth: queue.pending.len(),
                        locked: queue.locked,
                    };
                }
            }
            write_unpoisoned(&self.inner.queues)
                .entry(key.clone())
                .or_default();
        }
    }

    /// Pops the oldest message and locks the contact.
    ///
    /// Returns `None` when the contact is already locked or has nothing queued.
    pub fn dequeue(&self, key: &ContactKey) -> Option<QueuedMessage> {
        let queues = read_unpoisoned(&self.inner.queues);
        let mut queue = lock_unpoisoned(queues.get(key)?);
        if queue.locked {
            return None;
        }
        let message = queue.pending.pop_front()?;
        queue.locked = true;
        Some(message)
    }

    /// Releases the contact lock and drops the contact entry once it is empty.
    pub fn unlock(&self, key: &ContactKey) {
        let drained = {
            let queues = read_unpoisoned(&self.inner.queues);
            let Some(queue) = queues.get(key) else {
                return;
            };
            let mut queue = lock_unpoisoned(queue);
            queue.locked = false;
            queue.pending.is_empty()
        };
        if drained {
            let mut queues = write_unpoisoned(&self.inner.queues);
            let removable = queues.get(key).is_some_and(|queue| {
                let queue = lock_unpoisoned(queue);
                !queue.locked && queue.pending.is_empty()
            });
            if removable {
                queues.remove(key);
            }
        }
    }

    /// Locks the contact without taking a message; `None` while it is busy.
    ///
    /// The lease unlocks on drop. Call [`Self::resume`] afterwards so messages
    /// queued during the lease are drained.
    pub fn try_lease(&self, key: &ContactKey) -> Option<ContactLease> {
        let mut queues = write_unpoisoned(&self.inner.queues);
        let queue = queues.entry(key.clone()).or_default();
        let mut queue = lock_unpoisoned(queue);
        if queue.locked {
            return None;
        }
        queue.locked = true;
        Some(ContactLease {
            manager: self.clone(),
            key: key.clone(),
        })
    }

    pub fn is_locked(&self, key: &ContactKey) -> bool {
        read_unpoisoned(&self.inner.queues)
            .get(key)
            .is_some_and(|queue| lock_unpoisoned(queue).locked)
    }

    pub fn depth(&self, key: &ContactKey) -> usize {
        read_unpoisoned(&self.inner.queues)
            .get(key)
            .map(|queue| lock_unpoisoned(queue).pending.len())
            .unwrap_or(0)
    }

    /// Enqueues and starts a drain worker unless one already owns the contact.
    pub fn submit(
        &self,
        key: &ContactKey,
        payload: MessagePayload,
        processor: Arc<dyn QueuedMessageProcessor>,
    ) -> SubmitOutcome {
        let receipt = self.enqueue(key, payload);
        if receipt.locked {
            tracing::debug!(
                tenant_id = %key.tenant_id,
                contact_id = %key.contact_id,
                depth = receipt.depth,
                "contact busy; message deferred"
            );
            return SubmitOutcome::Deferred {
                message_id: receipt.message_id,
                depth: receipt.depth,
            };
        }
        self.spawn_drain(key.clone(), processor);
        SubmitOutcome::Scheduled {
            message_id: receipt.message_id,
        }
    }

    /// Starts a drain worker when the contact has pending messages and is free.
    pub fn resume(&self, key: &ContactKey, processor: Arc<dyn QueuedMessageProcessor>) -> bool {
        let pending = read_unpoisoned(&self.inner.queues)
            .get(key)
            .is_some_and(|queue| {
                let queue = lock_unpoisoned(queue);
                !queue.locked && !queue.pending.is_empty()
            });
        if pending {
            self.spawn_drain(key.clone(), processor);
        }
        pending
    }

    fn spawn_drain(&self, key: ContactKey, processor: Arc<dyn QueuedMessageProcessor>) {
        let manager = self.clone();
        manager.inner.active_workers.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            manager.drain(&key, processor.as_ref()).await;
            manager.inner.active_workers.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Processes the contact's queue until it is empty or another worker owns it.
    pub async fn drain(&self, key: &ContactKey, processor: &dyn QueuedMessageProcessor) {
        while let Some(message) = self.dequeue(key) {
            let message_id = message.id;
            let started = Instant::now();
            let result = AssertUnwindSafe(processor.process(message))
                .catch_unwind()
                .await;
            let elapsed = started.elapsed();
            match result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    self.inner.failed_total.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        tenant_id = %key.tenant_id,
                        contact_id = %key.contact_id,
                        message_id,
                        reason_code = QUEUE_REASON_PROCESS_FAILED,
                        error_code = error.reason_code(),
                        error = %error,
                        "queued message processing failed"
                    );
                }
                Err(_) => {
                    self.inner.failed_total.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        tenant_id = %key.tenant_id,
                        contact_id = %key.contact_id,
                        message_id,
                        reason_code = QUEUE_REASON_PROCESS_PANICKED,
                        "queued message processing panicked"
                    );
                }
            }
            self.inner.processed_total.fetch_add(1, Ordering::Relaxed);
            lock_unpoisoned(&self.inner.latency).push(elapsed);
            self.unlock(key);
        }
    }

    /// True when no drain worker runs and no contact has queued messages.
    pub fn is_idle(&self) -> bool {
        if self.inner.active_workers.load(Ordering::SeqCst) > 0 {
            return false;
        }
        read_unpoisoned(&self.inner.queues).values().all(|queue| {
            let queue = lock_unpoisoned(queue);
            queue.pending.is_empty() && !queue.locked
        })
    }

    pub fn metrics(&self) -> QueueMetrics {
        let queue_depths = read_unpoisoned(&self.inner.queues)
            .iter()
            .filter_map(|(key, queue)| {
                let depth = lock_unpoisoned(queue).pending.len();
                (depth > 0).then(|| (key.to_string(), depth))
            })
            .collect();
        QueueMetrics {
            queue_depths,
            average_latency_ms: lock_unpoisoned(&self.inner.latency).average_ms(),
            processed_total: self.inner.processed_total.load(Ordering::Relaxed),
            failed_total: self.inner.failed_total.load(Ordering::Relaxed),
            active_workers: self.inner.active_workers.load(Ordering::SeqCst),
        }
    }
}

/// Exclusive hold on one contact obtained through [`ResponseQueueManager::try_lease`].
#[derive(Debug)]
pub struct ContactLease {
    manager: ResponseQueueManager,
    key: ContactKey,
}

impl ContactLease {
    pub fn key(&self) -> &ContactKey {
        &self.key
    }
}

impl Drop for ContactLease {
    fn drop(&mut self) {
        self.manager.unlock(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use parley_types::StateError;

    use super::*;

    #[derive(Default)]
    struct RecordingProcessor {
        seen: Mutex<Vec<(ContactKey, String)>>,
        in_flight: Mutex<HashMap<ContactKey, usize>>,
        overlap_detected: AtomicBool,
        delay: Duration,
    }

    #[async_trait]
    impl QueuedMessageProcessor for RecordingProcessor {
        async fn process(&self, message: QueuedMessage) -> Result<(), OrchestratorError> {
            {
                let mut in_flight = lock_unpoisoned(&self.in_flight);
                let count = in_flight.entry(message.key.clone()).or_default();
                *count += 1;
                if *count > 1 {
                    self.overlap_detected.store(true, Ordering::SeqCst);
                }
            }
            tokio::time::sleep(self.delay).await;
            let text = message.payload.text_or_empty().to_string();
            lock_unpoisoned(&self.seen).push((message.key.clone(), text.clone()));
            if let Some(count) = lock_unpoisoned(&self.in_flight).get_mut(&message.key) {
                *count -= 1;
            }
            match text.as_str() {
                "fail" => Err(StateError::NoSession.into()),
                "panic" => panic!("processor panic"),
                _ => Ok(()),
            }
        }
    }

    async fn wait_idle(manager: &ResponseQueueManager) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if manager.is_idle() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue manager did not become idle before timeout");
    }

    #[test]
    fn unit_dequeue_locks_contact_until_unlock() {
        let manager = ResponseQueueManager::new(8);
        let key = ContactKey::new("acme", "+1");
        manager.enqueue(&key, MessagePayload::text("a"));
        manager.enqueue(&key, MessagePayload::text("b"));

        let first = manager.dequeue(&key).expect("first");
        assert_eq!(first.payload.text_or_empty(), "a");
        assert!(manager.dequeue(&key).is_none());
        assert!(manager.is_locked(&key));
        manager.unlock(&key);
        let second = manager.dequeue(&key).expect("second");
        assert_eq!(second.payload.text_or_empty(), "b");
        manager.unlock(&key);
        assert!(manager.dequeue(&key).is_none());
        assert_eq!(manager.depth(&key), 0);
        assert!(manager.is_idle());
    }

    #[test]
    fn unit_lease_blocks_dequeue_and_releases_on_drop() {
        let manager = ResponseQueueManager::new(8);
        let key = ContactKey::new("acme", "+1");
        let lease = manager.try_lease(&key).expect("lease");
        assert!(manager.try_lease(&key).is_none());
        manager.enqueue(&key, MessagePayload::text("a"));
        assert!(manager.dequeue(&key).is_none());
        drop(lease);
        assert!(manager.dequeue(&key).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn integration_burst_for_one_contact_is_processed_once_in_order() {
        let manager = ResponseQueueManager::new(16);
        let processor = Arc::new(RecordingProcessor {
            delay: Duration::from_millis(2),
            ..RecordingProcessor::default()
        });
        let key = ContactKey::new("acme", "+1");
        for index in 0..25 {
            manager.submit(
                &key,
                MessagePayload::text(format!("m{index}")),
                processor.clone(),
            );
        }
        wait_idle(&manager).await;

        let seen = lock_unpoisoned(&processor.seen).clone();
        let texts = seen.iter().map(|(_, text)| text.clone()).collect::<Vec<_>>();
        let expected = (0..25).map(|index| format!("m{index}")).collect::<Vec<_>>();
        assert_eq!(texts, expected);
        assert!(!processor.overlap_detected.load(Ordering::SeqCst));
        assert_eq!(manager.metrics().processed_total, 25);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn integration_different_contacts_process_concurrently() {
        let manager = ResponseQueueManager::new(16);
        let processor = Arc::new(RecordingProcessor {
            delay: Duration::from_millis(50),
            ..RecordingProcessor::default()
        });
        let started = Instant::now();
        for index in 0..8 {
            manager.submit(
                &ContactKey::new("acme", format!("+{index}")),
                MessagePayload::text("hello"),
                processor.clone(),
            );
        }
        wait_idle(&manager).await;
        assert_eq!(lock_unpoisoned(&processor.seen).len(), 8);
        assert!(started.elapsed() < Duration::from_millis(350));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn regression_failure_and_panic_do_not_stop_the_contact_loop() {
        let manager = ResponseQueueManager::new(16);
        let processor = Arc::new(RecordingProcessor::default());
        let key = ContactKey::new("acme", "+1");
        let lease = manager.try_lease(&key).expect("hold contact");
        for text in ["fail", "panic", "after"] {
            let outcome = manager.submit(&key, MessagePayload::text(text), processor.clone());
            assert!(matches!(outcome, SubmitOutcome::Deferred { .. }));
        }
        assert_eq!(manager.depth(&key), 3);
        drop(lease);
        assert!(manager.resume(&key, processor.clone()));
        wait_idle(&manager).await;

        let texts = lock_unpoisoned(&processor.seen)
            .iter()
            .map(|(_, text)| text.clone())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["fail", "panic", "after"]);
        let metrics = manager.metrics();
        assert_eq!(metrics.failed_total, 2);
        assert!(metrics.queue_depths.is_empty());
        assert!(!manager.is_locked(&key));
    }
}
