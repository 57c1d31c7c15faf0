use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// Provider limit on messages per receive call.
pub const MAX_RECEIVE_BATCH: usize = 10;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue transport error: {0}")]
    Transport(String),

    #[error("Receipt handle is no longer valid: {0}")]
    ReceiptInvalid(String),
}

impl QueueError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Transport(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRequest {
    pub body: String,
    pub delay_seconds: u32,
    /// FIFO only: provider-side deduplication id
    pub dedup_id: Option<String>,
    /// FIFO only: ordering group
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    /// 1 on first delivery
    pub receive_count: u32,
}

/// Approximate message counts, as reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub visible: u64,
    pub in_flight: u64,
    pub delayed: u64,
}

/// One underlying queue handle.
///
/// Mirrors the cloud queue API: at-least-once delivery, visibility timeouts
/// and receipt handles that change on every delivery. Handles are shared by
/// all execution units.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Returns the provider message id.
    async fn send_message(&self, request: SendRequest) -> Result<String, QueueError>;

    /// Long poll: waits up to `wait` for at least one message. An empty
    /// result is a timeout, not an error.
    async fn receive_messages(
        &self,
        max_messages: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    async fn change_visibility(
        &self,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), QueueError>;

    async fn delete_message(&self, receipt_handle: &str) -> Result<(), QueueError>;

    async fn approximate_depth(&self) -> Result<QueueDepth, QueueError>;

    fn is_fifo(&self) -> bool;

    fn url(&self) -> &str;
}

#[derive(Clone)]
struct StoredMessage {
    id: String,
    body: String,
    group_id: Option<String>,
    visible_at: Instant,
    receive_count: u32,
    /// Receipt of the latest delivery; only it may renew or delete
    receipt: Option<String>,
    in_flight: bool,
}

struct QueueState {
    messages: VecDeque<StoredMessage>,
    receipts: HashMap<String, String>,
    dedup: HashMap<String, (Instant, String)>,
    /// Receipts of deleted messages, so a repeat delete succeeds
    retired: LruCache<String, ()>,
    /// Messages moved aside by the redrive policy
    dead_letters: Vec<StoredMessage>,
}

/// In-process emulator of a cloud queue.
///
/// Implements visibility timeouts, long-poll wakeups, receive counts, FIFO
/// group ordering with a deduplication window, an optional redrive policy,
/// and injectable transport faults. Time comes from `tokio::time`, so tests
/// may pause the clock.
pub struct MemoryQueue {
    url: String,
    fifo: bool,
    dedup_window: Duration,
    max_receive_count: Option<u32>,
    state: Mutex<QueueState>,
    notify: Notify,
    pending_faults: AtomicU32,
}

impl MemoryQueue {
    /// A `.fifo` suffix on the URL selects FIFO semantics.
    pub fn new(url: impl Into<String>, dedup_window: Duration) -> Self {
        let url = url.into();
        let retired_capacity = NonZeroUsize::new(10_000).unwrap_or(NonZeroUsize::MIN);
        MemoryQueue {
            fifo: url.ends_with(".fifo"),
            url,
            dedup_window,
            max_receive_count: None,
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                receipts: HashMap::new(),
                dedup: HashMap::new(),
                retired: LruCache::new(retired_capacity),
                dead_letters: Vec::new(),
            }),
            notify: Notify::new(),
            pending_faults: AtomicU32::new(0),
        }
    }

    /// Redrive policy: a message already received `max_receive_count` times
    /// is moved to the dead letters instead of being delivered again.
    pub fn with_redrive(mut self, max_receive_count: u32) -> Self {
        self.max_receive_count = Some(max_receive_count.max(1));
        self
    }

    /// Bodies of redriven messages, oldest first.
    pub fn dead_letters(&self) -> Vec<String> {
        self.state
            .lock()
            .dead_letters
            .iter()
            .map(|m| m.body.clone())
            .collect()
    }

    /// Make the next `count` calls fail with a transport error.
    pub fn fail_next(&self, count: u32) {
        self.pending_faults.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn inject_fault(&self) -> Result<(), QueueError> {
        let taken = self
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(QueueError::Transport("injected fault".to_string())),
            Err(_) => Ok(()),
        }
    }

    /// Deliver up to `max` visible messages. Returns the batch and, when it is
    /// empty, the next instant something becomes visible.
    fn take_visible(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> (Vec<ReceivedMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let QueueState {
            messages,
            receipts,
            dead_letters,
            ..
        } = &mut *state;

        if let Some(max_receive_count) = self.max_receive_count {
            let redriven = dead_letters.len();
            messages.retain(|message| {
                let exhausted =
                    message.visible_at <= now && message.receive_count >= max_receive_count;
                if exhausted {
                    dead_letters.push(message.clone());
                }
                !exhausted
            });
            for message in &dead_letters[redriven..] {
                receipts.retain(|_, id| *id != message.id);
            }
        }

        let mut batch = Vec::new();
        let mut next_visible: Option<Instant> = None;
        // FIFO: a group with an earlier message in flight is blocked.
        let mut blocked_groups: HashSet<String> = HashSet::new();

        for message in messages.iter_mut() {
            if message.in_flight && message.visible_at <= now {
                message.in_flight = false;
            }
            let blocked = self.fifo
                && message
                    .group_id
                    .as_ref()
                    .is_some_and(|group| blocked_groups.contains(group));

            if message.visible_at > now {
                next_visible = Some(next_visible.map_or(message.visible_at, |t| t.min(message.visible_at)));
                if self.fifo && message.in_flight {
                    if let Some(group) = &message.group_id {
                        blocked_groups.insert(group.clone());
                    }
                }
                continue;
            }
            if blocked || batch.len() >= max {
                continue;
            }

            let receipt = Uuid::new_v4().to_string();
            message.receive_count += 1;
            message.visible_at = now + visibility_timeout;
            message.in_flight = true;
            message.receipt = Some(receipt.clone());
            receipts.insert(receipt.clone(), message.id.clone());
            if self.fifo {
                if let Some(group) = &message.group_id {
                    blocked_groups.insert(group.clone());
                }
            }

            batch.push(ReceivedMessage {
                message_id: message.id.clone(),
                receipt_handle: receipt,
                body: message.body.clone(),
                receive_count: message.receive_count,
            });
        }

        (batch, next_visible)
    }
}

#[async_trait]
impl QueueService for MemoryQueue {
    async fn send_message(&self, request: SendRequest) -> Result<String, QueueError> {
        self.inject_fault()?;
        let now = Instant::now();
        let mut state = self.state.lock();

        if self.fifo {
            state.dedup.retain(|_, (expires_at, _)| *expires_at > now);
            if let Some(dedup_id) = &request.dedup_id {
                if let Some((_, existing)) = state.dedup.get(dedup_id) {
                    return Ok(existing.clone());
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        if self.fifo {
            if let Some(dedup_id) = request.dedup_id {
                state
                    .dedup
                    .insert(dedup_id, (now + self.dedup_window, id.clone()));
            }
        }
        state.messages.push_back(StoredMessage {
            id: id.clone(),
            body: request.body,
            group_id: request.group_id,
            visible_at: now + Duration::from_secs(u64::from(request.delay_seconds)),
            receive_count: 0,
            receipt: None,
            in_flight: false,
        });
        drop(state);

        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive_messages(
        &self,
        max_messages: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.inject_fault()?;
        let max = max_messages.clamp(1, MAX_RECEIVE_BATCH);
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, next_visible) = self.take_visible(max, visibility_timeout);
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }

            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn change_visibility(
        &self,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        self.inject_fault()?;
        let now = Instant::now();
        let mut state = self.state.lock();

        let message_id = state
            .receipts
            .get(receipt_handle)
            .cloned()
            .ok_or_else(|| QueueError::ReceiptInvalid(receipt_handle.to_string()))?;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .filter(|m| {
                m.in_flight && m.visible_at > now && m.receipt.as_deref() == Some(receipt_handle)
            })
            .ok_or_else(|| QueueError::ReceiptInvalid(receipt_handle.to_string()))?;

        message.visible_at = now + timeout;
        let released = timeout.is_zero();
        if released {
            message.in_flight = false;
        }
        drop(state);

        if released {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn delete_message(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.inject_fault()?;
        let mut state = self.state.lock();

        if state.retired.contains(receipt_handle) {
            return Ok(());
        }
        let message_id = state
            .receipts
            .get(receipt_handle)
            .cloned()
            .ok_or_else(|| QueueError::ReceiptInvalid(receipt_handle.to_string()))?;
        let position = state
            .messages
            .iter()
            .position(|m| m.id == message_id && m.receipt.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::ReceiptInvalid(receipt_handle.to_string()))?;

        state.messages.remove(position);
        state.receipts.retain(|_, id| *id != message_id);
        state.retired.put(receipt_handle.to_string(), ());
        drop(state);

        // A deleted FIFO head may unblock its group.
        self.notify.notify_waiters();
        Ok(())
    }

    async fn approximate_depth(&self) -> Result<QueueDepth, QueueError> {
        self.inject_fault()?;
        let now = Instant::now();
        let state = self.state.lock();
        let mut depth = QueueDepth::default();
        for message in &state.messages {
            if message.visible_at <= now {
                depth.visible += 1;
            } else if message.in_flight {
                depth.in_flight += 1;
            } else {
                depth.delayed += 1;
            }
        }
        Ok(depth)
    }

    fn is_fifo(&self) -> bool {
        self.fifo
    }

    fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const VISIBILITY: Duration = Duration::from_secs(30);

    fn send(body: &str) -> SendRequest {
        SendRequest {
            body: body.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_hides_message_until_timeout() {
        let queue = MemoryQueue::new("memory://dagster", Duration::from_secs(300));
        queue.send_message(send("a")).await.unwrap();

        let first = queue
            .receive_messages(10, Duration::ZERO, VISIBILITY)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);

        let hidden = queue
            .receive_messages(10, Duration::ZERO, VISIBILITY)
            .await
            .unwrap();
        assert!(hidden.is_empty());

        tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
        let again = queue
            .receive_messages(10, Duration::ZERO, VISIBILITY)
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);
        assert_ne!(again[0].receipt_handle, first[0].receipt_handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_send() {
        let queue = Arc::new(MemoryQueue::new("memory://dagster", Duration::from_secs(300)));
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .receive_messages(1, Duration::from_secs(20), VISIBILITY)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        queue.send_message(send("late")).await.unwrap();

        let batch = receiver.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_times_out_empty() {
        let queue = MemoryQueue::new("memory://dagster", Duration::from_secs(300));
        let started = Instant::now();
        let batch = queue
            .receive_messages(1, Duration::from_secs(20), VISIBILITY)
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_receipt_is_rejected_after_redelivery() {
        let queue = MemoryQueue::new("memory://dagster", Duration::from_secs(300));
        queue.send_message(send("a")).await.unwrap();

        let first = queue
            .receive_messages(1, Duration::ZERO, Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(matches!(
            queue
                .change_visibility(&first[0].receipt_handle, VISIBILITY)
                .await,
            Err(QueueError::ReceiptInvalid(_))
        ));

        let second = queue
            .receive_messages(1, Duration::ZERO, VISIBILITY)
            .await
            .unwrap();
        assert!(matches!(
            queue.delete_message(&first[0].receipt_handle).await,
            Err(QueueError::ReceiptInvalid(_))
        ));
        queue.delete_message(&second[0].receipt_handle).await.unwrap();
        queue.delete_message(&second[0].receipt_handle).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_dedup_and_group_order() {
        let queue = MemoryQueue::new("memory://dagster.fifo", Duration::from_secs(300));
        assert!(queue.is_fifo());

        let request = |body: &str, dedup: &str| SendRequest {
            body: body.to_string(),
            delay_seconds: 0,
            dedup_id: Some(dedup.to_string()),
            group_id: Some("dagster".to_string()),
        };
        let a = queue.send_message(request("a", "k1")).await.unwrap();
        let again = queue.send_message(request("a", "k1")).await.unwrap();
        assert_eq!(a, again);
        queue.send_message(request("b", "k2")).await.unwrap();
        assert_eq!(queue.len(), 2);

        let batch = queue
            .receive_messages(10, Duration::ZERO, VISIBILITY)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "a");

        queue.delete_message(&batch[0].receipt_handle).await.unwrap();
        let batch = queue
            .receive_messages(10, Duration::ZERO, VISIBILITY)
            .await
            .unwrap();
        assert_eq!(batch[0].body, "b");

        tokio::time::advance(Duration::from_secs(301)).await;
        let fresh = queue.send_message(request("a", "k1")).await.unwrap();
        assert_ne!(fresh, a);
    }

    #[tokio::test(start_paused = true)]
    async fn test_depth_and_delay() {
        let queue = MemoryQueue::new("memory://dagster", Duration::from_secs(300));
        queue.send_message(send("now")).await.unwrap();
        queue
            .send_message(SendRequest {
                body: "later".into(),
                delay_seconds: 60,
                ..Default::default()
            })
            .await
            .unwrap();
        queue
            .receive_messages(1, Duration::ZERO, VISIBILITY)
            .await
            .unwrap();

        let depth = queue.approximate_depth().await.unwrap();
        assert_eq!(
            depth,
            QueueDepth {
                visible: 0,
                in_flight: 1,
                delayed: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_redrive_moves_exhausted_message_aside() {
        let queue =
            MemoryQueue::new("memory://dagster", Duration::from_secs(300)).with_redrive(2);
        queue.send_message(send("poison")).await.unwrap();

        for expected in 1..=2 {
            let batch = queue
                .receive_messages(1, Duration::ZERO, Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(batch[0].receive_count, expected);
            tokio::time::advance(Duration::from_secs(2)).await;
        }

        let batch = queue
            .receive_messages(1, Duration::ZERO, VISIBILITY)
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert!(queue.is_empty());
        assert_eq!(queue.dead_letters(), ["poison"]);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let queue = MemoryQueue::new("memory://dagster", Duration::from_secs(300));
        queue.fail_next(1);
        let err = queue.send_message(send("a")).await.unwrap_err();
        assert!(err.is_retryable());
        queue.send_message(send("a")).await.unwrap();
    }
}
