//! In-process visibility-timeout queue.
//!
//! Mirrors the lease semantics of a managed queue closely enough to exercise
//! the dispatcher end to end:
//!
//! - every receive issues a fresh receipt handle and bumps the receive count
//! - a received message stays hidden until its visibility deadline
//! - only the current receipt handle may extend, release, or delete
//! - with a redrive policy, a message whose receive count reached the limit
//!   is moved to the dead-letter list instead of being handed out again
//!
//! A waiting receive wakes when a message is sent or released, or when the
//! next in-flight message's visibility deadline passes.
//!
//! All timing uses `tokio::time::Instant`, so tests can drive it with a
//! paused clock. Every call is recorded in an operation log for assertions,
//! and failures can be injected per operation.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use workq_core::{AttributeValue, MessageId, QueueMessage, ReceiptHandle, RedrivePolicy};

use super::{QueueClient, QueueError};

// ---------------------------------------------------------------------------
// Operation log and fault injection
// ---------------------------------------------------------------------------

/// Which queue call an operation log entry or injected fault refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueCall {
    Receive,
    Extend,
    Delete,
    Release,
}

/// One recorded queue call.
#[derive(Debug, Clone)]
pub struct QueueOp {
    pub call: QueueCall,
    /// Message the call targeted. `None` for receives that returned nothing.
    pub message_id: Option<MessageId>,
    /// Timeout passed to `extend`/`release`/`receive`.
    pub timeout: Option<Duration>,
    pub at: Instant,
    pub ok: bool,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StoredMessage {
    id: MessageId,
    body: String,
    attributes: BTreeMap<String, AttributeValue>,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<ReceiptHandle>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: Vec<StoredMessage>,
    dead_letters: Vec<MessageId>,
    deleted: HashSet<MessageId>,
    ops: Vec<QueueOp>,
    faults: HashMap<QueueCall, VecDeque<QueueError>>,
    next_id: u64,
}

enum Lookup {
    Current(usize),
    Deleted,
    Stale,
}

impl QueueState {
    fn record(&mut self, call: QueueCall, message_id: Option<MessageId>, timeout: Option<Duration>, ok: bool) {
        self.ops.push(QueueOp {
            call,
            message_id,
            timeout,
            at: Instant::now(),
            ok,
        });
    }

    fn take_fault(&mut self, call: QueueCall) -> Option<QueueError> {
        self.faults.get_mut(&call).and_then(VecDeque::pop_front)
    }

    fn lookup(&self, message: &QueueMessage, now: Instant) -> Lookup {
        match self.messages.iter().position(|m| m.id == message.message_id) {
            Some(idx) => {
                let stored = &self.messages[idx];
                if stored.receipt.as_ref() == Some(&message.receipt_handle) && stored.visible_at > now {
                    Lookup::Current(idx)
                } else {
                    Lookup::Stale
                }
            }
            None if self.deleted.contains(&message.message_id) => Lookup::Deleted,
            None => Lookup::Stale,
        }
    }

    /// Earliest future instant at which a hidden message becomes visible.
    fn next_visible_at(&self, now: Instant) -> Option<Instant> {
        self.messages
            .iter()
            .map(|m| m.visible_at)
            .filter(|at| *at > now)
            .min()
    }

    fn take_visible(
        &mut self,
        redrive: Option<RedrivePolicy>,
        visibility_timeout: Duration,
        max_messages: usize,
    ) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut batch = Vec::new();
        let mut idx = 0;
        while idx < self.messages.len() && batch.len() < max_messages {
            if self.messages[idx].visible_at > now {
                idx += 1;
                continue;
            }
            if redrive.is_some_and(|p| self.messages[idx].receive_count >= p.max_receive_count) {
                let dead = self.messages.remove(idx);
                self.dead_letters.push(dead.id);
                continue;
            }
            let stored = &mut self.messages[idx];
            stored.receive_count += 1;
            stored.visible_at = now + visibility_timeout;
            let receipt = ReceiptHandle(uuid::Uuid::new_v4().to_string());
            stored.receipt = Some(receipt.clone());
            batch.push(QueueMessage {
                message_id: stored.id.clone(),
                body: stored.body.clone(),
                receipt_handle: receipt,
                attributes: stored.attributes.clone(),
                delivery_count: Some(stored.receive_count),
            });
            idx += 1;
        }
        batch
    }
}

// ---------------------------------------------------------------------------
// InMemoryQueue
// ---------------------------------------------------------------------------

/// Visibility-timeout queue held in process memory.
#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    redrive: Option<RedrivePolicy>,
    arrivals: Notify,
}

impl InMemoryQueue {
    /// Creates an empty queue without a redrive policy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            redrive: None,
            arrivals: Notify::new(),
        }
    }

    /// Sets the redrive policy applied on receive.
    #[must_use]
    pub fn with_redrive(mut self, policy: RedrivePolicy) -> Self {
        self.redrive = Some(policy);
        self
    }

    /// Enqueues a message and returns its id. The message is visible immediately.
    pub fn send(&self, body: impl Into<String>, attributes: BTreeMap<String, AttributeValue>) -> MessageId {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = MessageId(format!("msg-{}", state.next_id));
            state.messages.push(StoredMessage {
                id: id.clone(),
                body: body.into(),
                attributes,
                receive_count: 0,
                visible_at: Instant::now(),
                receipt: None,
            });
            id
        };
        self.arrivals.notify_waiters();
        id
    }

    /// Enqueues a message with no attributes.
    pub fn send_body(&self, body: impl Into<String>) -> MessageId {
        self.send(body, BTreeMap::new())
    }

    /// Makes the next `call` fail with `error`. Faults queue up in order.
    pub fn inject_fault(&self, call: QueueCall, error: QueueError) {
        self.state.lock().faults.entry(call).or_default().push_back(error);
    }

    /// Ends the current delivery of `id` as if its visibility timeout ran out.
    pub fn expire_lease(&self, id: &MessageId) {
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            if let Some(stored) = state.messages.iter_mut().find(|m| &m.id == id) {
                stored.visible_at = now;
            }
        }
        self.arrivals.notify_waiters();
    }

    /// Snapshot of every call made so far.
    #[must_use]
    pub fn ops(&self) -> Vec<QueueOp> {
        self.state.lock().ops.clone()
    }

    /// Recorded calls of one kind.
    #[must_use]
    pub fn ops_of(&self, call: QueueCall) -> Vec<QueueOp> {
        self.state
            .lock()
            .ops
            .iter()
            .filter(|op| op.call == call)
            .cloned()
            .collect()
    }

    /// Messages still stored (visible or in flight).
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently eligible for delivery.
    #[must_use]
    pub fn visible_len(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.visible_at <= now)
            .count()
    }

    /// Whether `id` was deleted.
    #[must_use]
    pub fn is_deleted(&self, id: &MessageId) -> bool {
        self.state.lock().deleted.contains(id)
    }

    /// Ids moved to the dead-letter list by the redrive policy.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<MessageId> {
        self.state.lock().dead_letters.clone()
    }

    /// How many times `id` has been received.
    #[must_use]
    pub fn receive_count(&self, id: &MessageId) -> Option<u32> {
        self.state
            .lock()
            .messages
            .iter()
            .find(|m| &m.id == id)
            .map(|m| m.receive_count)
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn receive(
        &self,
        max_wait: Duration,
        visibility_timeout: Duration,
        max_messages: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + max_wait;
        {
            let mut state = self.state.lock();
            if let Some(err) = state.take_fault(QueueCall::Receive) {
                state.record(QueueCall::Receive, None, Some(visibility_timeout), false);
                return Err(err);
            }
        }

        loop {
            // Registered before the state check so a send in between is not missed.
            let arrival = self.arrivals.notified();
            let (batch, next_visible) = {
                let mut state = self.state.lock();
                let batch = state.take_visible(self.redrive, visibility_timeout, max_messages);
                for msg in &batch {
                    state.record(
                        QueueCall::Receive,
                        Some(msg.message_id.clone()),
                        Some(visibility_timeout),
                        true,
                    );
                }
                let next_visible = state.next_visible_at(Instant::now());
                (batch, next_visible)
            };

            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                () = arrival => {}
                () = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn extend(&self, message: &QueueMessage, timeout: Duration) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let id = Some(message.message_id.clone());
        if let Some(err) = state.take_fault(QueueCall::Extend) {
            state.record(QueueCall::Extend, id, Some(timeout), false);
            return Err(err);
        }
        match state.lookup(message, now) {
            Lookup::Current(idx) => {
                state.messages[idx].visible_at = now + timeout;
                state.record(QueueCall::Extend, id, Some(timeout), true);
                Ok(())
            }
            Lookup::Deleted | Lookup::Stale => {
                state.record(QueueCall::Extend, id, Some(timeout), false);
                Err(QueueError::LeaseExpired {
                    receipt: message.receipt_handle.clone(),
                })
            }
        }
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let id = Some(message.message_id.clone());
        if let Some(err) = state.take_fault(QueueCall::Delete) {
            state.record(QueueCall::Delete, id, None, false);
            return Err(err);
        }
        match state.lookup(message, now) {
            Lookup::Current(idx) => {
                let removed = state.messages.remove(idx);
                state.deleted.insert(removed.id);
                state.record(QueueCall::Delete, id, None, true);
                Ok(())
            }
            Lookup::Deleted => {
                state.record(QueueCall::Delete, id, None, true);
                Ok(())
            }
            Lookup::Stale => {
                state.record(QueueCall::Delete, id, None, false);
                Err(QueueError::LeaseExpired {
                    receipt: message.receipt_handle.clone(),
                })
            }
        }
    }

    async fn release(&self, message: &QueueMessage, timeout: Duration) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let id = Some(message.message_id.clone());
        if let Some(err) = state.take_fault(QueueCall::Release) {
            state.record(QueueCall::Release, id, Some(timeout), false);
            return Err(err);
        }
        match state.lookup(message, now) {
            Lookup::Current(idx) => {
                let stored = &mut state.messages[idx];
                stored.visible_at = now + timeout;
                stored.receipt = None;
                state.record(QueueCall::Release, id, Some(timeout), true);
                drop(state);
                self.arrivals.notify_waiters();
                Ok(())
            }
            Lookup::Deleted | Lookup::Stale => {
                state.record(QueueCall::Release, id, Some(timeout), false);
                Err(QueueError::LeaseExpired {
                    receipt: message.receipt_handle.clone(),
                })
            }
        }
    }

    fn redrive_policy(&self) -> Option<RedrivePolicy> {
        self.redrive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VT: Duration = Duration::from_secs(30);

    async fn receive_one(queue: &InMemoryQueue) -> QueueMessage {
        let mut batch = queue.receive(Duration::ZERO, VT, 1).await.unwrap();
        assert_eq!(batch.len(), 1);
        batch.remove(0)
    }

    #[tokio::test(start_paused = true)]
    async fn received_message_is_hidden_until_deadline() {
        let queue = InMemoryQueue::new();
        queue.send_body("1");

        let msg = receive_one(&queue).await;
        assert_eq!(msg.delivery_count, Some(1));
        assert_eq!(queue.visible_len(), 0);

        tokio::time::advance(VT).await;
        assert_eq!(queue.visible_len(), 1);

        let again = receive_one(&queue).await;
        assert_eq!(again.delivery_count, Some(2));
        assert_ne!(again.receipt_handle, msg.receipt_handle);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_receive_waits_for_max_wait() {
        let queue = InMemoryQueue::new();
        let start = Instant::now();
        let batch = queue.receive(Duration::from_secs(10), VT, 1).await.unwrap();
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn receive_returns_message_sent_during_wait() {
        let queue = std::sync::Arc::new(InMemoryQueue::new());
        let sender = std::sync::Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            sender.send_body("late");
        });
        let start = Instant::now();
        let batch = queue.receive(Duration::from_secs(10), VT, 1).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "late");
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_receive_wakes_when_a_lease_lapses() {
        let queue = InMemoryQueue::new();
        queue.send_body("1");
        let first = receive_one(&queue).await;
        let start = Instant::now();

        let batch = queue.receive(Duration::from_secs(60), VT, 1).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message_id, first.message_id);
        assert_eq!(start.elapsed(), VT);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_receive_wakes_on_release() {
        let queue = std::sync::Arc::new(InMemoryQueue::new());
        queue.send_body("1");
        let msg = receive_one(&queue).await;
        let releaser = std::sync::Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            releaser.release(&msg, Duration::ZERO).await.unwrap();
        });

        let start = Instant::now();
        let batch = queue.receive(Duration::from_secs(20), VT, 1).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn extend_pushes_deadline() {
        let queue = InMemoryQueue::new();
        queue.send_body("1");
        let msg = receive_one(&queue).await;

        tokio::time::advance(Duration::from_secs(20)).await;
        queue.extend(&msg, VT).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(queue.visible_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_receipt_cannot_extend_or_delete() {
        let queue = InMemoryQueue::new();
        let id = queue.send_body("1");
        let first = receive_one(&queue).await;

        queue.expire_lease(&id);
        let _second = receive_one(&queue).await;

        assert!(queue.extend(&first, VT).await.unwrap_err().is_lease_expired());
        assert!(queue.delete(&first).await.unwrap_err().is_lease_expired());
        assert!(!queue.is_deleted(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_is_idempotent() {
        let queue = InMemoryQueue::new();
        let id = queue.send_body("1");
        let msg = receive_one(&queue).await;

        queue.delete(&msg).await.unwrap();
        queue.delete(&msg).await.unwrap();
        assert!(queue.is_deleted(&id));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn release_zero_makes_message_visible() {
        let queue = InMemoryQueue::new();
        queue.send_body("1");
        let msg = receive_one(&queue).await;

        queue.release(&msg, Duration::ZERO).await.unwrap();
        assert_eq!(queue.visible_len(), 1);
        assert!(queue.extend(&msg, VT).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn redrive_moves_message_to_dead_letters() {
        let queue = InMemoryQueue::new().with_redrive(RedrivePolicy { max_receive_count: 2 });
        let id = queue.send_body("1");

        for _ in 0..2 {
            let msg = receive_one(&queue).await;
            queue.release(&msg, Duration::ZERO).await.unwrap();
        }

        let batch = queue.receive(Duration::ZERO, VT, 1).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(queue.dead_letters(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn injected_faults_fire_once() {
        let queue = InMemoryQueue::new();
        queue.inject_fault(QueueCall::Receive, QueueError::Unavailable("down".to_string()));
        queue.send_body("1");

        assert!(queue.receive(Duration::ZERO, VT, 1).await.is_err());
        assert_eq!(queue.receive(Duration::ZERO, VT, 1).await.unwrap().len(), 1);
        assert_eq!(queue.ops_of(QueueCall::Receive).len(), 2);
    }
}
