//! In-process leased broker
//!
//! [`MemoryBroker`] implements [`WorkQueue`] for a single process: messages
//! published on the work subject are queued, fetched messages are leased and
//! come back when nakked or when their lease runs out, and replies are routed
//! to whoever called [`WorkQueue::expect_reply`] for their subject.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::queue::{Headers, Message, WorkQueue};

struct Leased {
    message: Message,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    ready: VecDeque<Message>,
    leased: HashMap<u64, Leased>,
    next_id: u64,
}

impl State {
    /// Move every message whose lease ran out back to the front of the queue
    fn expire(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .leased
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(leased) = self.leased.remove(&id) {
                debug!(id, "lease expired, redelivering");
                self.ready.push_front(leased.message);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.leased.values().map(|l| l.deadline).min()
    }
}

/// Single-process implementation of [`WorkQueue`]
pub struct MemoryBroker {
    subject: String,
    ack_wait: Duration,
    state: Mutex<State>,
    notify: Notify,
    consumer: AtomicBool,
    waiters: DashMap<String, oneshot::Sender<Message>>,
    unclaimed: AtomicU64,
}

impl MemoryBroker {
    /// Broker queueing messages published on `subject`, leasing each for `ack_wait`
    pub fn new(subject: impl Into<String>, ack_wait: Duration) -> Self {
        Self {
            subject: subject.into(),
            ack_wait,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            consumer: AtomicBool::new(true),
            waiters: DashMap::new(),
            unclaimed: AtomicU64::new(0),
        }
    }

    /// Subject work is published on
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Deregister the durable consumer
    pub fn delete_consumer(&self) {
        self.consumer.store(false, Ordering::SeqCst);
    }

    /// Messages waiting to be fetched
    pub fn pending(&self) -> usize {
        self.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Messages currently leased
    pub fn in_flight(&self) -> usize {
        self.lock().map(|s| s.leased.len()).unwrap_or(0)
    }

    /// Replies discarded because nobody was waiting for them
    pub fn unclaimed_replies(&self) -> u64 {
        self.unclaimed.load(Ordering::Relaxed)
    }

    /// Reply subjects someone is still waiting on
    pub fn waiting_replies(&self) -> usize {
        self.waiters.len()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Closed)
    }

    /// Take the next ready message, or report when to look again
    fn try_take(&self) -> Result<Result<Message, Option<Instant>>, QueueError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        state.expire(now);

        match state.ready.pop_front() {
            Some(mut message) => {
                message.delivered += 1;
                state.leased.insert(
                    message.id,
                    Leased {
                        message: message.clone(),
                        deadline: now + self.ack_wait,
                    },
                );
                Ok(Ok(message))
            }
            None => Ok(Err(state.next_deadline())),
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryBroker {
    async fn fetch(&self, max_wait: Duration) -> Result<Option<Message>, QueueError> {
        let give_up = Instant::now() + max_wait;

        loop {
            let wake = match self.try_take()? {
                Ok(message) => return Ok(Some(message)),
                Err(next_expiry) => next_expiry.map_or(give_up, |d| d.min(give_up)),
            };
            if Instant::now() >= give_up {
                return Ok(None);
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack(&self, id: u64) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        state
            .leased
            .remove(&id)
            .map(|_| ())
            .ok_or(QueueError::NotLeased(id))
    }

    async fn nak(&self, id: u64) -> Result<(), QueueError> {
        {
            let mut state = self.lock()?;
            let leased = state.leased.remove(&id).ok_or(QueueError::NotLeased(id))?;
            state.ready.push_front(leased.message);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn in_progress(&self, id: u64) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let leased = state.leased.get_mut(&id).ok_or(QueueError::NotLeased(id))?;
        leased.deadline = Instant::now() + self.ack_wait;
        Ok(())
    }

    async fn consumer_exists(&self) -> Result<bool, QueueError> {
        Ok(self.consumer.load(Ordering::SeqCst))
    }

    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<(), QueueError> {
        if subject == self.subject {
            {
                let mut state = self.lock()?;
                state.next_id += 1;
                let message = Message {
                    id: state.next_id,
                    subject: subject.to_string(),
                    headers,
                    payload,
                    delivered: 0,
                };
                state.ready.push_back(message);
            }
            self.notify.notify_one();
            return Ok(());
        }

        let message = Message {
            id: 0,
            subject: subject.to_string(),
            headers,
            payload,
            delivered: 1,
        };

        // Redelivered tasks may answer twice; only the first reply has a taker
        let delivered = match self.waiters.remove(subject) {
            Some((_, waiter)) => waiter.send(message).is_ok(),
            None => false,
        };
        if !delivered {
            self.unclaimed.fetch_add(1, Ordering::Relaxed);
            warn!(subject, "discarding reply nobody is waiting for");
        }
        Ok(())
    }

    async fn expect_reply(
        &self,
        subject: &str,
    ) -> Result<oneshot::Receiver<Message>, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(subject.to_string(), tx);
        Ok(rx)
    }

    fn release_reply(&self, subject: &str) {
        if self.waiters.remove(subject).is_some() {
            debug!(subject, "stopped waiting for reply");
        }
    }

    fn ack_wait(&self) -> Duration {
        self.ack_wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORK: &str = "stratus.tasks";

    fn broker() -> MemoryBroker {
        MemoryBroker::new(WORK, Duration::from_secs(10))
    }

    async fn publish(broker: &MemoryBroker, body: &str) {
        broker
            .publish(WORK, Headers::new(), body.as_bytes().to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fetch_returns_messages_in_order_and_leases_them() {
        let broker = broker();
        publish(&broker, "one").await;
        publish(&broker, "two").await;

        let first = broker.fetch(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(first.delivered, 1);
        assert_eq!(broker.in_flight(), 1);
        assert_eq!(broker.pending(), 1);

        broker.ack(first.id).await.unwrap();
        assert_eq!(broker.in_flight(), 0);
        assert!(matches!(
            broker.ack(first.id).await,
            Err(QueueError::NotLeased(_))
        ));
    }

    #[tokio::test]
    async fn nak_redelivers_immediately() {
        let broker = broker();
        publish(&broker, "job").await;

        let first = broker.fetch(Duration::ZERO).await.unwrap().unwrap();
        broker.nak(first.id).await.unwrap();

        let again = broker.fetch(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.delivered, 2);
    }

    /// Story: a worker dies mid-task without acking. Once the lease runs out
    /// the message is handed to the next fetch.
    #[tokio::test(start_paused = true)]
    async fn story_expired_lease_is_redelivered() {
        let broker = broker();
        publish(&broker, "job").await;
        let first = broker.fetch(Duration::ZERO).await.unwrap().unwrap();

        assert!(broker.fetch(Duration::from_secs(5)).await.unwrap().is_none());

        let again = broker
            .fetch(Duration::from_secs(30))
            .await
            .unwrap()
            .expect("redelivered after lease expiry");
        assert_eq!(again.id, first.id);
        assert_eq!(again.delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn in_progress_extends_the_lease() {
        let broker = broker();
        publish(&broker, "job").await;
        let msg = broker.fetch(Duration::ZERO).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_secs(8)).await;
        broker.in_progress(msg.id).await.unwrap();

        assert!(broker.fetch(Duration::from_secs(8)).await.unwrap().is_none());
        broker.ack(msg.id).await.unwrap();
    }

    #[tokio::test]
    async fn fetch_wakes_up_on_publish() {
        let broker = std::sync::Arc::new(broker());
        let fetcher = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.fetch(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        publish(&broker, "late").await;

        let msg = fetcher.await.unwrap().unwrap().unwrap();
        assert_eq!(msg.payload, b"late");
    }

    /// Story: a task is redelivered after its lease ran out and both
    /// deliveries answer. The waiter gets the first reply; the duplicate is
    /// discarded instead of piling up.
    #[tokio::test]
    async fn story_duplicate_reply_is_discarded() {
        let broker = broker();
        let rx = broker.expect_reply("reply.1").await.unwrap();

        for body in ["first", "second"] {
            broker
                .publish("reply.1", Headers::new(), body.as_bytes().to_vec())
                .await
                .unwrap();
        }

        assert_eq!(rx.await.unwrap().payload, b"first");
        assert_eq!(broker.unclaimed_replies(), 1);
        assert_eq!(broker.waiting_replies(), 0);
        assert_eq!(broker.pending(), 0);
    }

    #[tokio::test]
    async fn released_waiter_is_forgotten() {
        let broker = broker();
        let rx = broker.expect_reply("reply.1").await.unwrap();
        broker.release_reply("reply.1");
        assert_eq!(broker.waiting_replies(), 0);

        broker
            .publish("reply.1", Headers::new(), b"late".to_vec())
            .await
            .unwrap();
        assert!(rx.await.is_err());
        assert_eq!(broker.unclaimed_replies(), 1);
    }

    #[tokio::test]
    async fn deleted_consumer_is_reported() {
        let broker = broker();
        assert!(broker.consumer_exists().await.unwrap());
        broker.delete_consumer();
        assert!(!broker.consumer_exists().await.unwrap());
    }
}
