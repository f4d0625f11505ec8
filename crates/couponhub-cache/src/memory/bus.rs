//! In-memory message bus with consumer groups.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;
use couponhub_core::traits::bus::{BusMessage, BusSubscription, Delivery, MessageBus};

#[derive(Debug, Default)]
struct Group {
    /// Deliveries waiting to be handed out, oldest first.
    pending: VecDeque<Delivery>,
    /// Deliveries handed out and not yet acked, by id.
    unacked: HashMap<String, Delivery>,
    notify: Arc<Notify>,
}

impl Group {
    fn holds(&self, id: &str) -> bool {
        self.unacked.contains_key(id) || self.pending.iter().any(|d| d.id == id)
    }
}

#[derive(Debug, Default)]
struct Topic {
    /// Messages not yet acked by every group, oldest first.
    log: VecDeque<(String, BusMessage)>,
    groups: HashMap<String, Group>,
}

impl Topic {
    /// Drop the log prefix every group has acked. Before any group joins
    /// the whole log is kept for the first one to replay.
    fn trim(&mut self) {
        if self.groups.is_empty() {
            return;
        }
        while let Some((id, _)) = self.log.front() {
            if self.groups.values().any(|g| g.holds(id)) {
                break;
            }
            self.log.pop_front();
        }
    }
}

#[derive(Debug, Default)]
struct BusState {
    topics: HashMap<String, Topic>,
    next_id: u64,
}

/// Message bus held in process memory.
///
/// Each topic keeps a log of the messages some group has yet to ack. A
/// group created after messages were published starts from the
/// beginning of that log, as a stream consumer group created at id `0`
/// would. A nacked delivery goes back to the front of its group's queue
/// with an incremented delivery count.
#[derive(Debug, Clone, Default)]
pub struct MemoryMessageBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryMessageBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of deliveries of `group` on `topic` that are not yet acked.
    pub fn outstanding(&self, topic: &str, group: &str) -> usize {
        lock(&self.state)
            .ok()
            .and_then(|state| {
                state
                    .topics
                    .get(topic)
                    .and_then(|t| t.groups.get(group))
                    .map(|g| g.pending.len() + g.unacked.len())
            })
            .unwrap_or(0)
    }

    /// Messages on `topic` still retained in its log: every message until
    /// a group joins, then those some group has not acked.
    pub fn published(&self, topic: &str) -> Vec<BusMessage> {
        lock(&self.state)
            .ok()
            .and_then(|state| {
                state
                    .topics
                    .get(topic)
                    .map(|t| t.log.iter().map(|(_, m)| m.clone()).collect())
            })
            .unwrap_or_default()
    }
}

fn lock(state: &Mutex<BusState>) -> AppResult<MutexGuard<'_, BusState>> {
    state
        .lock()
        .map_err(|_| AppError::message_bus("In-memory bus state poisoned"))
}

#[async_trait]
impl MessageBus for MemoryMessageBus {
    async fn publish(&self, topic: &str, message: &BusMessage) -> AppResult<()> {
        let mut state = lock(&self.state)?;
        state.next_id += 1;
        let id = format!("{}-0", state.next_id);

        let topic_state = state.topics.entry(topic.to_string()).or_default();
        topic_state.log.push_back((id.clone(), message.clone()));
        for group in topic_state.groups.values_mut() {
            group.pending.push_back(Delivery {
                id: id.clone(),
                message: message.clone(),
                delivery_count: 0,
            });
            group.notify.notify_one();
        }

        debug!(topic, id = %id, key = %message.key, "Published message");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> AppResult<Box<dyn BusSubscription>> {
        let notify = {
            let mut state = lock(&self.state)?;
            let topic_state = state.topics.entry(topic.to_string()).or_default();
            if !topic_state.groups.contains_key(group) {
                let pending = topic_state
                    .log
                    .iter()
                    .map(|(id, message)| Delivery {
                        id: id.clone(),
                        message: message.clone(),
                        delivery_count: 0,
                    })
                    .collect();
                topic_state.groups.insert(
                    group.to_string(),
                    Group {
                        pending,
                        ..Group::default()
                    },
                );
            }
            topic_state
                .groups
                .get(group)
                .map(|g| Arc::clone(&g.notify))
                .ok_or_else(|| AppError::internal("Consumer group vanished"))?
        };

        debug!(topic, group, consumer, "Joined consumer group");
        Ok(Box::new(MemorySubscription {
            state: Arc::clone(&self.state),
            topic: topic.to_string(),
            group: group.to_string(),
            notify,
        }))
    }
}

/// One consumer's handle on an in-memory consumer group.
#[derive(Debug)]
pub struct MemorySubscription {
    state: Arc<Mutex<BusState>>,
    topic: String,
    group: String,
    notify: Arc<Notify>,
}

impl MemorySubscription {
    fn with_group<T>(&self, f: impl FnOnce(&mut Group) -> T) -> AppResult<T> {
        let mut state = lock(&self.state)?;
        let missing = || {
            AppError::message_bus(format!(
                "Consumer group '{}' on '{}' does not exist",
                self.group, self.topic
            ))
        };
        let topic = state.topics.get_mut(&self.topic).ok_or_else(missing)?;
        let group = topic.groups.get_mut(&self.group).ok_or_else(missing)?;
        let out = f(group);
        topic.trim();
        Ok(out)
    }
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    async fn next(&mut self, wait: Duration) -> AppResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            let taken = self.with_group(|group| {
                group.pending.pop_front().map(|mut delivery| {
                    delivery.delivery_count += 1;
                    group.unacked.insert(delivery.id.clone(), delivery.clone());
                    delivery
                })
            })?;
            if taken.is_some() {
                return Ok(taken);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> AppResult<()> {
        self.with_group(|group| {
            group.unacked.remove(&delivery.id);
        })
    }

    async fn nack(&mut self, delivery: &Delivery) -> AppResult<()> {
        self.with_group(|group| {
            if let Some(d) = group.unacked.remove(&delivery.id) {
                group.pending.push_front(d);
                group.notify.notify_one();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str) -> BusMessage {
        BusMessage {
            key: key.to_string(),
            event_type: "coupon.reserved".to_string(),
            payload: serde_json::json!({ "k": key }),
        }
    }

    #[tokio::test]
    async fn test_late_group_replays_log() {
        let bus = MemoryMessageBus::new();
        bus.publish("t", &message("a")).await.unwrap();
        bus.publish("t", &message("b")).await.unwrap();

        let mut sub = bus.subscribe("t", "g", "c1").await.unwrap();
        let first = sub.next(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.message.key, "a");
        sub.ack(&first).await.unwrap();
        let second = sub.next(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.message.key, "b");
        sub.ack(&second).await.unwrap();

        assert!(sub.next(Duration::from_millis(10)).await.unwrap().is_none());
        assert_eq!(bus.outstanding("t", "g"), 0);
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_higher_count() {
        let bus = MemoryMessageBus::new();
        let mut sub = bus.subscribe("t", "g", "c1").await.unwrap();
        bus.publish("t", &message("a")).await.unwrap();

        let first = sub.next(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(first.delivery_count, 1);
        sub.nack(&first).await.unwrap();

        let again = sub.next(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_waiting_consumer_is_woken_by_publish() {
        let bus = MemoryMessageBus::new();
        let mut sub = bus.subscribe("t", "g", "c1").await.unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("t", &message("late")).await.unwrap();
        });

        let delivery = sub.next(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(delivery.message.key, "late");
    }

    #[tokio::test]
    async fn test_groups_each_see_every_message() {
        let bus = MemoryMessageBus::new();
        let mut a = bus.subscribe("t", "ga", "c").await.unwrap();
        let mut b = bus.subscribe("t", "gb", "c").await.unwrap();
        bus.publish("t", &message("x")).await.unwrap();

        assert!(a.next(Duration::from_millis(10)).await.unwrap().is_some());
        assert!(b.next(Duration::from_millis(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_log_is_trimmed_once_every_group_acked() {
        let bus = MemoryMessageBus::new();
        let mut a = bus.subscribe("t", "ga", "c").await.unwrap();
        let mut b = bus.subscribe("t", "gb", "c").await.unwrap();
        bus.publish("t", &message("x")).await.unwrap();
        bus.publish("t", &message("y")).await.unwrap();

        let x = a.next(Duration::from_millis(10)).await.unwrap().unwrap();
        a.ack(&x).await.unwrap();
        assert_eq!(bus.published("t").len(), 2);

        for _ in 0..2 {
            let d = b.next(Duration::from_millis(10)).await.unwrap().unwrap();
            b.ack(&d).await.unwrap();
        }
        // "y" is still pending in `ga`.
        assert_eq!(bus.published("t").len(), 1);

        let y = a.next(Duration::from_millis(10)).await.unwrap().unwrap();
        a.ack(&y).await.unwrap();
        assert!(bus.published("t").is_empty());
    }
}
