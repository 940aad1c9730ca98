//! In-process relay with broker semantics: FIFO queue, outstanding deliveries that go back
//! to their original position on requeue, and injectable publish and connection failures.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use crate::models::errors::RelayError;
use crate::models::events::EventRecord;
use crate::relay::{Delivery, RelayConsumer, RelayPublisher};

#[derive(Debug, Clone)]
struct Message {
    /// Enqueue order, used to put requeued messages back where they were.
    seq: u64,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Message>,
    unacked: BTreeMap<u64, Message>,
    next_seq: u64,
    next_tag: u64,
    publish_failures: usize,
    acked: Vec<Vec<u8>>,
    rejected: Vec<Vec<u8>>,
    closed: bool,
    disconnected: bool,
    reconnect_failures: usize,
}

#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publisher(&self) -> MemoryPublisher {
        MemoryPublisher {
            relay: self.clone(),
        }
    }

    pub fn consumer(&self) -> MemoryConsumer {
        MemoryConsumer {
            relay: self.clone(),
        }
    }

    /// Enqueues a raw payload, bypassing serialization.
    pub async fn push_raw(&self, payload: Vec<u8>) {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.ready.push_back(Message {
            seq,
            payload,
            redelivered: false,
        });
        drop(state);
        self.notify.notify_waiters();
    }

    /// The next `count` publishes fail as if the broker were unreachable.
    pub async fn fail_next_publishes(&self, count: usize) {
        self.state.lock().await.publish_failures = count;
    }

    /// Ends the consumer stream once the queue has been drained.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Simulates a consumer crash: every outstanding delivery goes back to the queue.
    pub async fn drop_consumer_session(&self) {
        let mut state = self.state.lock().await;
        let outstanding: Vec<Message> = std::mem::take(&mut state.unacked).into_values().collect();
        for message in outstanding {
            requeue_in_order(&mut state.ready, message);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Simulates losing the consumer's connection: outstanding deliveries go back to the
    /// queue and every consumer call fails until the consumer reconnects.
    pub async fn disconnect_consumer(&self) {
        self.state.lock().await.disconnected = true;
        self.drop_consumer_session().await;
    }

    /// The next `count` reconnect attempts fail.
    pub async fn fail_next_reconnects(&self, count: usize) {
        self.state.lock().await.reconnect_failures = count;
    }

    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn unacked_len(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    pub async fn acked(&self) -> Vec<Vec<u8>> {
        self.state.lock().await.acked.clone()
    }

    pub async fn rejected(&self) -> Vec<Vec<u8>> {
        self.state.lock().await.rejected.clone()
    }

    /// Queued payloads decoded back into records, in queue order.
    pub async fn queued_records(&self) -> Vec<EventRecord> {
        self.state
            .lock()
            .await
            .ready
            .iter()
            .filter_map(|m| EventRecord::from_json(&m.payload).ok())
            .collect()
    }
}

fn requeue_in_order(ready: &mut VecDeque<Message>, mut message: Message) {
    message.redelivered = true;
    let position = ready
        .iter()
        .position(|m| m.seq > message.seq)
        .unwrap_or(ready.len());
    ready.insert(position, message);
}

pub struct MemoryPublisher {
    relay: MemoryRelay,
}

#[async_trait]
impl RelayPublisher for MemoryPublisher {
    async fn publish(&self, record: &EventRecord) -> Result<(), RelayError> {
        let payload = record.to_json()?;
        {
            let mut state = self.relay.state.lock().await;
            if state.publish_failures > 0 {
                state.publish_failures -= 1;
                return Err(RelayError::Unavailable {
                    reason: "broker unreachable".to_string(),
                });
            }
        }
        self.relay.push_raw(payload).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), RelayError> {
        Ok(())
    }
}

pub struct MemoryConsumer {
    relay: MemoryRelay,
}

fn connection_lost() -> RelayError {
    RelayError::Unavailable {
        reason: "connection reset by peer".to_string(),
    }
}

impl MemoryConsumer {
    async fn settle(&self, tag: u64) -> Result<(Message, tokio::sync::MutexGuard<'_, State>), RelayError> {
        let mut state = self.relay.state.lock().await;
        if state.disconnected {
            return Err(connection_lost());
        }
        let message = state
            .unacked
            .remove(&tag)
            .ok_or(RelayError::UnknownDelivery { tag })?;
        Ok((message, state))
    }
}

#[async_trait]
impl RelayConsumer for MemoryConsumer {
    async fn recv(&mut self) -> Result<Option<Delivery>, RelayError> {
        loop {
            let notified = self.relay.notify.notified();
            {
                let mut state = self.relay.state.lock().await;
                if state.disconnected {
                    return Err(connection_lost());
                }
                if let Some(message) = state.ready.pop_front() {
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    let delivery = Delivery {
                        tag,
                        payload: message.payload.clone(),
                        redelivered: message.redelivered,
                    };
                    state.unacked.insert(tag, message);
                    return Ok(Some(delivery));
                }
                if state.closed {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), RelayError> {
        let (message, mut state) = self.settle(tag).await?;
        state.acked.push(message.payload);
        Ok(())
    }

    async fn requeue(&mut self, tag: u64) -> Result<(), RelayError> {
        let (message, mut state) = self.settle(tag).await?;
        requeue_in_order(&mut state.ready, message);
        drop(state);
        self.relay.notify.notify_waiters();
        Ok(())
    }

    async fn reject(&mut self, tag: u64) -> Result<(), RelayError> {
        let (message, mut state) = self.settle(tag).await?;
        state.rejected.push(message.payload);
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), RelayError> {
        let mut state = self.relay.state.lock().await;
        if state.closed {
            return Err(RelayError::Unavailable {
                reason: "relay closed".to_string(),
            });
        }
        if state.reconnect_failures > 0 {
            state.reconnect_failures -= 1;
            return Err(RelayError::Unavailable {
                reason: "connection refused".to_string(),
            });
        }
        state.disconnected = false;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        self.relay.drop_consumer_session().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requeue_restores_original_position() {
        let relay = MemoryRelay::new();
        for payload in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] {
            relay.push_raw(payload).await;
        }
        let mut consumer = relay.consumer();

        let first = consumer.recv().await.unwrap().unwrap();
        assert_eq!(first.payload, b"a");
        assert!(!first.redelivered);
        consumer.requeue(first.tag).await.unwrap();

        let again = consumer.recv().await.unwrap().unwrap();
        assert_eq!(again.payload, b"a");
        assert!(again.redelivered);
        consumer.ack(again.tag).await.unwrap();

        let second = consumer.recv().await.unwrap().unwrap();
        assert_eq!(second.payload, b"b");
        consumer.reject(second.tag).await.unwrap();
        assert!(consumer.ack(second.tag).await.is_err());

        assert_eq!(relay.acked().await, vec![b"a".to_vec()]);
        assert_eq!(relay.rejected().await, vec![b"b".to_vec()]);
        assert_eq!(relay.ready_len().await, 1);
    }

    #[tokio::test]
    async fn test_dropped_session_redelivers_outstanding() {
        let relay = MemoryRelay::new();
        relay.push_raw(b"a".to_vec()).await;
        relay.push_raw(b"b".to_vec()).await;

        let mut consumer = relay.consumer();
        let a = consumer.recv().await.unwrap().unwrap();
        assert_eq!(a.payload, b"a");
        assert_eq!(relay.unacked_len().await, 1);

        consumer.close().await.unwrap();
        assert_eq!(relay.unacked_len().await, 0);

        let mut consumer = relay.consumer();
        let redelivered = consumer.recv().await.unwrap().unwrap();
        assert_eq!(redelivered.payload, b"a");
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn test_disconnect_fails_calls_until_reconnect() {
        let relay = MemoryRelay::new();
        relay.push_raw(b"a".to_vec()).await;

        let mut consumer = relay.consumer();
        let a = consumer.recv().await.unwrap().unwrap();
        relay.disconnect_consumer().await;
        assert!(consumer.ack(a.tag).await.is_err());
        assert!(consumer.recv().await.is_err());
        assert_eq!(relay.ready_len().await, 1);

        relay.fail_next_reconnects(1).await;
        assert!(consumer.reconnect().await.is_err());
        consumer.reconnect().await.unwrap();

        let again = consumer.recv().await.unwrap().unwrap();
        assert_eq!(again.payload, b"a");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_closed_relay_ends_stream() {
        let relay = MemoryRelay::new();
        let mut consumer = relay.consumer();
        let waiter = tokio::spawn(async move { consumer.recv().await });
        relay.close().await;
        assert!(waiter.await.unwrap().unwrap().is_none());
    }
}
