//! In-process event bus: the addressing and request-reply contract.
//!
//! The production transport is an external message bus; only its
//! contract matters here. Addresses are opaque unique
//! tokens. A consumer registered at an address receives messages in
//! arrival order. `request` expects exactly one reply (success body or
//! a `{code, message}` failure); `publish` is fire-and-forget and may
//! be called from non-async contexts such as engine callback threads.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Structured failure reply carried back to a requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFailure {
    pub code: u16,
    pub message: String,
}

impl BusFailure {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for BusFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for BusFailure {}

/// One inbound delivery. Request-path messages carry a reply slot and
/// must be answered exactly once; published messages have no slot.
pub struct Message {
    body: Bytes,
    reply_tx: Option<oneshot::Sender<Result<Bytes, BusFailure>>>,
}

impl Message {
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Answer the request with a success body. No-op for published
    /// messages or if the requester has gone away.
    pub fn reply(mut self, body: Bytes) {
        if let Some(tx) = self.reply_tx.take() {
            if tx.send(Ok(body)).is_err() {
                trace!("requester dropped before reply");
            }
        }
    }

    /// Answer the request with a structured failure.
    pub fn fail(mut self, code: u16, message: impl Into<String>) {
        if let Some(tx) = self.reply_tx.take() {
            if tx.send(Err(BusFailure::new(code, message))).is_err() {
                trace!("requester dropped before failure reply");
            }
        }
    }
}

/// Receiving end of a registered address. Deregisters itself on drop.
pub struct Consumer {
    address: String,
    rx: mpsc::UnboundedReceiver<Message>,
    tx: mpsc::UnboundedSender<Message>,
    bus: EventBus,
}

impl Consumer {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Next message in arrival order; `None` once the address has been
    /// unregistered and the backlog is drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let mut senders = self.bus.senders.write();
        // Remove only this consumer's own registration; a later
        // registration at the same address stays live.
        let is_current = senders
            .get(&self.address)
            .is_some_and(|tx| tx.same_channel(&self.tx));
        if is_current {
            senders.remove(&self.address);
            debug!(address = %self.address, "consumer unregistered");
        }
    }
}

/// Cloneable handle to the shared routing table.
#[derive(Clone, Default)]
pub struct EventBus {
    senders: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer at `address`. Addresses are expected to be
    /// unique; a duplicate registration replaces the previous consumer.
    pub fn consumer(&self, address: &str) -> Consumer {
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self.senders.write().insert(address.to_string(), tx.clone());
        if previous.is_some() {
            warn!(address, "replacing existing consumer registration");
        } else {
            debug!(address, "consumer registered");
        }
        Consumer {
            address: address.to_string(),
            rx,
            tx,
            bus: self.clone(),
        }
    }

    /// Remove the consumer registration for `address`, if any. The
    /// consumer's `recv` returns `None` once its backlog drains.
    pub fn unregister(&self, address: &str) {
        if self.senders.write().remove(address).is_some() {
            debug!(address, "consumer unregistered");
        }
    }

    pub fn is_registered(&self, address: &str) -> bool {
        self.senders.read().contains_key(address)
    }

    /// Request/reply exchange. Fails with `404` when nothing is
    /// registered at `address`.
    pub async fn request(&self, address: &str, body: Bytes) -> Result<Bytes, BusFailure> {
        let sender = self.senders.read().get(address).cloned();
        let Some(sender) = sender else {
            return Err(BusFailure::new(
                404,
                format!("no consumer registered at address: {address}"),
            ));
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let message = Message {
            body,
            reply_tx: Some(reply_tx),
        };
        if sender.send(message).is_err() {
            return Err(BusFailure::new(
                404,
                format!("no consumer registered at address: {address}"),
            ));
        }
        match reply_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BusFailure::new(
                503,
                format!("consumer at {address} stopped before replying"),
            )),
        }
    }

    /// Fire-and-forget delivery. Messages to unregistered addresses are
    /// dropped; publishers racing with consumer teardown are expected.
    pub fn publish(&self, address: &str, body: Bytes) {
        let sender = self.senders.read().get(address).cloned();
        match sender {
            Some(sender) => {
                let message = Message {
                    body,
                    reply_tx: None,
                };
                if sender.send(message).is_err() {
                    trace!(address, "publish raced with consumer teardown, dropped");
                }
            }
            None => trace!(address, "no consumer for published message, dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_reply_roundtrip() {
        let bus = EventBus::new();
        let mut consumer = bus.consumer("addr");
        let task = tokio::spawn(async move {
            let msg = consumer.recv().await.unwrap();
            assert_eq!(msg.body().as_ref(), b"ping");
            msg.reply(Bytes::from_static(b"pong"));
        });
        let reply = bus.request("addr", Bytes::from_static(b"ping")).await;
        assert_eq!(reply.unwrap().as_ref(), b"pong");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn request_without_consumer_fails_not_found() {
        let bus = EventBus::new();
        let err = bus
            .request("nowhere", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.code, 404);
    }

    #[tokio::test]
    async fn failure_reply_carries_code_and_message() {
        let bus = EventBus::new();
        let mut consumer = bus.consumer("addr");
        tokio::spawn(async move {
            let msg = consumer.recv().await.unwrap();
            msg.fail(405, "Unsupported action: null");
        });
        let err = bus
            .request("addr", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.code, 405);
        assert!(err.message.contains("null"));
    }

    #[tokio::test]
    async fn publish_to_missing_address_is_dropped() {
        let bus = EventBus::new();
        // Must not panic or block.
        bus.publish("nowhere", Bytes::from_static(b"token"));
    }

    #[tokio::test]
    async fn unregister_ends_consumer_stream() {
        let bus = EventBus::new();
        let mut consumer = bus.consumer("addr");
        bus.publish("addr", Bytes::from_static(b"one"));
        bus.unregister("addr");
        assert!(consumer.recv().await.is_some());
        assert!(consumer.recv().await.is_none());
    }

    #[tokio::test]
    async fn consumer_drop_deregisters_address() {
        let bus = EventBus::new();
        {
            let _consumer = bus.consumer("addr");
            assert!(bus.is_registered("addr"));
        }
        assert!(!bus.is_registered("addr"));
    }

    #[tokio::test]
    async fn dropping_a_replaced_consumer_keeps_the_replacement() {
        let bus = EventBus::new();
        let stale = bus.consumer("addr");
        let mut current = bus.consumer("addr");
        drop(stale);
        assert!(bus.is_registered("addr"));
        bus.publish("addr", Bytes::from_static(b"still routed"));
        let message = current.recv().await.unwrap();
        assert_eq!(message.body().as_ref(), b"still routed");
    }
}
