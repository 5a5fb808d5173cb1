//! Consumer registry and delivery dispatch.
//!
//! Each registration owns an unbounded queue drained by its own task, so
//! the frame reader only ever enqueues. A slow callback delays later
//! deliveries to the same consumer tag and nothing else.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use amqprims_frame::BasicProperties;
use bytes::Bytes;
use futures_core::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::Error;

/// One message delivered to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// Delivery callback. Completion has no effect on acknowledgement; call
/// `basic_ack` explicitly when consuming without `no_ack`.
#[derive(Clone)]
pub struct Callback(Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>);

impl Callback {
    /// Callback taking (consumer tag, delivery tag, body).
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(String, u64, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Arc::new(move |delivery: Delivery| -> BoxFuture<'static, ()> {
            Box::pin(f(
                delivery.consumer_tag,
                delivery.delivery_tag,
                delivery.body,
            ))
        }))
    }

    /// Callback taking the whole [`Delivery`].
    pub fn from_delivery<F, Fut>(f: F) -> Self
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Arc::new(move |delivery: Delivery| -> BoxFuture<'static, ()> {
            Box::pin(f(delivery))
        }))
    }

    /// Callback forwarding every delivery into a channel.
    pub fn channel(tx: mpsc::UnboundedSender<Delivery>) -> Self {
        Self::from_delivery(move |delivery| {
            let _ = tx.send(delivery);
            async {}
        })
    }

    fn call(&self, delivery: Delivery) -> BoxFuture<'static, ()> {
        (self.0)(delivery)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback")
    }
}

/// Why a consumer stopped receiving deliveries.
#[derive(Debug, Clone)]
pub enum ConsumerEnd {
    /// Cancelled with `basic_cancel`.
    Cancelled,
    /// The broker sent Basic.Cancel (queue deleted, node failure, ...).
    CancelledByBroker,
    /// The channel or connection closed.
    Closed(Error),
}

/// Handle to a live consumer registration.
#[derive(Debug, Clone)]
pub struct Consumer {
    tag: String,
    end: watch::Receiver<Option<ConsumerEnd>>,
}

impl Consumer {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_active(&self) -> bool {
        self.end.borrow().is_none()
    }

    /// Wait until no further deliveries will arrive.
    pub async fn closed(&self) -> ConsumerEnd {
        let mut end = self.end.clone();
        let result = end
            .wait_for(Option::is_some)
            .await
            .map(|value| value.clone());
        match result {
            Ok(Some(reason)) => reason,
            _ => ConsumerEnd::Closed(Error::connection_closed(0, "dropped")),
        }
    }
}

struct Registration {
    queue: mpsc::UnboundedSender<Delivery>,
    end: watch::Sender<Option<ConsumerEnd>>,
}

/// consumer-tag → callback for one channel.
#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    channel: u16,
    entries: HashMap<String, Registration>,
}

impl ConsumerRegistry {
    pub(crate) fn new(channel: u16) -> Self {
        Self {
            channel,
            entries: HashMap::new(),
        }
    }

    pub(crate) fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Register `callback` under `tag` and start its dispatch task.
    /// Must run inside a tokio runtime.
    pub(crate) fn register(&mut self, tag: String, callback: Callback) -> Consumer {
        let (queue, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let (end, end_rx) = watch::channel(None);

        let channel = self.channel;
        let worker_tag = tag.clone();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                callback.call(delivery).await;
            }
            debug!(channel, consumer_tag = %worker_tag, "consumer dispatch finished");
        });

        debug!(channel, consumer_tag = %tag, "consumer registered");
        self.entries.insert(tag.clone(), Registration { queue, end });
        Consumer { tag, end: end_rx }
    }

    /// Schedule a delivery. Unknown tags, and tags whose dispatch task
    /// died, are dropped with a warning.
    pub(crate) fn dispatch(&self, delivery: Delivery) -> bool {
        match self.entries.get(&delivery.consumer_tag) {
            Some(registration) => match registration.queue.send(delivery) {
                Ok(()) => true,
                Err(mpsc::error::SendError(lost)) => {
                    warn!(
                        channel = self.channel,
                        consumer_tag = %lost.consumer_tag,
                        delivery_tag = lost.delivery_tag,
                        "consumer dispatch task gone, dropping delivery"
                    );
                    false
                }
            },
            None => {
                warn!(
                    channel = self.channel,
                    consumer_tag = %delivery.consumer_tag,
                    delivery_tag = delivery.delivery_tag,
                    "dropping delivery for unknown consumer"
                );
                false
            }
        }
    }

    /// Stop future dispatch for `tag`. Already queued deliveries still run.
    pub(crate) fn remove(&mut self, tag: &str, reason: ConsumerEnd) -> bool {
        match self.entries.remove(tag) {
            Some(registration) => {
                let _ = registration.end.send(Some(reason));
                true
            }
            None => false,
        }
    }

    pub(crate) fn close_all(&mut self, reason: &Error) {
        for (_, registration) in self.entries.drain() {
            let _ = registration
                .end
                .send(Some(ConsumerEnd::Closed(reason.clone())));
        }
    }
}
