//! Typed wrappers over [`Channel::call`] for the exchange, queue, basic,
//! confirm and tx classes.

use amqprims_frame::method::{self, Arg};
use amqprims_frame::{BasicProperties, FieldTable, Method};
use bytes::Bytes;

use crate::channel::{Channel, Confirmation, Reply};
use crate::consumer::{Callback, Consumer};
use crate::error::{Error, Result};
use crate::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, BindOptions,
    ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeKind, QueueDeclareOptions,
    QueueDeleteOptions,
};

/// Reply to `queue_declare`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclareOk {
    /// The queue name; broker-generated when an empty name was declared.
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A message fetched with `basic_get`.
#[derive(Debug, Clone, PartialEq)]
pub struct GetMessage {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    /// Messages left in the queue after this one.
    pub message_count: u32,
    pub properties: BasicProperties,
    pub body: Bytes,
}

impl Channel {
    async fn request(&self, method: Method) -> Result<Reply> {
        self.call(method, None).await
    }

    /// Call, or send without waiting when `no_wait` is set.
    async fn request_or_cast(&self, method: Method) -> Result<Option<Reply>> {
        if method.no_wait() {
            self.shared.cast(method)?;
            Ok(None)
        } else {
            self.request(method).await.map(Some)
        }
    }

    pub async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<()> {
        let method = Method::with_args(
            method::EXCHANGE_DECLARE,
            [
                ("exchange", Arg::from(exchange)),
                ("type", Arg::from(kind.as_str())),
                ("passive", Arg::Bit(options.passive)),
                ("durable", Arg::Bit(options.durable)),
                ("auto_delete", Arg::Bit(options.auto_delete)),
                ("internal", Arg::Bit(options.internal)),
                ("no_wait", Arg::Bit(options.no_wait)),
                ("arguments", Arg::Table(options.arguments)),
            ],
        )?;
        self.request_or_cast(method).await?;
        Ok(())
    }

    pub async fn exchange_delete(&self, exchange: &str, options: ExchangeDeleteOptions) -> Result<()> {
        let method = Method::with_args(
            method::EXCHANGE_DELETE,
            [
                ("exchange", Arg::from(exchange)),
                ("if_unused", Arg::Bit(options.if_unused)),
                ("no_wait", Arg::Bit(options.no_wait)),
            ],
        )?;
        self.request_or_cast(method).await?;
        Ok(())
    }

    /// Route messages from `source` to `destination` exchange.
    pub async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: BindOptions,
    ) -> Result<()> {
        let method = exchange_binding(method::EXCHANGE_BIND, destination, source, routing_key, options)?;
        self.request_or_cast(method).await?;
        Ok(())
    }

    pub async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: BindOptions,
    ) -> Result<()> {
        let method =
            exchange_binding(method::EXCHANGE_UNBIND, destination, source, routing_key, options)?;
        self.request_or_cast(method).await?;
        Ok(())
    }

    /// Declare a queue. An empty name asks the broker to generate one.
    ///
    /// With `no_wait` the counts are reported as zero and the name is the
    /// one supplied.
    pub async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
    ) -> Result<QueueDeclareOk> {
        if options.no_wait && queue.is_empty() {
            return Err(Error::ConfigurationError(
                "a server-named queue cannot be declared with no_wait".into(),
            ));
        }
        let method = Method::with_args(
            method::QUEUE_DECLARE,
            [
                ("queue", Arg::from(queue)),
                ("passive", Arg::Bit(options.passive)),
                ("durable", Arg::Bit(options.durable)),
                ("exclusive", Arg::Bit(options.exclusive)),
                ("auto_delete", Arg::Bit(options.auto_delete)),
                ("no_wait", Arg::Bit(options.no_wait)),
                ("arguments", Arg::Table(options.arguments)),
            ],
        )?;
        match self.request_or_cast(method).await? {
            Some(reply) => Ok(QueueDeclareOk {
                queue: reply
                    .method
                    .short_str("queue")
                    .unwrap_or_default()
                    .to_string(),
                message_count: reply.method.long("message_count").unwrap_or(0),
                consumer_count: reply.method.long("consumer_count").unwrap_or(0),
            }),
            None => Ok(QueueDeclareOk {
                queue: queue.to_string(),
                message_count: 0,
                consumer_count: 0,
            }),
        }
    }

    pub async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: BindOptions,
    ) -> Result<()> {
        let method = Method::with_args(
            method::QUEUE_BIND,
            [
                ("queue", Arg::from(queue)),
                ("exchange", Arg::from(exchange)),
                ("routing_key", Arg::from(routing_key)),
                ("no_wait", Arg::Bit(options.no_wait)),
                ("arguments", Arg::Table(options.arguments)),
            ],
        )?;
        self.request_or_cast(method).await?;
        Ok(())
    }

    pub async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        let method = Method::with_args(
            method::QUEUE_UNBIND,
            [
                ("queue", Arg::from(queue)),
                ("exchange", Arg::from(exchange)),
                ("routing_key", Arg::from(routing_key)),
                ("arguments", Arg::Table(arguments)),
            ],
        )?;
        self.request(method).await?;
        Ok(())
    }

    /// Remove all ready messages; returns how many were purged.
    pub async fn queue_purge(&self, queue: &str) -> Result<u32> {
        let method = Method::with_args(method::QUEUE_PURGE, [("queue", Arg::from(queue))])?;
        let reply = self.request(method).await?;
        Ok(reply.method.long("message_count").unwrap_or(0))
    }

    /// Delete a queue; returns how many messages it held.
    pub async fn queue_delete(&self, queue: &str, options: QueueDeleteOptions) -> Result<u32> {
        let method = Method::with_args(
            method::QUEUE_DELETE,
            [
                ("queue", Arg::from(queue)),
                ("if_unused", Arg::Bit(options.if_unused)),
                ("if_empty", Arg::Bit(options.if_empty)),
                ("no_wait", Arg::Bit(options.no_wait)),
            ],
        )?;
        Ok(self
            .request_or_cast(method)
            .await?
            .and_then(|reply| reply.method.long("message_count"))
            .unwrap_or(0))
    }

    pub async fn basic_qos(&self, options: BasicQosOptions) -> Result<()> {
        let method = Method::with_args(
            method::BASIC_QOS,
            [
                ("prefetch_size", Arg::Long(options.prefetch_size)),
                ("prefetch_count", Arg::Short(options.prefetch_count)),
                ("global", Arg::Bit(options.global)),
            ],
        )?;
        self.request(method).await?;
        Ok(())
    }

    /// Start a consumer. `callback` runs once per delivery, in delivery
    /// order, on a task of its own.
    ///
    /// Reusing a tag already active on this channel fails with
    /// `ChannelClosed` (530) before anything is sent, and the existing
    /// consumer keeps receiving.
    pub async fn basic_consume(
        &self,
        queue: &str,
        options: BasicConsumeOptions,
        callback: Callback,
    ) -> Result<Consumer> {
        if options.no_wait && options.consumer_tag.is_empty() {
            return Err(Error::ConfigurationError(
                "basic_consume with no_wait needs an explicit consumer tag".into(),
            ));
        }
        let method = Method::with_args(
            method::BASIC_CONSUME,
            [
                ("queue", Arg::from(queue)),
                ("consumer_tag", Arg::from(options.consumer_tag)),
                ("no_local", Arg::Bit(options.no_local)),
                ("no_ack", Arg::Bit(options.no_ack)),
                ("exclusive", Arg::Bit(options.exclusive)),
                ("no_wait", Arg::Bit(options.no_wait)),
                ("arguments", Arg::Table(options.arguments)),
            ],
        )?;

        if options.no_wait {
            return self.shared.consume_no_wait(method, callback);
        }
        let reply = self.shared.rpc(method, Some(callback), self.timeout).await?;
        reply.consumer.ok_or_else(|| {
            Error::ProtocolViolation("basic.consume-ok without a registered consumer".into())
        })
    }

    /// Stop a consumer. Deliveries already received still reach its
    /// callback.
    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        let method =
            Method::with_args(method::BASIC_CANCEL, [("consumer_tag", Arg::from(consumer_tag))])?;
        let result = self.request(method).await;
        if result.is_err() {
            self.shared.remove_consumer(consumer_tag);
        }
        result.map(|_| ())
    }

    /// Publish a message. In confirm mode this waits for the broker's ack
    /// or nack; otherwise it returns once the frames are queued.
    pub async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Bytes>,
        options: BasicPublishOptions,
    ) -> Result<Confirmation> {
        let method = Method::with_args(
            method::BASIC_PUBLISH,
            [
                ("exchange", Arg::from(exchange)),
                ("routing_key", Arg::from(routing_key)),
                ("mandatory", Arg::Bit(options.mandatory)),
                ("immediate", Arg::Bit(options.immediate)),
            ],
        )?;
        self.shared
            .publish(method, options.properties, body.into())
            .await
    }

    /// Fetch one message, or `None` when the queue is empty.
    pub async fn basic_get(&self, queue: &str, no_ack: bool) -> Result<Option<GetMessage>> {
        let method = Method::with_args(
            method::BASIC_GET,
            [("queue", Arg::from(queue)), ("no_ack", Arg::Bit(no_ack))],
        )?;
        let reply = self.request(method).await?;
        if reply.method.id() == method::BASIC_GET_EMPTY {
            return Ok(None);
        }
        let message = reply.message.ok_or_else(|| {
            Error::ProtocolViolation("basic.get-ok resolved without content".into())
        })?;
        let m = &reply.method;
        Ok(Some(GetMessage {
            delivery_tag: m.long_long("delivery_tag").unwrap_or(0),
            redelivered: m.bit("redelivered").unwrap_or(false),
            exchange: m.short_str("exchange").unwrap_or_default().to_string(),
            routing_key: m.short_str("routing_key").unwrap_or_default().to_string(),
            message_count: m.long("message_count").unwrap_or(0),
            properties: message.properties,
            body: message.body,
        }))
    }

    pub fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.shared.cast(Method::new(
            method::BASIC_ACK,
            vec![Arg::LongLong(delivery_tag), Arg::Bit(multiple)],
        )?)
    }

    pub fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.shared.cast(Method::new(
            method::BASIC_NACK,
            vec![
                Arg::LongLong(delivery_tag),
                Arg::Bit(multiple),
                Arg::Bit(requeue),
            ],
        )?)
    }

    pub fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.shared.cast(Method::new(
            method::BASIC_REJECT,
            vec![Arg::LongLong(delivery_tag), Arg::Bit(requeue)],
        )?)
    }

    /// Redeliver all unacknowledged messages on this channel.
    pub async fn basic_recover(&self, requeue: bool) -> Result<()> {
        self.request(Method::new(method::BASIC_RECOVER, vec![Arg::Bit(requeue)])?)
            .await?;
        Ok(())
    }

    /// Put the channel in publisher-confirm mode. Subsequent publishes
    /// resolve to `Ack` or `Nack`.
    pub async fn confirm_select(&self) -> Result<()> {
        self.request(Method::new(method::CONFIRM_SELECT, vec![Arg::Bit(false)])?)
            .await?;
        Ok(())
    }

    pub async fn tx_select(&self) -> Result<()> {
        self.request(Method::new(method::TX_SELECT, Vec::new())?).await?;
        Ok(())
    }

    pub async fn tx_commit(&self) -> Result<()> {
        self.request(Method::new(method::TX_COMMIT, Vec::new())?).await?;
        Ok(())
    }

    pub async fn tx_rollback(&self) -> Result<()> {
        self.request(Method::new(method::TX_ROLLBACK, Vec::new())?)
            .await?;
        Ok(())
    }

    /// Ask the broker to pause (`false`) or resume (`true`) deliveries.
    /// Returns the state the broker acknowledged.
    pub async fn flow(&self, active: bool) -> Result<bool> {
        let reply = self
            .request(Method::new(method::CHANNEL_FLOW, vec![Arg::Bit(active)])?)
            .await?;
        Ok(reply.method.bit("active").unwrap_or(active))
    }
}

fn exchange_binding(
    id: method::MethodId,
    destination: &str,
    source: &str,
    routing_key: &str,
    options: BindOptions,
) -> Result<Method> {
    Ok(Method::with_args(
        id,
        [
            ("destination", Arg::from(destination)),
            ("source", Arg::from(source)),
            ("routing_key", Arg::from(routing_key)),
            ("no_wait", Arg::Bit(options.no_wait)),
            ("arguments", Arg::Table(options.arguments)),
        ],
    )?)
}
