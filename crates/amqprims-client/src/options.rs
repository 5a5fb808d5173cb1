//! Option structs for channel operations. All default to the protocol's
//! zero values.

use std::fmt;

use amqprims_frame::{BasicProperties, FieldTable};

/// Exchange routing algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    /// Plugin-provided types such as `x-delayed-message`.
    Custom(String),
}

impl ExchangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ExchangeKind {
    fn from(value: &str) -> Self {
        match value {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            other => ExchangeKind::Custom(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExchangeDeclareOptions {
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone, Default)]
pub struct ExchangeDeleteOptions {
    pub if_unused: bool,
    pub no_wait: bool,
}

#[derive(Debug, Clone, Default)]
pub struct QueueDeclareOptions {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone, Default)]
pub struct QueueDeleteOptions {
    pub if_unused: bool,
    pub if_empty: bool,
    pub no_wait: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BindOptions {
    pub no_wait: bool,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone, Default)]
pub struct BasicQosOptions {
    pub prefetch_size: u32,
    pub prefetch_count: u16,
    pub global: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BasicConsumeOptions {
    /// Empty lets the broker assign a tag.
    pub consumer_tag: String,
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    /// Requires an explicit `consumer_tag`.
    pub no_wait: bool,
    pub arguments: FieldTable,
}

impl BasicConsumeOptions {
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn with_no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = no_ack;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct BasicPublishOptions {
    pub mandatory: bool,
    pub immediate: bool,
    pub properties: BasicProperties,
}

impl BasicPublishOptions {
    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }
}
