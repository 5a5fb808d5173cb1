use std::io::IsTerminal;

use amqprims_client::Delivery;
use amqprims_frame::{FieldTable, FieldValue};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

/// Two-column table, one row per (key, value) pair.
pub fn print_pairs(header: [&str; 2], rows: &[(String, String)]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    for (key, value) in rows {
        table.add_row(vec![key.clone(), value.clone()]);
    }
    println!("{table}");
}

#[derive(Serialize)]
struct DeliveryOutput<'a> {
    consumer_tag: &'a str,
    delivery_tag: u64,
    redelivered: bool,
    exchange: &'a str,
    routing_key: &'a str,
    content_type: Option<&'a str>,
    body_size: usize,
    body: String,
}

pub fn print_delivery(delivery: &Delivery, format: OutputFormat) {
    let body = payload_preview(&delivery.body);
    match format {
        OutputFormat::Json => print_json(&DeliveryOutput {
            consumer_tag: &delivery.consumer_tag,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: &delivery.exchange,
            routing_key: &delivery.routing_key,
            content_type: delivery.properties.content_type.as_deref(),
            body_size: delivery.body.len(),
            body,
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["TAG", "EXCHANGE", "ROUTING KEY", "SIZE", "BODY"])
                .add_row(vec![
                    delivery.delivery_tag.to_string(),
                    display_exchange(&delivery.exchange).to_string(),
                    delivery.routing_key.clone(),
                    delivery.body.len().to_string(),
                    body,
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "tag={} exchange={} routing_key={} redelivered={} size={} body={}",
                delivery.delivery_tag,
                display_exchange(&delivery.exchange),
                delivery.routing_key,
                delivery.redelivered,
                delivery.body.len(),
                body
            );
        }
    }
}

/// The default exchange has an empty name.
pub fn display_exchange(name: &str) -> &str {
    if name.is_empty() {
        "(default)"
    } else {
        name
    }
}

pub fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

pub fn table_to_json(table: &FieldTable) -> Value {
    Value::Object(
        table
            .iter()
            .map(|(key, value)| (key.clone(), field_to_json(value)))
            .collect::<Map<_, _>>(),
    )
}

pub fn field_to_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::Boolean(v) => Value::from(*v),
        FieldValue::ShortShortInt(v) => Value::from(*v),
        FieldValue::ShortShortUInt(v) => Value::from(*v),
        FieldValue::ShortInt(v) => Value::from(*v),
        FieldValue::ShortUInt(v) => Value::from(*v),
        FieldValue::LongInt(v) => Value::from(*v),
        FieldValue::LongUInt(v) => Value::from(*v),
        FieldValue::LongLongInt(v) => Value::from(*v),
        FieldValue::Float(v) => Value::from(*v),
        FieldValue::Double(v) => Value::from(*v),
        FieldValue::Decimal { scale, value } => {
            Value::from(f64::from(*value) / 10f64.powi(i32::from(*scale)))
        }
        FieldValue::LongString(bytes) | FieldValue::ByteArray(bytes) => {
            Value::from(payload_preview(bytes))
        }
        FieldValue::Array(items) => Value::Array(items.iter().map(field_to_json).collect()),
        FieldValue::Timestamp(v) => Value::from(*v),
        FieldValue::Table(table) => table_to_json(table),
        FieldValue::Void => Value::Null,
    }
}

/// Flatten a field value into a single table cell.
pub fn field_to_text(value: &FieldValue) -> String {
    match value {
        FieldValue::LongString(bytes) | FieldValue::ByteArray(bytes) => payload_preview(bytes),
        other => field_to_json(other).to_string(),
    }
}
