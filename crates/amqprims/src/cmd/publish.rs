use std::fs;

use amqprims_client::{BasicPublishOptions, Confirmation};
use amqprims_frame::{BasicProperties, PERSISTENT};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::cmd::PublishArgs;
use crate::exit::{client_error, io_error, CliError, CliResult, FAILURE, SUCCESS};
use crate::output::{display_exchange, print_json, OutputFormat};

#[derive(Serialize)]
struct PublishOutput<'a> {
    exchange: &'a str,
    routing_key: &'a str,
    body_size: usize,
    confirmation: &'static str,
}

pub async fn run(args: PublishArgs, format: OutputFormat) -> CliResult<i32> {
    let body = resolve_body(&args)?;
    let body_size = body.len();

    let conn = args.conn.connect().await?;
    let channel = conn
        .open_channel()
        .await
        .map_err(|err| client_error("channel open failed", err))?;

    let (returned_tx, mut returned_rx) = mpsc::unbounded_channel();
    channel.on_return(move |returned| {
        let _ = returned_tx.send(returned);
    });

    if args.confirm {
        channel
            .confirm_select()
            .await
            .map_err(|err| client_error("confirm.select failed", err))?;
    }

    let options = BasicPublishOptions::default()
        .with_properties(properties(&args))
        .with_mandatory(args.mandatory);
    let confirmation = channel
        .basic_publish(&args.exchange, &args.routing_key, body, options)
        .await
        .map_err(|err| client_error("publish failed", err))?;

    // A Basic.Return precedes the CloseOk, so closing flushes it through.
    channel
        .close()
        .await
        .map_err(|err| client_error("channel close failed", err))?;
    conn.close()
        .await
        .map_err(|err| client_error("close failed", err))?;

    if let Ok(returned) = returned_rx.try_recv() {
        warn!(
            reply_code = returned.reply_code,
            exchange = %returned.exchange,
            routing_key = %returned.routing_key,
            "message returned by broker"
        );
        return Err(CliError::new(
            FAILURE,
            format!(
                "message returned: {} {}",
                returned.reply_code, returned.reply_text
            ),
        ));
    }

    let confirmation = confirmation_name(&confirmation);
    match format {
        OutputFormat::Json => print_json(&PublishOutput {
            exchange: &args.exchange,
            routing_key: &args.routing_key,
            body_size,
            confirmation,
        }),
        OutputFormat::Table | OutputFormat::Pretty => println!(
            "published {body_size} bytes to {} with routing key '{}' ({confirmation})",
            display_exchange(&args.exchange),
            args.routing_key
        ),
    }

    if confirmation == "nack" {
        return Err(CliError::new(FAILURE, "broker nacked the message"));
    }
    Ok(SUCCESS)
}

fn confirmation_name(confirmation: &Confirmation) -> &'static str {
    match confirmation {
        Confirmation::NotRequested => "unconfirmed",
        Confirmation::Ack => "ack",
        Confirmation::Nack => "nack",
    }
}

fn properties(args: &PublishArgs) -> BasicProperties {
    let mut properties = BasicProperties::default();
    if let Some(content_type) = &args.content_type {
        properties = properties.with_content_type(content_type);
    }
    if args.persistent {
        properties = properties.with_delivery_mode(PERSISTENT);
    }
    properties
}

fn resolve_body(args: &PublishArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), &err));
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::ConnectArgs;

    fn args(data: Option<&str>, persistent: bool) -> PublishArgs {
        PublishArgs {
            exchange: String::new(),
            routing_key: "jobs".into(),
            data: data.map(str::to_string),
            file: None,
            content_type: Some("text/plain".into()),
            persistent,
            mandatory: false,
            confirm: false,
            conn: ConnectArgs {
                host: "127.0.0.1".into(),
                port: 5672,
                user: "guest".into(),
                password: "guest".into(),
                vhost: "/".into(),
                heartbeat: 60,
                frame_max: 131_072,
                timeout: "5s".into(),
            },
        }
    }

    #[test]
    fn body_comes_from_data_or_is_empty() {
        assert_eq!(resolve_body(&args(Some("coucou"), false)).unwrap(), b"coucou");
        assert!(resolve_body(&args(None, false)).unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_reported() {
        let mut args = args(None, false);
        args.file = Some("/nonexistent/amqprims-body".into());
        let err = resolve_body(&args).unwrap_err();
        assert!(err.message.contains("/nonexistent/amqprims-body"));
    }

    #[test]
    fn persistent_flag_sets_delivery_mode() {
        let props = properties(&args(None, true));
        assert_eq!(props.delivery_mode, Some(PERSISTENT));
        assert_eq!(props.content_type.as_deref(), Some("text/plain"));
        assert_eq!(properties(&args(None, false)).delivery_mode, None);
    }
}
