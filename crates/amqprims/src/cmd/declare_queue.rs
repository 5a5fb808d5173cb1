use amqprims_client::QueueDeclareOptions;
use serde::Serialize;

use crate::cmd::DeclareQueueArgs;
use crate::exit::{client_error, CliResult, SUCCESS};
use crate::output::{print_json, print_pairs, OutputFormat};

#[derive(Serialize)]
struct DeclareOutput {
    queue: String,
    message_count: u32,
    consumer_count: u32,
}

pub async fn run(args: DeclareQueueArgs, format: OutputFormat) -> CliResult<i32> {
    let conn = args.conn.connect().await?;
    let channel = conn
        .open_channel()
        .await
        .map_err(|err| client_error("channel open failed", err))?;

    let options = QueueDeclareOptions {
        passive: args.passive,
        durable: args.durable,
        exclusive: args.exclusive,
        auto_delete: args.auto_delete,
        ..QueueDeclareOptions::default()
    };
    let ok = channel
        .queue_declare(&args.queue, options)
        .await
        .map_err(|err| client_error("queue.declare failed", err))?;

    let out = DeclareOutput {
        queue: ok.queue,
        message_count: ok.message_count,
        consumer_count: ok.consumer_count,
    };
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => print_pairs(
            ["QUEUE", "VALUE"],
            &[
                ("name".to_string(), out.queue.clone()),
                ("messages".to_string(), out.message_count.to_string()),
                ("consumers".to_string(), out.consumer_count.to_string()),
            ],
        ),
        OutputFormat::Pretty => println!(
            "queue={} messages={} consumers={}",
            out.queue, out.message_count, out.consumer_count
        ),
    }

    conn.close()
        .await
        .map_err(|err| client_error("close failed", err))?;
    Ok(SUCCESS)
}
