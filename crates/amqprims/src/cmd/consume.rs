use amqprims_client::{BasicConsumeOptions, BasicQosOptions, Callback, ConsumerEnd};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cmd::ConsumeArgs;
use crate::exit::{client_error, CliError, CliResult, FAILURE, SUCCESS};
use crate::output::{print_delivery, OutputFormat};

pub async fn run(args: ConsumeArgs, format: OutputFormat) -> CliResult<i32> {
    let conn = args.conn.connect().await?;
    let channel = conn
        .open_channel()
        .await
        .map_err(|err| client_error("channel open failed", err))?;

    if let Some(prefetch_count) = args.prefetch {
        channel
            .basic_qos(BasicQosOptions {
                prefetch_count,
                ..BasicQosOptions::default()
            })
            .await
            .map_err(|err| client_error("basic.qos failed", err))?;
    }

    let (tx, mut deliveries) = mpsc::unbounded_channel();
    let consumer = channel
        .basic_consume(
            &args.queue,
            BasicConsumeOptions::default().with_no_ack(args.no_ack),
            Callback::channel(tx),
        )
        .await
        .map_err(|err| client_error("basic.consume failed", err))?;
    info!(queue = %args.queue, consumer_tag = %consumer.tag(), "consuming");

    let mut received = 0usize;
    let outcome = loop {
        if args.count.is_some_and(|count| received >= count) {
            break Ok(());
        }
        tokio::select! {
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else {
                    break Ok(());
                };
                print_delivery(&delivery, format);
                if !args.no_ack {
                    channel
                        .basic_ack(delivery.delivery_tag, false)
                        .map_err(|err| client_error("basic.ack failed", err))?;
                }
                received += 1;
            }
            end = consumer.closed() => {
                break match end {
                    ConsumerEnd::Cancelled => Ok(()),
                    ConsumerEnd::CancelledByBroker => {
                        Err(CliError::new(FAILURE, "consumer cancelled by broker"))
                    }
                    ConsumerEnd::Closed(err) => Err(client_error("consume ended", err)),
                };
            }
            _ = tokio::signal::ctrl_c() => {
                info!(received, "interrupted");
                break Ok(());
            }
        }
    };
    outcome?;

    if consumer.is_active() {
        if let Err(err) = channel.basic_cancel(consumer.tag()).await {
            warn!(error = %err, "basic.cancel failed");
        }
    }
    conn.close()
        .await
        .map_err(|err| client_error("close failed", err))?;
    Ok(SUCCESS)
}
