use serde::Serialize;
use serde_json::Value;

use crate::cmd::InfoArgs;
use crate::exit::{client_error, CliResult, SUCCESS};
use crate::output::{field_to_text, print_json, print_pairs, table_to_json, OutputFormat};

#[derive(Serialize)]
struct InfoOutput {
    addr: String,
    virtual_host: String,
    channel_max: u16,
    frame_max: u32,
    heartbeat: u16,
    server_properties: Value,
    connected: bool,
}

pub async fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let conn = args.conn.connect().await?;
    let tunables = conn.tunables();

    match format {
        OutputFormat::Json => print_json(&InfoOutput {
            addr: args.conn.addr(),
            virtual_host: args.conn.vhost.clone(),
            channel_max: tunables.channel_max,
            frame_max: tunables.frame_max,
            heartbeat: tunables.heartbeat,
            server_properties: table_to_json(conn.server_properties()),
            connected: true,
        }),
        OutputFormat::Table => {
            let mut rows = vec![
                ("broker".to_string(), args.conn.addr()),
                ("virtual_host".to_string(), args.conn.vhost.clone()),
                ("channel_max".to_string(), tunables.channel_max.to_string()),
                ("frame_max".to_string(), tunables.frame_max.to_string()),
                ("heartbeat".to_string(), format!("{}s", tunables.heartbeat)),
            ];
            rows.extend(
                conn.server_properties()
                    .iter()
                    .map(|(key, value)| (format!("server.{key}"), field_to_text(value))),
            );
            print_pairs(["PROPERTY", "VALUE"], &rows);
        }
        OutputFormat::Pretty => {
            println!("Connection Info:");
            println!("  Broker:       {}", args.conn.addr());
            println!("  Virtual host: {}", args.conn.vhost);
            println!("  Channel max:  {}", tunables.channel_max);
            println!("  Frame max:    {}", tunables.frame_max);
            match tunables.heartbeat {
                0 => println!("  Heartbeat:    disabled"),
                secs => println!("  Heartbeat:    {secs}s"),
            }
            for (key, value) in conn.server_properties() {
                println!("  {key}: {}", field_to_text(value));
            }
        }
    }

    conn.close()
        .await
        .map_err(|err| client_error("close failed", err))?;
    Ok(SUCCESS)
}
