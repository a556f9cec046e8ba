use std::sync::Arc;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::debug;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use relink::consts::DEFAULT_PORT;
use relink::error::RelinkClientError;
use relink::{client, logger, Config, PubsubClient};

#[derive(Parser, Debug)]
#[clap(name = "relink-cli", version, author, about = "Issue Redis commands")]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    #[clap(name = "hostname", long, default_value = "127.0.0.1")]
    host: String,

    #[clap(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[derive(Subcommand, Debug)]
enum Command {
    Ping {
        msg: Option<String>,
    },
    Get {
        key: String,
    },
    Set {
        key: String,

        #[clap(parse(from_str = bytes_from_str))]
        value: Bytes,
    },
    Del {
        key: String,
    },
    Publish {
        channel: String,

        #[clap(parse(from_str = bytes_from_str))]
        message: Bytes,
    },
    Subscribe {
        channels: Vec<String>,
    },
}

fn bytes_from_str(src: &str) -> Bytes {
    Bytes::from(src.to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), RelinkClientError> {
    dotenv().ok();
    logger::init();

    let cli = Cli::parse();
    debug!("client started: {:?}", cli);
    let uri = format!("redis://{}:{}", cli.host, cli.port);

    match cli.command {
        Command::Ping { msg } => {
            let client = client::connect(&uri).await?;
            let v = client.ping(msg).await?;
            if let Ok(s) = std::str::from_utf8(&v) {
                println!("\"{}\"", s);
            } else {
                println!("{:?}", v);
            }
        }

        Command::Get { key } => {
            let client = client::connect(&uri).await?;
            if let Some(v) = client.get(&key).await? {
                if let Ok(s) = std::str::from_utf8(&v) {
                    println!("\"{}\"", s);
                } else {
                    println!("{:?}", v);
                }
            } else {
                println!("(nil)");
            }
        }

        Command::Set { key, value } => {
            let client = client::connect(&uri).await?;
            client.set(&key, value).await?;
            println!("OK");
        }

        Command::Del { key } => {
            let client = client::connect(&uri).await?;
            let removed = client.del(&key).await?;
            println!("(integer) {}", removed);
        }

        Command::Publish { channel, message } => {
            let client = client::connect(&uri).await?;
            let receivers = client.publish(&channel, message).await?;
            println!("(integer) {}", receivers);
        }

        Command::Subscribe { channels } => {
            if channels.is_empty() {
                return Err(RelinkClientError::Config(
                    "channel(s) must be provided".into(),
                ));
            }

            let subscriber = PubsubClient::new(Config::from_uri(&uri)?);
            subscriber.connect().await?;

            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            for channel in &channels {
                let tx = tx.clone();
                let ack = subscriber.subscribe(
                    channel,
                    Arc::new(move |msg| {
                        let _ = tx.send(msg.clone());
                    }),
                );
                ack.await?;
            }

            let mut messages = UnboundedReceiverStream::new(rx);
            while let Some(msg) = messages.next().await {
                println!(
                    "got message from the channel: {}; message = {:?}",
                    msg.channel, msg.content
                );
            }
        }
    }
    Ok(())
}
