use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use proctor_protocol::{ClientMessage, Register, Role, ServerMessage};
use tokio::time::{interval, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(name = "proctor-relay", author, version)]
#[command(about = "Proctoring signaling relay and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "PROCTOR_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:8090")]
    pub listen_addr: String,

    /// Seconds a fresh connection has to send `register`.
    #[arg(
        long,
        env = "PROCTOR_RELAY_REGISTRATION_TIMEOUT_SECS",
        default_value_t = 10
    )]
    pub registration_timeout_secs: u64,

    /// Sessions silent for longer than this are closed.
    #[arg(long, env = "PROCTOR_RELAY_IDLE_TIMEOUT_SECS", default_value_t = 120)]
    pub idle_timeout_secs: u64,

    #[arg(long, env = "PROCTOR_RELAY_RECYCLE_INTERVAL_SECS", default_value_t = 30)]
    pub recycle_interval_secs: u64,

    /// Comma separated test ids open for proctoring; empty accepts all.
    #[arg(long, env = "PROCTOR_RELAY_ACTIVE_TESTS", value_delimiter = ',')]
    pub active_tests: Vec<i64>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register against a relay and print every event it delivers
    Watch {
        /// Relay WebSocket URL
        #[arg(short, long, default_value = "ws://127.0.0.1:8090/ws")]
        url: String,

        #[arg(long)]
        user: String,

        #[arg(long, default_value = "teacher")]
        role: Role,

        #[arg(long)]
        test: i64,
    },
}

pub async fn run_watch_client(url: String, user: String, role: Role, test: i64) -> Result<()> {
    debug!(%url, %user, %role, test, "connecting watch client");

    let (stream, _) = timeout(Duration::from_secs(5), connect_async(url.as_str()))
        .await
        .map_err(|_| anyhow!("connection timeout - is the relay running at {url}?"))?
        .with_context(|| format!("failed to connect to {url}"))?;
    let (mut write, mut read) = stream.split();

    let register = ClientMessage::Register(Register::new(user, role, test)).to_json()?;
    write.send(Message::Text(register)).await?;

    let ping = ClientMessage::Ping.to_json()?;
    let mut heartbeat = interval(Duration::from_secs(20));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                write.send(Message::Text(ping.clone())).await?;
            }
            frame = read.next() => {
                let Some(frame) = frame else { break };
                match frame? {
                    Message::Text(text) => print_event(&text),
                    Message::Close(frame) => {
                        println!("relay closed connection: {:?}", frame.map(|f| f.reason.to_string()));
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

fn print_event(text: &str) {
    match ServerMessage::from_json(text) {
        Ok(ServerMessage::Pong) => debug!("pong"),
        Ok(ServerMessage::Registered(ack)) if !ack.success => {
            println!("registration rejected: {}", ack.reason.unwrap_or_default());
        }
        Ok(message) => println!("{:<15} {text}", message.event()),
        Err(err) => warn!(error = %err, "unparseable frame: {text}"),
    }
}
