mod ai_sdk;
mod bridge;
mod client;
mod config;
mod encoder;
mod error;
mod hot;
mod identity;
mod lifecycle;
mod protocol;
mod server;
mod upstream;

use clap::{Args, Parser, Subcommand};
use client::{ClientConfig, RelayClient};
use config::{RelayConfig, ServeArgs};
use protocol::{Channel, ThinkMode};
use std::io::Write;

#[derive(Debug, Parser)]
#[command(name = "chat-relay", version, about = "Streams model completions to clients over SSE")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay server.
    Serve(ServeArgs),
    /// Send one prompt to a running relay and print the streamed reply.
    Chat(ChatArgs),
}

#[derive(Debug, Args)]
struct ChatArgs {
    #[arg(long, env = "RELAY_URL", default_value = "http://127.0.0.1:8121")]
    url: String,

    #[arg(long, env = "RELAY_USER_ID")]
    user_id: Option<i64>,

    /// Session token issued by the login service.
    #[arg(long, env = "RELAY_SESSION_TOKEN", hide_env_values = true)]
    session_token: Option<String>,

    /// Ask the model to stream its reasoning as well.
    #[arg(long)]
    think: bool,

    prompt: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    match Cli::parse().command {
        Command::Serve(args) => server::run(RelayConfig::try_from(args)?).await,
        Command::Chat(args) => chat(args).await,
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chat_relay=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn chat(args: ChatArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client = RelayClient::new(ClientConfig {
        base_url: args.url,
        user_id: args.user_id,
        session_token: args.session_token,
    });
    let think = if args.think {
        ThinkMode::Enabled
    } else {
        ThinkMode::Disabled
    };

    let terminal = client
        .stream_chat(args.prompt, think, |event| async move {
            match event.channel {
                Channel::Message => {
                    print!("{}", event.payload);
                    let _ = std::io::stdout().flush();
                }
                Channel::Thinking => eprint!("\x1b[2m{}\x1b[0m", event.payload),
                Channel::Error => eprintln!("\nerror: {}", event.payload),
                Channel::Done => println!(),
            }
        })
        .await?;

    if client::terminal_succeeded(terminal.as_ref()) {
        Ok(())
    } else if terminal.is_none() {
        Err("stream closed before completion".into())
    } else {
        Err("relay reported an error".into())
    }
}
