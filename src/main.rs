use std::path::PathBuf;

use clap::{Parser, Subcommand};
use messenger_link::config::ConfigError;
use messenger_link::{Client, ClientConfig, ErrorCode, ProtocolError};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("[{code}] {0}", code = .0.error_code())]
    Protocol(#[from] ProtocolError),
    #[error("not logged in; run `messenger login` first")]
    NotLoggedIn,
    #[error("output encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "messenger", about = "Realtime messenger client")]
struct Cli {
    #[arg(long, env = "MESSENGER_WS_URL")]
    url: Option<String>,

    #[arg(long, env = "MESSENGER_SESSION_PATH")]
    session_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        email: String,
        #[arg(long, env = "MESSENGER_PASSWORD")]
        password: String,
    },
    Register {
        first_name: String,
        last_name: String,
        email: String,
        #[arg(long, env = "MESSENGER_PASSWORD")]
        password: String,
        #[arg(long, help = "Repeat the password to guard against typos")]
        confirm: Option<String>,
    },
    /// Revalidate the stored session.
    Whoami,
    Logout,
    Conversations,
    Messages {
        conversation_id: i64,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
    },
    Send {
        conversation_id: i64,
        text: String,
    },
    /// Print server events until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env()?;
    if let Some(url) = cli.url {
        config.server_url = url;
    }
    if let Some(path) = cli.session_path {
        config.session_path = path;
    }

    let client = Client::from_config(config)?;
    let result = run(&client, cli.command).await;
    client.shutdown();
    result
}

async fn run(client: &Client, command: Command) -> Result<(), CliError> {
    match command {
        Command::Login { email, password } => {
            let session = client.login(&email, &password).await?;
            print_json(&*session)
        }
        Command::Register { first_name, last_name, email, password, confirm } => {
            let session = match confirm {
                Some(confirm) => {
                    client
                        .session()
                        .register_confirmed(&first_name, &last_name, &email, &password, &confirm)
                        .await?
                }
                None => {
                    client
                        .session()
                        .register(&first_name, &last_name, &email, &password)
                        .await?
                }
            };
            print_json(&*session)
        }
        Command::Whoami => match client.session().check_auth().await? {
            Some(session) => print_json(&*session),
            None => {
                println!("anonymous");
                Ok(())
            }
        },
        Command::Logout => {
            client.logout().await?;
            println!("logged out");
            Ok(())
        }
        Command::Conversations => {
            require_session(client).await?;
            let messenger = client.messenger();
            let conversations = messenger.load_conversations().await?;
            let rows: Vec<_> = conversations
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "name": messenger.display_name(c),
                        "unread": messenger.unread_count(c.id),
                        "lastMessage": c.last_message.as_ref().map(|m| &m.content),
                    })
                })
                .collect();
            print_json(&rows)
        }
        Command::Messages { conversation_id, limit, offset } => {
            require_session(client).await?;
            let messages = client
                .messenger()
                .load_messages(conversation_id, limit, offset)
                .await?;
            print_json(&*messages)
        }
        Command::Send { conversation_id, text } => {
            require_session(client).await?;
            let message = client
                .messenger()
                .send_message(conversation_id, &text)
                .await?;
            print_json(&message)
        }
        Command::Watch => {
            let mut frames = client.subscribe();
            require_session(client).await?;
            loop {
                tokio::select! {
                    frame = frames.recv() => match frame {
                        Ok(frame) => print_json(&frame)?,
                        Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "watch lagged"),
                        Err(RecvError::Closed) => return Ok(()),
                    },
                    _ = tokio::signal::ctrl_c() => return Ok(()),
                }
            }
        }
    }
}

/// Revalidate the stored session; this also authenticates the connection.
async fn require_session(client: &Client) -> Result<(), CliError> {
    client
        .session()
        .check_auth()
        .await?
        .map(|_| ())
        .ok_or(CliError::NotLoggedIn)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
