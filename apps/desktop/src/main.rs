use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{load_settings, ChatClient, RealtimeEvent, Session};
use shared::domain::{ChatId, Message, MessageKind};
use storage::SqliteBlobStore;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(about = "Terminal client for the chat service")]
struct Cli {
    /// Overrides the configured API base URL.
    #[arg(long)]
    api_url: Option<String>,
    /// Overrides the configured realtime URL.
    #[arg(long)]
    realtime_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        username: String,
        password: String,
    },
    Register {
        username: String,
        email: String,
        password: String,
    },
    Logout,
    Whoami,
    Chats,
    History {
        #[arg(long)]
        chat_id: Option<i64>,
    },
    /// Prints history, then live messages until Ctrl-C.
    Listen {
        #[arg(long)]
        chat_id: Option<i64>,
    },
    Send {
        content: String,
        #[arg(long)]
        chat_id: Option<i64>,
        /// Post through the REST API instead of the live channel.
        #[arg(long)]
        http: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(url) = cli.api_url {
        settings.api_base_url = url;
    }
    if let Some(url) = cli.realtime_url {
        settings.realtime_url = url;
    }
    let room = settings.room();

    let blobs = SqliteBlobStore::new(&settings.database_url)
        .await
        .with_context(|| format!("failed to open {}", settings.database_url))?;
    let client = ChatClient::new(settings, Arc::new(blobs)).context("invalid API URL")?;
    let session = client.start().await;

    let result = run(&client, session, cli.command, room).await;
    client.close().await;
    result
}

async fn run(client: &Arc<ChatClient>, session: Session, command: Command, room: ChatId) -> Result<()> {
    match command {
        Command::Login { username, password } => {
            let session = client.login(&username, &password).await?;
            if let Some(identity) = session.identity() {
                println!("logged in as {} (user_id={})", identity.username, identity.id);
            }
        }
        Command::Register {
            username,
            email,
            password,
        } => {
            let user = client.register(&username, &email, &password).await?;
            println!("registered {} <{}>; log in to continue", user.username, user.email);
        }
        Command::Logout => {
            client.logout().await;
            println!("logged out");
        }
        Command::Whoami => match session.identity() {
            Some(identity) => println!(
                "{} (user_id={}, email={})",
                identity.username,
                identity.id,
                if identity.email.is_empty() { "-" } else { identity.email.as_str() }
            ),
            None => println!("not logged in"),
        },
        Command::Chats => {
            require_session(&session)?;
            for chat in client.list_chats().await? {
                println!(
                    "{:>5}  {:<8} {:<24} unread={}",
                    chat.id,
                    if chat.is_group() { "group" } else { "private" },
                    chat.name.as_deref().unwrap_or("(unnamed)"),
                    chat.unread_count
                );
            }
        }
        Command::History { chat_id } => {
            require_session(&session)?;
            let chat_id = chat_id.map(ChatId).unwrap_or(room);
            for message in client.reconciler().load_history(chat_id).await? {
                print_message(client, &message);
            }
        }
        Command::Listen { chat_id } => {
            require_session(&session)?;
            let chat_id = chat_id.map(ChatId).unwrap_or(room);
            let mut events = client.realtime().subscribe();
            for message in client.open_room(chat_id).await? {
                print_message(client, &message);
            }
            print_message(
                client,
                &Message::system(chat_id, format!("listening on chat {chat_id}, Ctrl-C to quit")),
            );
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(RealtimeEvent::Message(message)) => print_message(client, &message),
                        Ok(RealtimeEvent::Typing { chat_id: typing_chat, usernames }) if typing_chat == chat_id => {
                            if !usernames.is_empty() {
                                eprintln!("... {} typing", usernames.join(", "));
                            }
                        }
                        Ok(RealtimeEvent::StateChanged(state)) => eprintln!("-- {state:?}"),
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            eprintln!("-- missed {skipped} events");
                        }
                        Err(RecvError::Closed) => {
                            eprintln!("-- event stream ended");
                            break;
                        }
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Command::Send {
            content,
            chat_id,
            http,
        } => {
            require_session(&session)?;
            let chat_id = chat_id.map(ChatId).unwrap_or(room);
            if http {
                let stored = client
                    .post_message(&content, chat_id, MessageKind::Text, None)
                    .await?;
                print_message(client, &stored);
            } else {
                send_live(client, &content, chat_id).await?;
            }
        }
    }
    Ok(())
}

fn require_session(session: &Session) -> Result<()> {
    if !session.is_authenticated() {
        bail!("not logged in; run `login` first");
    }
    Ok(())
}

/// Sends over the live channel and waits for the server echo.
async fn send_live(client: &Arc<ChatClient>, content: &str, chat_id: ChatId) -> Result<()> {
    let mut events = client.realtime().subscribe();
    client.open_room(chat_id).await?;
    client.send_message(content, chat_id).await?;

    let echo = tokio::time::timeout(ECHO_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(RealtimeEvent::Message(message)) if client.is_from_current_user(&message) => {
                    return Some(message);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await;
    match echo {
        Ok(Some(message)) => print_message(client, &message),
        _ => eprintln!("sent; no echo within {}s", ECHO_TIMEOUT.as_secs()),
    }
    Ok(())
}

fn print_message(client: &ChatClient, message: &Message) {
    let marker = if client.is_from_current_user(message) { "*" } else { " " };
    println!(
        "{marker} [{}] {}: {}",
        message.created_at.format("%Y-%m-%d %H:%M"),
        message.sender.username,
        message.content
    );
}
