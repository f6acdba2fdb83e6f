//! Minimal terminal chat client.
//!
//! ```text
//! cargo run -p terminal-chat -- ws://127.0.0.1:8080 alice general
//! ```
//!
//! Lines typed on stdin are sent to the room. `/retry <id>`, `/delete <id>`,
//! `/clear` and `/quit` do what they say. Set `RUST_LOG=chatsync=debug` to
//! watch the engine work.

use chatsync::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render(message: &Message) -> String {
    let status = if message.failed {
        "failed".to_string()
    } else {
        message.delivery_state.to_string()
    };
    let reply = match &message.reply_preview {
        Some(preview) => format!(" (re {}: {})", preview.sender, preview.snippet),
        None => String::new(),
    };
    format!(
        "[{}] {}{}: {}  <{}>",
        message.id, message.sender, reply, message.text, status
    )
}

fn print_event(event: &ChatEvent) {
    match event {
        ChatEvent::MessageAdded { message, .. } => println!("+ {}", render(message)),
        ChatEvent::MessageUpdated { message, .. } => println!("~ {}", render(message)),
        ChatEvent::MessagesRemoved { ids, .. } => println!("- removed {} message(s)", ids.len()),
        ChatEvent::PresenceChanged { peer, online } => {
            println!("* {peer} is {}", if *online { "online" } else { "offline" });
        }
        ChatEvent::TypingChanged { summary, .. } if !summary.is_empty() => {
            let names: Vec<&str> = summary.shown.iter().map(|p| p.as_str()).collect();
            if summary.others > 0 {
                println!("* {} and {} others are typing", names.join(", "), summary.others);
            } else {
                println!("* {} typing", names.join(", "));
            }
        }
        ChatEvent::SendRejected { reason, .. } => println!("! rejected: {reason}"),
        ChatEvent::Connection(signal) => println!("* connection: {signal:?}"),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| "ws://127.0.0.1:8080".into());
    let identity = PeerId::from(args.next().unwrap_or_else(|| "guest".into()));
    let room = RoomKey::channel(args.next().unwrap_or_else(|| "general".into()));
    tracing::info!(%url, %identity, %room, "starting terminal chat");

    let client = ChatClient::builder()
        .identity(identity)
        .connect_websocket(url, NoopStore)
        .await?;

    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    for message in client.open_room(room.clone()).await? {
        println!("  {}", render(&message));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("/quit"), _) => break,
            (Some("/clear"), _) => {
                client.clear_room_history(room.clone()).await?;
            }
            (Some("/retry"), Some(id)) => {
                if let Err(e) = client.retry(room.clone(), MessageId::from(id)).await {
                    eprintln!("retry failed: {e}");
                }
            }
            (Some("/delete"), Some(id)) => {
                client
                    .delete_messages(room.clone(), vec![MessageId::from(id)])
                    .await?;
            }
            _ => {
                client.input_changed(room.clone(), line.as_str()).await?;
                match client.send(room.clone(), line, None).await {
                    Ok(_) | Err(SendError::EmptyMessage) => {}
                    Err(e) => eprintln!("send failed: {e}"),
                }
            }
        }
    }

    client.close_room(room).await?;
    client.shutdown().await?;
    Ok(())
}
