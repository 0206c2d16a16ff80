// Interactive terminal client over the pinchat session core.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;
use log::warn;
use tokio::io::{AsyncBufReadExt, BufReader};

use pinchat::client::config::ClientConfig;
use pinchat::client::messages::MAX_ATTACHMENT_BYTES;
use pinchat::client::session::ChatSession;
use pinchat::common::errors::ChatError;
use pinchat::common::format::format_file_size;
use pinchat::common::models::{ActiveUser, Message, MessageType, OutgoingMessage, ReplyRef};
use pinchat::store::{ChatStore, SqliteStore, UnconfiguredStore};

#[derive(Parser, Debug)]
#[command(name = "pinchat")]
#[command(about = "Ephemeral PIN-protected group chat")]
struct Args {
    /// Store URL, e.g. sqlite:data/pinchat.db (defaults to the environment)
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut config = ClientConfig::from_env();
    if let Some(url) = args.database_url {
        config.database_url = url;
    }

    // A broken store still yields a running client whose every operation
    // reports the configuration error, like the original's mock backend.
    let store: Arc<dyn ChatStore> = match SqliteStore::connect(&config.database_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!("store unavailable ({}), running unconfigured", e);
            Arc::new(UnconfiguredStore::new())
        }
    };
    let mut session = ChatSession::with_config(store, config);

    println!("pinchat. Type /help for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut printed = 0usize;
    let mut last_roster = String::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("stdin closed")? else { break };
                if !handle_line(&mut session, line.trim()).await {
                    break;
                }
            }
            _ = ticker.tick() => {
                session.pump().await;
                if let Some(err) = session.last_error() {
                    eprintln!("! {}", err);
                    session.clear_error();
                }
                render_new(&session, &mut printed, &mut last_roster);
            }
        }
    }

    session.leave_room();
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_line(session: &mut ChatSession, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let (command, rest) = match line.strip_prefix('/') {
        Some(stripped) => {
            let mut parts = stripped.splitn(2, ' ');
            (parts.next().unwrap_or(""), parts.next().unwrap_or("").trim())
        }
        None => ("send", line),
    };

    let result = match command {
        "help" => {
            print_help();
            Ok(())
        }
        "create" => {
            if rest.is_empty() {
                println!("usage: /create <nickname>");
                Ok(())
            } else {
                session.create_room(rest).await.map(|pin| {
                    println!("room created, share this PIN: {}", pin);
                })
            }
        }
        "join" => {
            let mut parts = rest.splitn(2, ' ');
            let pin = parts.next().unwrap_or("");
            let nickname = parts.next().unwrap_or("").trim();
            if pin.is_empty() || nickname.is_empty() {
                println!("usage: /join <pin> <nickname>");
                Ok(())
            } else {
                session.join_room(pin, nickname).await.map(|_| {
                    println!("joined room {}", pin.to_uppercase());
                })
            }
        }
        "send" => send_text(session, rest, None).await,
        "reply" => {
            let mut parts = rest.splitn(2, ' ');
            let index: Option<usize> = parts.next().and_then(|n| n.parse().ok());
            let text = parts.next().unwrap_or("").trim();
            let reply = index
                .and_then(|n| session.messages().get(n.checked_sub(1)?))
                .map(ReplyRef::to_message);
            match reply {
                Some(reply) if !text.is_empty() => send_text(session, text, Some(reply)).await,
                _ => {
                    println!("usage: /reply <message number> <text>");
                    Ok(())
                }
            }
        }
        "sendfile" => send_file(session, rest).await,
        "who" => {
            for user in roster(session.users(), session.nickname()) {
                println!("  {}", user);
            }
            Ok(())
        }
        "refresh" => {
            session.refresh_data().await;
            println!("refreshed");
            Ok(())
        }
        "export" => export_log(session, rest),
        "pin" => {
            match session.current_room() {
                Some(room) => println!("PIN: {} (expires {})", room.pin, room.expires_at),
                None => println!("not in a room"),
            }
            Ok(())
        }
        "leave" => {
            session.leave_room();
            println!("left the room");
            Ok(())
        }
        "quit" | "exit" => return false,
        other => {
            println!("unknown command /{}, try /help", other);
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("! {}", e);
        session.clear_error();
    }
    true
}

async fn send_text(
    session: &mut ChatSession,
    text: &str,
    reply_to: Option<ReplyRef>,
) -> Result<(), ChatError> {
    if session.current_room().is_none() {
        println!("not in a room, /create or /join first");
        return Ok(());
    }
    let text = complete_mention(text, session.users(), session.nickname());
    let mut outgoing = OutgoingMessage::text(text);
    outgoing.reply_to = reply_to;
    session.send_message(outgoing).await
}

async fn send_file(
    session: &mut ChatSession,
    path: &str,
) -> Result<(), ChatError> {
    if session.current_room().is_none() {
        println!("not in a room, /create or /join first");
        return Ok(());
    }
    if path.is_empty() {
        println!("usage: /sendfile <path>");
        return Ok(());
    }
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            println!("cannot read {}: {}", path, e);
            return Ok(());
        }
    };
    if bytes.len() as i64 > MAX_ATTACHMENT_BYTES {
        println!(
            "file too large: {} (max {})",
            format_file_size(bytes.len() as i64),
            format_file_size(MAX_ATTACHMENT_BYTES)
        );
        return Ok(());
    }

    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    let mime = mime_for(&name);
    let message_type = if mime.starts_with("image/") {
        MessageType::Image
    } else {
        MessageType::File
    };

    let outgoing = OutgoingMessage {
        content: format!("data:{};base64,{}", mime, BASE64.encode(&bytes)),
        message_type: Some(message_type),
        file_name: Some(name),
        file_size: Some(bytes.len() as i64),
        reply_to: None,
    };
    session.send_message(outgoing).await
}

fn export_log(session: &ChatSession, path: &str) -> Result<(), ChatError> {
    if path.is_empty() {
        println!("usage: /export <path>");
        return Ok(());
    }
    match serde_json::to_string_pretty(session.messages()) {
        Ok(json) => match std::fs::write(path, json) {
            Ok(()) => println!("exported {} messages to {}", session.messages().len(), path),
            Err(e) => println!("cannot write {}: {}", path, e),
        },
        Err(e) => println!("export failed: {}", e),
    }
    Ok(())
}

/// Print messages and roster changes that arrived since the last tick.
fn render_new(session: &ChatSession, printed: &mut usize, last_roster: &mut String) {
    let messages = session.messages();
    if *printed > messages.len() {
        *printed = 0; // log was replaced or cleared
    }
    for (i, message) in messages.iter().enumerate().skip(*printed) {
        println!("{}", render_message(i + 1, message));
    }
    *printed = messages.len();

    if session.current_room().is_some() {
        let roster = roster(session.users(), session.nickname()).join(", ");
        if roster != *last_roster && !roster.is_empty() {
            println!("-- online: {}", roster);
            *last_roster = roster;
        }
    } else {
        last_roster.clear();
    }
}

fn render_message(index: usize, message: &Message) -> String {
    let time = message.created_at.format("%H:%M");
    let body = match message.message_type {
        MessageType::Text => message.content.clone(),
        MessageType::Image | MessageType::File => format!(
            "[{} {} ({})]",
            message.message_type.as_str(),
            message.file_name.as_deref().unwrap_or("unnamed"),
            format_file_size(message.file_size.unwrap_or(0)),
        ),
    };
    match &message.reply_to {
        Some(reply) => format!(
            "[{}] {} {} (re {}: {}): {}",
            index, time, message.sender, reply.sender, reply.preview, body
        ),
        None => format!("[{}] {} {}: {}", index, time, message.sender, body),
    }
}

/// Active users with the local user marked; typing users flagged.
fn roster(users: &[ActiveUser], self_nick: Option<&str>) -> Vec<String> {
    users
        .iter()
        .map(|u| {
            let mut label = u.nickname.clone();
            if Some(u.nickname.as_str()) == self_nick {
                label.push_str(" (you)");
            } else if u.is_typing {
                label.push_str(" (typing...)");
            }
            label
        })
        .collect()
}

/// Complete a trailing `@prefix` against the active users, excluding the
/// local user. Ambiguous or unknown prefixes are left untouched.
fn complete_mention(text: &str, users: &[ActiveUser], self_nick: Option<&str>) -> String {
    let Some(at) = text.rfind('@') else {
        return text.to_string();
    };
    let prefix = &text[at + 1..];
    if prefix.is_empty() || prefix.contains(' ') {
        return text.to_string();
    }
    let matches: Vec<&str> = users
        .iter()
        .map(|u| u.nickname.as_str())
        .filter(|n| Some(*n) != self_nick && n.to_lowercase().starts_with(&prefix.to_lowercase()))
        .collect();
    match matches.as_slice() {
        [only] => format!("{}@{}", &text[..at], only),
        _ => text.to_string(),
    }
}

fn mime_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "txt" | "md" | "log" => "text/plain",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn print_help() {
    println!("  /create <nickname>        create a room, prints the PIN");
    println!("  /join <pin> <nickname>    join a room (PIN is case-insensitive)");
    println!("  <text> or /send <text>    send a message (@prefix completes a mention)");
    println!("  /reply <n> <text>         reply to message number n");
    println!("  /sendfile <path>          send a file or image (max 10 MiB)");
    println!("  /who                      list active users");
    println!("  /refresh                  re-fetch messages and presence");
    println!("  /export <path>            dump the message log as JSON");
    println!("  /pin                      show the current room PIN");
    println!("  /leave                    leave the room");
    println!("  /quit                     exit");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users(names: &[(&str, bool)]) -> Vec<ActiveUser> {
        names
            .iter()
            .map(|(n, t)| ActiveUser { nickname: n.to_string(), is_typing: *t })
            .collect()
    }

    #[test]
    fn mention_completion_excludes_self_and_needs_a_unique_prefix() {
        let list = users(&[("Alice", false), ("Albert", false), ("Bob", true)]);
        assert_eq!(complete_mention("hi @b", &list, Some("Alice")), "hi @Bob");
        // Ambiguous between Alice and Albert
        assert_eq!(complete_mention("hi @al", &list, Some("Bob")), "hi @al");
        // Alice excluded, Albert unique
        assert_eq!(complete_mention("hi @al", &list, Some("Alice")), "hi @Albert");
        // No @ at all
        assert_eq!(complete_mention("plain text", &list, None), "plain text");
    }

    #[test]
    fn mime_detection_by_extension() {
        assert_eq!(mime_for("photo.PNG"), "image/png");
        assert_eq!(mime_for("doc.pdf"), "application/pdf");
        assert_eq!(mime_for("archive.tar.gz"), "application/octet-stream");
    }
}
