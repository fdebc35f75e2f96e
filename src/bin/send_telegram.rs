//! Send a text message or a photo to a Telegram chat as the bot.
//!
//! Used by the agent to answer users; the chat defaults to `TELEGRAM_CHAT_ID`.
//! `chat-id` lists the chats that messaged the bot and, when there is exactly
//! one, stores it as `TELEGRAM_CHAT_ID` in the project's `.env`.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use teloxide::prelude::*;
use teloxide::types::Chat;

use actionable::bot::telegram::{self, TelegramClient};
use actionable::config::{Config, write_env_key};

/// Send messages through the Telegram bot
#[derive(Parser, Debug)]
#[command(name = "send-telegram", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send text (argument, file or stdin)
    Text {
        /// Message to send; read from stdin when neither this nor --file is given
        message: Option<String>,

        /// Read the message from a file
        #[arg(short, long, conflicts_with = "message")]
        file: Option<PathBuf>,

        /// Target chat (default: TELEGRAM_CHAT_ID)
        #[arg(long, allow_hyphen_values = true)]
        chat_id: Option<i64>,
    },
    /// Send an image with an optional caption
    Photo {
        image: PathBuf,

        #[arg(short, long)]
        caption: Option<String>,

        /// Target chat (default: TELEGRAM_CHAT_ID)
        #[arg(long, allow_hyphen_values = true)]
        chat_id: Option<i64>,
    },
    /// List chats that messaged the bot and save a single one to .env
    ChatId {
        /// Only print the chats
        #[arg(long)]
        no_save: bool,
    },
}

/// A chat seen in pending updates.
#[derive(Debug, PartialEq, Eq)]
struct ChatSummary {
    id: i64,
    kind: &'static str,
    name: String,
    username: Option<String>,
}

impl ChatSummary {
    fn from_chat(chat: &Chat) -> Self {
        let kind = if chat.is_private() {
            "private"
        } else if chat.is_group() {
            "group"
        } else if chat.is_supergroup() {
            "supergroup"
        } else {
            "channel"
        };
        let name = match chat.title() {
            Some(title) => title.to_string(),
            None => [chat.first_name(), chat.last_name()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" "),
        };
        Self {
            id: chat.id.0,
            kind,
            name,
            username: chat.username().map(str::to_string),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;
    let client = TelegramClient::from_token(&config.telegram_bot_token);

    match cli.command {
        Command::ChatId { no_save } => {
            let updates = Bot::new(&config.telegram_bot_token)
                .get_updates()
                .await
                .context("getUpdates failed (a registered webhook blocks it; run `actionable --delete-webhook` first)")?;
            let chats = collect_chats(updates.iter().filter_map(|update| update.chat()));
            if chats.is_empty() {
                println!("No chats yet. Send /start to the bot, then run this again.");
                return Ok(());
            }
            print!("{}", format_chat_table(&chats));

            match chats.as_slice() {
                [only] if !no_save => {
                    let env_file = config.project_root.join(".env");
                    write_env_key(&env_file, "TELEGRAM_CHAT_ID", &only.id.to_string())
                        .with_context(|| format!("failed to write {}", env_file.display()))?;
                    println!("\nSaved TELEGRAM_CHAT_ID={} to {}", only.id, env_file.display());
                }
                [_] => {}
                _ => println!("\nSeveral chats found; set TELEGRAM_CHAT_ID in .env to the one you want."),
            }
        }
        Command::Text { message, file, chat_id } => {
            let chat_id = resolve_chat_id(chat_id, config.default_chat_id)?;
            let text = read_text(message, file.as_deref(), std::io::stdin())?;
            println!("Sending... ({} chars)", text.chars().count());
            let chunks = telegram::send_message(&client, chat_id, &text).await?;
            if chunks > 1 {
                println!("Sent in {chunks} parts");
            }
            println!("Sent!");
        }
        Command::Photo { image, caption, chat_id } => {
            let chat_id = resolve_chat_id(chat_id, config.default_chat_id)?;
            println!("Sending image {}...", image.display());
            telegram::send_photo(&client, chat_id, &image, caption.as_deref()).await?;
            println!("Sent!");
        }
    }
    Ok(())
}

fn resolve_chat_id(flag: Option<i64>, configured: Option<i64>) -> Result<i64> {
    flag.or(configured)
        .context("no chat id: pass --chat-id or set TELEGRAM_CHAT_ID")
}

/// Distinct chats in first-seen order.
fn collect_chats<'a>(chats: impl IntoIterator<Item = &'a Chat>) -> Vec<ChatSummary> {
    let mut seen: Vec<ChatSummary> = Vec::new();
    for chat in chats {
        if !seen.iter().any(|c| c.id == chat.id.0) {
            seen.push(ChatSummary::from_chat(chat));
        }
    }
    seen
}

fn format_chat_table(chats: &[ChatSummary]) -> String {
    let mut out = format!("{:<15} {:<10} {:<20} {}\n{}\n", "Chat ID", "Type", "Name", "Username", "-".repeat(60));
    for chat in chats {
        let username = chat.username.as_deref().map(|u| format!("@{u}")).unwrap_or_else(|| "-".to_string());
        out.push_str(&format!("{:<15} {:<10} {:<20} {}\n", chat.id, chat.kind, chat.name, username));
    }
    out
}

/// Message text from the argument, a file, or `stdin`, in that order.
fn read_text(message: Option<String>, file: Option<&std::path::Path>, mut stdin: impl Read) -> Result<String> {
    let text = match (message, file) {
        (_, Some(path)) => {
            std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?
        }
        (Some(message), None) => message,
        (None, None) => {
            let mut buf = String::new();
            stdin.read_to_string(&mut buf).context("failed to read stdin")?;
            buf
        }
    };

    if text.trim().is_empty() {
        bail!("nothing to send");
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_negative_chat_id() {
        let cli = Cli::try_parse_from(["send-telegram", "text", "hello", "--chat-id", "-100123"]).unwrap();
        match cli.command {
            Command::Text { message, chat_id, .. } => {
                assert_eq!(message.as_deref(), Some("hello"));
                assert_eq!(chat_id, Some(-100123));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_resolve_chat_id() {
        assert_eq!(resolve_chat_id(Some(1), Some(2)).unwrap(), 1);
        assert_eq!(resolve_chat_id(None, Some(2)).unwrap(), 2);
        assert!(resolve_chat_id(None, None).is_err());
    }

    #[test]
    fn test_read_text_sources() {
        assert_eq!(read_text(Some("hi".into()), None, std::io::empty()).unwrap(), "hi");
        assert_eq!(read_text(None, None, "from stdin".as_bytes()).unwrap(), "from stdin");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msg.md");
        std::fs::write(&path, "*report*").unwrap();
        assert_eq!(read_text(None, Some(&path), std::io::empty()).unwrap(), "*report*");

        assert!(read_text(None, None, "  \n".as_bytes()).is_err());
        assert!(read_text(None, Some(&dir.path().join("missing")), std::io::empty()).is_err());
    }

    fn chat(value: serde_json::Value) -> Chat {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_collect_chats_dedups_in_order() {
        let dm = chat(serde_json::json!({
            "id": 42, "type": "private", "first_name": "Min", "last_name": "Kim", "username": "minkim"
        }));
        let group = chat(serde_json::json!({"id": -500, "type": "group", "title": "Team"}));

        let chats = collect_chats([&dm, &group, &dm]);
        assert_eq!(
            chats,
            vec![
                ChatSummary { id: 42, kind: "private", name: "Min Kim".into(), username: Some("minkim".into()) },
                ChatSummary { id: -500, kind: "group", name: "Team".into(), username: None },
            ]
        );

        let table = format_chat_table(&chats);
        assert!(table.contains("@minkim"));
        assert!(table.lines().nth(3).unwrap().starts_with("-500"));
        assert!(collect_chats(Vec::<&Chat>::new()).is_empty());
    }

    #[test]
    fn test_parse_chat_id_command() {
        let cli = Cli::try_parse_from(["send-telegram", "chat-id", "--no-save"]).unwrap();
        assert!(matches!(cli.command, Command::ChatId { no_save: true }));
    }
}
