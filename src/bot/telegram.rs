//! Telegram client using teloxide.
//!
//! [`TelegramApi`] is the wire contract: one method per Bot API call, no
//! retries. Chunking, caption limits and the Markdown fallback live in the
//! free functions on top of it so they work against any implementation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InputFile, ParseMode};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Maximum length of a single text message.
pub const MAX_MESSAGE_LENGTH: usize = 4096;

/// Maximum length of a photo caption.
pub const MAX_CAPTION_LENGTH: usize = 1024;

#[derive(Debug, Error)]
pub enum TelegramError {
    /// Telegram answered with an error (or the request never got there).
    #[error("Telegram API error: {0}")]
    Api(String),
    #[error("invalid webhook url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

impl TelegramError {
    /// True when Telegram rejected the message markup.
    pub fn is_parse_error(&self) -> bool {
        match self {
            Self::Api(description) => description.to_lowercase().contains("can't parse"),
            _ => false,
        }
    }
}

impl From<teloxide::RequestError> for TelegramError {
    fn from(e: teloxide::RequestError) -> Self {
        Self::Api(e.to_string())
    }
}

/// Markup applied to text and captions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMode {
    Markdown,
    Plain,
}

#[async_trait]
pub trait TelegramApi: Send + Sync {
    /// `sendMessage`; returns the new message id.
    async fn send_text(&self, chat_id: i64, text: &str, mode: TextMode) -> Result<i64, TelegramError>;

    /// `sendPhoto` with a local file.
    async fn send_photo(
        &self,
        chat_id: i64,
        photo: &Path,
        caption: Option<&str>,
        mode: TextMode,
    ) -> Result<i64, TelegramError>;

    /// `sendChatAction`.
    async fn send_chat_action(&self, chat_id: i64, action: ChatAction) -> Result<(), TelegramError>;

    /// `setWebhook`, optionally with a secret token.
    async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), TelegramError>;

    /// `deleteWebhook`.
    async fn delete_webhook(&self) -> Result<(), TelegramError>;
}

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn from_token(token: &str) -> Self {
        Self::new(Bot::new(token))
    }
}

// Telegram still accepts the legacy Markdown mode, which is far more forgiving
// about unescaped punctuation than MarkdownV2.
#[allow(deprecated)]
fn parse_mode(mode: TextMode) -> Option<ParseMode> {
    match mode {
        TextMode::Markdown => Some(ParseMode::Markdown),
        TextMode::Plain => None,
    }
}

#[async_trait]
impl TelegramApi for TelegramClient {
    async fn send_text(&self, chat_id: i64, text: &str, mode: TextMode) -> Result<i64, TelegramError> {
        let mut request = self.bot.send_message(ChatId(chat_id), text);
        if let Some(pm) = parse_mode(mode) {
            request = request.parse_mode(pm);
        }
        let msg = request.await?;
        Ok(msg.id.0 as i64)
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        photo: &Path,
        caption: Option<&str>,
        mode: TextMode,
    ) -> Result<i64, TelegramError> {
        let mut request = self.bot.send_photo(ChatId(chat_id), InputFile::file(photo));
        if let Some(cap) = caption {
            request = request.caption(cap);
            if let Some(pm) = parse_mode(mode) {
                request = request.parse_mode(pm);
            }
        }
        let msg = request.await?;
        Ok(msg.id.0 as i64)
    }

    async fn send_chat_action(&self, chat_id: i64, action: ChatAction) -> Result<(), TelegramError> {
        self.bot.send_chat_action(ChatId(chat_id), action).await?;
        Ok(())
    }

    async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), TelegramError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| TelegramError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let mut request = self.bot.set_webhook(parsed);
        if let Some(secret) = secret {
            request = request.secret_token(secret.to_string());
        }
        request.await?;
        Ok(())
    }

    async fn delete_webhook(&self) -> Result<(), TelegramError> {
        self.bot.delete_webhook().await?;
        Ok(())
    }
}

/// Send `text` as one or more Markdown messages, falling back to plain text
/// for any chunk Telegram cannot parse. Returns the number of chunks sent.
pub async fn send_message(api: &dyn TelegramApi, chat_id: i64, text: &str) -> Result<usize, TelegramError> {
    let chunks = split_message(text, MAX_MESSAGE_LENGTH);
    let total = chunks.len();

    for (i, chunk) in chunks.iter().enumerate() {
        match api.send_text(chat_id, chunk, TextMode::Markdown).await {
            Ok(_) => {}
            Err(e) if e.is_parse_error() => {
                debug!("Markdown rejected for chat {chat_id}, resending as plain text");
                api.send_text(chat_id, chunk, TextMode::Plain).await?;
            }
            Err(e) => {
                warn!("Failed to send to chat {chat_id}: {e}");
                return Err(e);
            }
        }
        if total > 1 {
            debug!("Sent chunk {}/{} to chat {}", i + 1, total, chat_id);
        }
    }

    Ok(total)
}

/// Send a local image with an optional caption (truncated to the caption limit).
pub async fn send_photo(
    api: &dyn TelegramApi,
    chat_id: i64,
    photo: &Path,
    caption: Option<&str>,
) -> Result<i64, TelegramError> {
    if !photo.exists() {
        return Err(TelegramError::FileNotFound(photo.to_path_buf()));
    }

    let caption = caption.map(truncate_caption);
    info!("📷 Sending {} to chat {}", photo.display(), chat_id);

    match api.send_photo(chat_id, photo, caption.as_deref(), TextMode::Markdown).await {
        Err(e) if caption.is_some() && e.is_parse_error() => {
            debug!("Caption markup rejected, resending as plain text");
            api.send_photo(chat_id, photo, caption.as_deref(), TextMode::Plain).await
        }
        other => other,
    }
}

/// Split text into chunks of at most `max_chars` characters, preferring to
/// break at the last newline inside the window.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    loop {
        let limit = match rest.char_indices().nth(max_chars) {
            Some((idx, _)) => idx,
            None => {
                chunks.push(rest.to_string());
                break;
            }
        };

        let split_at = rest[..limit].rfind('\n').filter(|&pos| pos > 0).unwrap_or(limit);
        chunks.push(rest[..split_at].to_string());
        rest = rest[split_at..].trim_start_matches('\n');
        if rest.is_empty() {
            break;
        }
    }

    chunks
}

fn truncate_caption(caption: &str) -> String {
    if caption.chars().count() <= MAX_CAPTION_LENGTH {
        return caption.to_string();
    }
    let mut truncated: String = caption.chars().take(MAX_CAPTION_LENGTH - 3).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory [`TelegramApi`] recording every call.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Text { chat_id: i64, text: String, mode: TextMode },
        Photo { chat_id: i64, caption: Option<String>, mode: TextMode },
        Action { chat_id: i64 },
        SetWebhook { url: String, secret: Option<String> },
        DeleteWebhook,
    }

    #[derive(Default)]
    pub struct FakeTelegram {
        pub calls: Mutex<Vec<Call>>,
        /// Reject Markdown with a parse error.
        pub reject_markdown: bool,
        /// Fail every chat action.
        pub fail_actions: bool,
    }

    impl FakeTelegram {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn texts(&self) -> Vec<(i64, String)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Text { chat_id, text, .. } => Some((chat_id, text)),
                    _ => None,
                })
                .collect()
        }

        pub fn action_count(&self) -> usize {
            self.calls().iter().filter(|c| matches!(c, Call::Action { .. })).count()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl TelegramApi for FakeTelegram {
        async fn send_text(&self, chat_id: i64, text: &str, mode: TextMode) -> Result<i64, TelegramError> {
            if self.reject_markdown && mode == TextMode::Markdown {
                return Err(TelegramError::Api(
                    "Bad Request: can't parse entities: Can't find end of the entity".into(),
                ));
            }
            self.record(Call::Text { chat_id, text: text.to_string(), mode });
            Ok(1)
        }

        async fn send_photo(
            &self,
            chat_id: i64,
            _photo: &Path,
            caption: Option<&str>,
            mode: TextMode,
        ) -> Result<i64, TelegramError> {
            if self.reject_markdown && mode == TextMode::Markdown {
                return Err(TelegramError::Api("Bad Request: can't parse entities".into()));
            }
            self.record(Call::Photo { chat_id, caption: caption.map(str::to_string), mode });
            Ok(2)
        }

        async fn send_chat_action(&self, chat_id: i64, _action: ChatAction) -> Result<(), TelegramError> {
            self.record(Call::Action { chat_id });
            if self.fail_actions {
                return Err(TelegramError::Api("Too Many Requests: retry after 1".into()));
            }
            Ok(())
        }

        async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), TelegramError> {
            self.record(Call::SetWebhook { url: url.to_string(), secret: secret.map(str::to_string) });
            Ok(())
        }

        async fn delete_webhook(&self) -> Result<(), TelegramError> {
            self.record(Call::DeleteWebhook);
            Ok(())
        }
    }
}
