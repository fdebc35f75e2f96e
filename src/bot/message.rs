//! Inbound update model and prompt formatting with injection prevention.
//!
//! Webhook payloads are deserialized leniently: Telegram only guarantees the
//! fields it needs for a given update kind, so everything below the top level
//! is optional.
//!
//! User content is escaped so `<`, `>`, `&` become `&lt;`, `&gt;`, `&amp;`
//! before it reaches the agent prompt.

use chrono::{DateTime, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// One Telegram webhook delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookUpdate {
    #[serde(default)]
    pub update_id: Option<i64>,
    #[serde(default)]
    pub message: Option<RawMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub message_id: Option<i64>,
    /// Unix timestamp.
    #[serde(default)]
    pub date: Option<i64>,
    #[serde(default)]
    pub chat: RawChat,
    #[serde(default)]
    pub from: Option<RawUser>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawChat {
    #[serde(default)]
    pub id: i64,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawUser {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// A chat message with all metadata, as handed to the router.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomingMessage {
    pub update_id: Option<i64>,
    pub message_id: i64,
    /// ISO-8601 timestamp in the configured timezone.
    pub date: String,
    /// Chat ID where this message was sent (negative = group, positive = DM).
    pub chat_id: i64,
    pub chat_type: Option<String>,
    pub from_id: Option<i64>,
    pub from_name: String,
    pub from_username: Option<String>,
    pub text: String,
}

impl IncomingMessage {
    /// Extract the message of an update, if it carries one.
    pub fn from_update(update: &WebhookUpdate, tz: &Tz) -> Option<Self> {
        let message = update.message.as_ref()?;
        let from = message.from.as_ref();

        let from_name = from
            .map(|u| {
                format!("{} {}", u.first_name, u.last_name.as_deref().unwrap_or(""))
                    .trim()
                    .to_string()
            })
            .unwrap_or_default();

        Some(Self {
            update_id: update.update_id,
            message_id: message.message_id.unwrap_or(0),
            date: format_date(message.date.unwrap_or(0), tz),
            chat_id: message.chat.id,
            chat_type: message.chat.kind.clone(),
            from_id: from.map(|u| u.id),
            from_name,
            from_username: from.and_then(|u| u.username.clone()),
            text: message.text.clone().unwrap_or_default(),
        })
    }

    /// Best display name for logs and prompts.
    pub fn sender(&self) -> &str {
        if !self.from_name.is_empty() {
            &self.from_name
        } else {
            self.from_username.as_deref().unwrap_or("unknown")
        }
    }

    /// Format message as XML for inclusion in the agent prompt.
    ///
    /// Example output:
    /// ```xml
    /// <msg id="4521" chat="-12345" user="923847" name="Alice" time="2026-01-25T10:31:00+09:00">hey everyone</msg>
    /// ```
    pub fn format(&self) -> String {
        let user = self.from_id.map(|id| id.to_string()).unwrap_or_default();
        let username_part = match &self.from_username {
            Some(u) => format!(" username=\"{}\"", xml_escape_attr(u)),
            None => String::new(),
        };

        format!(
            "<msg id=\"{}\" chat=\"{}\" user=\"{}\" name=\"{}\"{} time=\"{}\">{}</msg>",
            self.message_id,
            self.chat_id,
            user,
            xml_escape_attr(self.sender()),
            username_part,
            xml_escape_attr(&self.date),
            xml_escape(&self.text)
        )
    }
}

fn format_date(unix: i64, tz: &Tz) -> String {
    DateTime::from_timestamp(unix, 0)
        .map(|utc| tz.from_utc_datetime(&utc.naive_utc()).to_rfc3339())
        .unwrap_or_default()
}

/// Escape a string for safe inclusion in XML content.
fn xml_escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '&' => result.push_str("&amp;"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape a string for safe inclusion in XML attributes (also escapes quotes).
fn xml_escape_attr(s: &str) -> String {
    xml_escape(s).replace('"', "&quot;")
}
