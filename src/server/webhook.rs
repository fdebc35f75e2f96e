//! `POST /webhook` and `GET /health`.

use std::convert::Infallible;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use serde_json::{Value, json};
use teloxide::types::ChatAction;
use tracing::{debug, info, warn};

use super::AppState;
use super::error::ApiError;
use crate::bot::message::{IncomingMessage, WebhookUpdate};

pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Acknowledge an update right away and process it in the background.
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if let Some(secret) = state.webhook_secret.as_deref() {
        let provided = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if provided != Some(secret) {
            warn!("🚫 Webhook request with missing or wrong secret token");
            return Err(ApiError::Forbidden);
        }
    }

    let update: WebhookUpdate =
        serde_json::from_slice(&body).map_err(|_| ApiError::BadRequest("Invalid JSON".to_string()))?;

    if let Some(update_id) = update.update_id
        && state.dedup.check_and_mark(update_id)
    {
        debug!("Duplicate update {} ignored", update_id);
        return Ok(ack());
    }

    let Some(msg) = IncomingMessage::from_update(&update, &state.tz) else {
        debug!("Update {:?} carries no message", update.update_id);
        return Ok(ack());
    };

    info!(
        "📨 {} in chat {}: {}",
        msg.sender(),
        msg.chat_id,
        msg.text.chars().take(100).collect::<String>()
    );

    // Show activity before the background work is even scheduled
    if let Err(e) = state.telegram.send_chat_action(msg.chat_id, ChatAction::Typing).await {
        warn!("Typing indicator failed for chat {}: {}", msg.chat_id, e);
    }

    let router = state.router.clone();
    let name = format!("update:{}", msg.update_id.unwrap_or_default());
    state.tasks.spawn(name, async move {
        router.dispatch(&msg).await;
        Ok::<(), Infallible>(())
    });

    Ok(ack())
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "bot_token_set": state.bot_token_set }))
}

fn ack() -> Json<Value> {
    Json(json!({ "ok": true }))
}

/// Public webhook URL for a base URL, appending `/webhook` unless present.
pub fn endpoint_url(base: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    if base.ends_with("/webhook") {
        base.to_string()
    } else {
        format!("{base}/webhook")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        assert_eq!(endpoint_url("https://bot.example.com"), "https://bot.example.com/webhook");
        assert_eq!(endpoint_url("https://bot.example.com/"), "https://bot.example.com/webhook");
        assert_eq!(endpoint_url("https://bot.example.com/webhook"), "https://bot.example.com/webhook");
        assert_eq!(endpoint_url("https://x.ngrok.app/tg/webhook/"), "https://x.ngrok.app/tg/webhook");
    }
}
