//! `tracing` layer forwarding log lines to a Telegram chat.
//!
//! WARN and ERROR lines go out immediately; INFO lines are batched and flushed
//! every few seconds or when the batch grows large.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::bot::telegram::{TelegramApi, TextMode};

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BATCH: usize = 50;
const MAX_LOG_CHARS: usize = 4000;

#[derive(Debug, PartialEq)]
enum LogLine {
    Urgent(String),
    Info(String),
}

pub struct TelegramLogLayer {
    tx: mpsc::UnboundedSender<LogLine>,
}

impl TelegramLogLayer {
    /// Must be called inside a tokio runtime; spawns the forwarding task.
    pub fn new(telegram: Arc<dyn TelegramApi>, chat_id: i64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(rx, telegram, chat_id, FLUSH_INTERVAL));
        Self { tx }
    }
}

async fn forward(
    mut rx: mpsc::UnboundedReceiver<LogLine>,
    telegram: Arc<dyn TelegramApi>,
    chat_id: i64,
    flush_every: Duration,
) {
    let mut batch: Vec<String> = Vec::new();
    let mut interval = tokio::time::interval(flush_every);

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(LogLine::Urgent(text)) => send_log(telegram.as_ref(), chat_id, &text).await,
                Some(LogLine::Info(text)) => {
                    batch.push(text);
                    if batch.len() >= MAX_BATCH {
                        flush(telegram.as_ref(), chat_id, &mut batch).await;
                    }
                }
                None => {
                    flush(telegram.as_ref(), chat_id, &mut batch).await;
                    break;
                }
            },
            _ = interval.tick() => flush(telegram.as_ref(), chat_id, &mut batch).await,
        }
    }
}

async fn flush(telegram: &dyn TelegramApi, chat_id: i64, batch: &mut Vec<String>) {
    if batch.is_empty() {
        return;
    }
    let combined = batch.join("\n");
    batch.clear();
    send_log(telegram, chat_id, &combined).await;
}

async fn send_log(telegram: &dyn TelegramApi, chat_id: i64, text: &str) {
    let text = if text.chars().count() > MAX_LOG_CHARS {
        format!("{}...", text.chars().take(MAX_LOG_CHARS).collect::<String>())
    } else {
        text.to_string()
    };
    // Plain text: log lines are full of underscores and brackets.
    // Not logged through tracing, which would feed back into this layer.
    if let Err(e) = telegram.send_text(chat_id, &text, TextMode::Plain).await {
        eprintln!("Failed to send log to Telegram: {e}");
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let text = format!("{value:?}");
            self.message = if self.message.is_empty() { text } else { format!("{text}, {}", self.message) };
        } else if self.message.is_empty() {
            self.message = format!("{} = {:?}", field.name(), value);
        } else {
            self.message.push_str(&format!(", {} = {:?}", field.name(), value));
        }
    }
}

fn classify(level: Level, message: String) -> Option<LogLine> {
    match level {
        Level::ERROR => Some(LogLine::Urgent(format!("❌ {message}"))),
        Level::WARN => Some(LogLine::Urgent(format!("⚠️ {message}"))),
        Level::INFO => Some(LogLine::Info(message)),
        _ => None,
    }
}

impl<S: Subscriber> Layer<S> for TelegramLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::INFO {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        if let Some(line) = classify(level, visitor.message)
            && self.tx.send(line).is_err()
        {
            eprintln!("Log channel closed, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::telegram::fake::FakeTelegram;
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_classify_levels() {
        assert_eq!(classify(Level::ERROR, "boom".into()), Some(LogLine::Urgent("❌ boom".into())));
        assert_eq!(classify(Level::WARN, "hmm".into()), Some(LogLine::Urgent("⚠️ hmm".into())));
        assert_eq!(classify(Level::INFO, "ok".into()), Some(LogLine::Info("ok".into())));
        assert_eq!(classify(Level::DEBUG, "noise".into()), None);
    }

    #[test]
    fn test_layer_captures_message_and_fields() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(TelegramLogLayer { tx });

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(job = "daily", "fired");
            tracing::debug!("dropped");
            tracing::error!("failed");
        });

        assert_eq!(rx.try_recv().unwrap(), LogLine::Info("fired, job = \"daily\"".into()));
        assert_eq!(rx.try_recv().unwrap(), LogLine::Urgent("❌ failed".into()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_urgent_sent_immediately_info_batched() {
        let tg = Arc::new(FakeTelegram::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(forward(rx, tg.clone(), 99, Duration::from_secs(5)));
        // Let the first (immediate) interval tick pass
        tokio::time::sleep(Duration::from_millis(10)).await;

        tx.send(LogLine::Info("one".into())).unwrap();
        tx.send(LogLine::Info("two".into())).unwrap();
        tx.send(LogLine::Urgent("⚠️ careful".into())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tg.texts(), vec![(99, "⚠️ careful".to_string())]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(tg.texts()[1], (99, "one\ntwo".to_string()));

        drop(tx);
        task.await.unwrap();
        assert_eq!(tg.texts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_batch_flushes_early_and_truncates() {
        let tg = Arc::new(FakeTelegram::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(forward(rx, tg.clone(), 1, Duration::from_secs(3600)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let long = "x".repeat(200);
        for _ in 0..MAX_BATCH {
            tx.send(LogLine::Info(long.clone())).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let texts = tg.texts();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0].1.chars().count(), MAX_LOG_CHARS + 3);
        assert!(texts[0].1.ends_with("..."));

        drop(tx);
        task.await.unwrap();
    }
}
