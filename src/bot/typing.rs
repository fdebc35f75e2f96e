//! Keeps the "typing…" indicator alive while the agent works.
//!
//! Telegram drops the indicator after roughly five seconds, so it has to be
//! re-sent for as long as an invocation is in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use teloxide::types::ChatAction;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::telegram::TelegramApi;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(4);

/// Background loop re-sending `typing` to one chat.
///
/// Call [`TypingKeepalive::stop`] when the paired work finishes; it returns
/// only after the loop has exited, so no indicator is sent afterwards.
pub struct TypingKeepalive {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl TypingKeepalive {
    pub fn start(telegram: Arc<dyn TelegramApi>, chat_id: i64, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let stop_flag = stop.clone();
        let wake_signal = wake.clone();

        let task = tokio::spawn(async move {
            while !stop_flag.load(Ordering::SeqCst) {
                if let Err(e) = telegram.send_chat_action(chat_id, ChatAction::Typing).await {
                    warn!("Typing indicator failed for chat {}: {}", chat_id, e);
                }

                tokio::select! {
                    biased;

                    _ = wake_signal.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Typing keepalive for chat {} stopped", chat_id);
        });

        Self { stop, wake, task: Some(task) }
    }

    /// Signal the loop to exit and wait for it.
    pub async fn stop(mut self) {
        self.signal();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("Typing keepalive task ended abnormally: {}", e);
        }
    }

    fn signal(&self) {
        self.stop.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a loop still inside send_chat_action
        // sees the wake-up as soon as it reaches the select.
        self.wake.notify_one();
    }
}

impl Drop for TypingKeepalive {
    fn drop(&mut self) {
        self.signal();
    }
}
