//! Message routing: an ordered list of handlers per inbound message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};

use super::agent::{AgentContext, AgentError, AgentOutcome, AgentRunner};
use super::message::IncomingMessage;
use super::telegram::{self, TelegramApi, TelegramError};
use super::typing::TypingKeepalive;

pub const START_TEXT: &str = "Hi! Send me a message and the AI agent will get back to you.";
pub const HELP_TEXT: &str = "Send any message and the AI agent will analyze it and reply here.\n\n\
/start - greeting\n/help - this message";

/// Commands answered locally; never forwarded to the agent.
pub const BUILTIN_COMMANDS: &[&str] = &["/start", "/help"];

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),
    #[error("telegram error: {0}")]
    Telegram(#[from] TelegramError),
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Optional reply text, sent back to the message's chat by the router.
    async fn handle(&self, msg: &IncomingMessage) -> Result<Option<String>, HandlerError>;
}

/// Answers one exact command with fixed text.
pub struct CommandReply {
    command: &'static str,
    reply: &'static str,
}

impl CommandReply {
    pub fn start() -> Self {
        Self { command: "/start", reply: START_TEXT }
    }

    pub fn help() -> Self {
        Self { command: "/help", reply: HELP_TEXT }
    }
}

#[async_trait]
impl MessageHandler for CommandReply {
    fn name(&self) -> &str {
        self.command
    }

    async fn handle(&self, msg: &IncomingMessage) -> Result<Option<String>, HandlerError> {
        Ok((msg.text.trim() == self.command).then(|| self.reply.to_string()))
    }
}

/// Hands every other non-empty message to the external agent.
///
/// The agent answers through Telegram itself, so this handler never returns
/// a reply; it only keeps the typing indicator up while the agent runs.
pub struct AgentHandler {
    telegram: Arc<dyn TelegramApi>,
    agent: Arc<dyn AgentRunner>,
    ctx: AgentContext,
    typing_interval: Duration,
}

impl AgentHandler {
    pub fn new(
        telegram: Arc<dyn TelegramApi>,
        agent: Arc<dyn AgentRunner>,
        ctx: AgentContext,
        typing_interval: Duration,
    ) -> Self {
        Self { telegram, agent, ctx, typing_interval }
    }

    fn prompt(&self, msg: &IncomingMessage) -> String {
        format!("{}\n\n{}", self.ctx.skill, msg.format())
    }
}

#[async_trait]
impl MessageHandler for AgentHandler {
    fn name(&self) -> &str {
        "agent"
    }

    async fn handle(&self, msg: &IncomingMessage) -> Result<Option<String>, HandlerError> {
        let text = msg.text.trim();
        if text.is_empty() || BUILTIN_COMMANDS.contains(&text) {
            return Ok(None);
        }

        info!("🤖 Running agent for chat {} ({})", msg.chat_id, msg.sender());
        let keepalive = TypingKeepalive::start(self.telegram.clone(), msg.chat_id, self.typing_interval);
        let result = self
            .agent
            .invoke(&self.prompt(msg), &self.ctx.workdir, self.ctx.interactive_timeout)
            .await;
        keepalive.stop().await;

        match result? {
            AgentOutcome::Success => info!("Agent done for chat {}", msg.chat_id),
            AgentOutcome::Failure { code, .. } => warn!("Agent failed for chat {} (exit {:?})", msg.chat_id, code),
            AgentOutcome::Timeout => warn!("Agent timed out for chat {}", msg.chat_id),
        }
        Ok(None)
    }
}

/// Ordered handler list plus per-chat serialization.
pub struct MessageRouter {
    handlers: Vec<Box<dyn MessageHandler>>,
    telegram: Arc<dyn TelegramApi>,
    chat_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

pub struct MessageRouterBuilder {
    handlers: Vec<Box<dyn MessageHandler>>,
    telegram: Arc<dyn TelegramApi>,
}

impl MessageRouterBuilder {
    pub fn handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn build(self) -> MessageRouter {
        MessageRouter {
            handlers: self.handlers,
            telegram: self.telegram,
            chat_locks: Mutex::new(HashMap::new()),
        }
    }
}

impl MessageRouter {
    pub fn builder(telegram: Arc<dyn TelegramApi>) -> MessageRouterBuilder {
        MessageRouterBuilder { handlers: Vec::new(), telegram }
    }

    /// `/start`, `/help`, then the agent.
    pub fn standard(
        telegram: Arc<dyn TelegramApi>,
        agent: Arc<dyn AgentRunner>,
        ctx: AgentContext,
        typing_interval: Duration,
    ) -> Self {
        Self::builder(telegram.clone())
            .handler(CommandReply::start())
            .handler(CommandReply::help())
            .handler(AgentHandler::new(telegram, agent, ctx, typing_interval))
            .build()
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Run every handler in order, sending each reply to the chat.
    ///
    /// Messages from the same chat are processed one at a time, in the order
    /// `dispatch` was called; a failing handler does not stop the others.
    pub async fn dispatch(&self, msg: &IncomingMessage) {
        let chat_lock = self.chat_lock(msg.chat_id);
        let guard = chat_lock.lock().await;

        for handler in &self.handlers {
            match handler.handle(msg).await {
                Ok(Some(reply)) => {
                    if let Err(e) = telegram::send_message(self.telegram.as_ref(), msg.chat_id, &reply).await {
                        error!("Failed to send reply from '{}': {}", handler.name(), e);
                    }
                }
                Ok(None) => {}
                Err(e) => error!("Handler '{}' failed: {}", handler.name(), e),
            }
        }

        drop(guard);
        self.release_chat_lock(msg.chat_id, chat_lock);
    }

    fn chat_lock(&self, chat_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.chat_locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(chat_id).or_default().clone()
    }

    fn release_chat_lock(&self, chat_id: i64, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.chat_locks.lock().unwrap_or_else(|p| p.into_inner());
        drop(lock);
        // Only the map's own reference left: nobody is waiting on this chat.
        if locks.get(&chat_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&chat_id);
        }
    }

    #[cfg(test)]
    fn tracked_chats(&self) -> usize {
        self.chat_locks.lock().unwrap().len()
    }
}
