//! Telegram side of the service: inbound updates, routing and the agent.

pub mod agent;
pub mod dedup;
pub mod message;
pub mod router;
pub mod tasks;
pub mod telegram;
pub mod typing;

pub use agent::{AgentContext, AgentInvoker, AgentOutcome, AgentRunner};
pub use dedup::UpdateDeduplicator;
pub use message::{IncomingMessage, WebhookUpdate};
pub use router::{MessageHandler, MessageRouter};
pub use tasks::TaskSupervisor;
pub use telegram::{TelegramApi, TelegramClient, TelegramError};
pub use typing::TypingKeepalive;
