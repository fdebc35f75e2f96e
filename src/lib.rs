pub mod bot;
pub mod config;
pub mod scheduler;
pub mod server;
pub mod telegram_log;
