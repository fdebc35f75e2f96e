use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

use actionable::bot::agent::{AgentContext, AgentInvoker, AgentRunner};
use actionable::bot::dedup::UpdateDeduplicator;
use actionable::bot::router::MessageRouter;
use actionable::bot::tasks::TaskSupervisor;
use actionable::bot::telegram::{TelegramApi, TelegramClient};
use actionable::bot::typing;
use actionable::config::Config;
use actionable::scheduler::Scheduler;
use actionable::server::{self, AppState, webhook};
use actionable::telegram_log::TelegramLogLayer;

/// How long in-flight agent runs get to finish on shutdown before they are cancelled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Telegram webhook server handing chat messages and scheduled jobs to an AI agent
#[derive(Parser, Debug)]
#[command(name = "actionable", version, about, long_about = None)]
struct Cli {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Register this public URL as the bot's webhook and exit
    #[arg(long, value_name = "URL")]
    webhook_url: Option<String>,

    /// Remove the bot's webhook and exit
    #[arg(long, conflicts_with = "webhook_url")]
    delete_webhook: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;
    let telegram: Arc<dyn TelegramApi> = Arc::new(TelegramClient::from_token(&config.telegram_bot_token));

    let _log_guard = init_logging(&config, &telegram)?;

    if let Some(url) = cli.webhook_url.as_deref() {
        let endpoint = webhook::endpoint_url(url);
        telegram
            .set_webhook(&endpoint, config.webhook_secret.as_deref())
            .await
            .context("failed to register webhook")?;
        info!("✅ Webhook registered: {}", endpoint);
        if config.webhook_secret.is_none() {
            warn!("TELEGRAM_WEBHOOK_SECRET is not set; the webhook accepts unauthenticated requests");
        }
        return Ok(());
    }

    if cli.delete_webhook {
        telegram.delete_webhook().await.context("failed to delete webhook")?;
        info!("✅ Webhook deleted");
        return Ok(());
    }

    info!("🚀 Starting actionable...");
    info!("Project root: {}", config.project_root.display());
    info!("Agent: {} (workdir {})", config.agent.command, config.agent.workdir.display());

    let tasks = TaskSupervisor::new();
    let agent: Arc<dyn AgentRunner> = Arc::new(AgentInvoker::from_settings(&config.agent));
    let ctx = AgentContext::from_settings(&config.agent);

    let scheduler = Scheduler::new(config.timezone, agent.clone(), ctx.clone(), tasks.clone());
    let router = MessageRouter::standard(telegram.clone(), agent, ctx, typing::DEFAULT_INTERVAL);
    info!("Handlers: {:?}", router.handler_names());

    let state = AppState {
        webhook_secret: config.webhook_secret.clone(),
        bot_token_set: !config.telegram_bot_token.is_empty(),
        tz: config.timezone,
        telegram,
        dedup: Arc::new(UpdateDeduplicator::default()),
        router: Arc::new(router),
        scheduler: scheduler.clone(),
        tasks: tasks.clone(),
    };

    scheduler.start().context("failed to register default jobs")?;

    let listener = tokio::net::TcpListener::bind((cli.host.as_str(), cli.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", cli.host, cli.port))?;
    server::serve(listener, server::build(state), shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutting down...");
    scheduler.shutdown();
    tasks.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

/// stdout + daily-rotated file, plus Telegram forwarding when a log chat is set.
fn init_logging(config: &Config, telegram: &Arc<dyn TelegramApi>) -> Result<WorkerGuard> {
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).with_context(|| format!("failed to create {}", log_dir.display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "actionable.log"));

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        );

    if let Some(log_chat_id) = config.log_chat_id {
        registry.with(TelegramLogLayer::new(telegram.clone(), log_chat_id)).init();
    } else {
        registry.init();
    }
    Ok(guard)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
