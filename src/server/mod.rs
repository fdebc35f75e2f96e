//! HTTP surface: Telegram webhook, health check and the scheduler API.

pub mod error;
pub mod jobs;
pub mod webhook;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use chrono_tz::Tz;
use tokio::net::TcpListener;
use tracing::info;

use crate::bot::dedup::UpdateDeduplicator;
use crate::bot::router::MessageRouter;
use crate::bot::tasks::TaskSupervisor;
use crate::bot::telegram::TelegramApi;
use crate::scheduler::Scheduler;

/// State shared across all routes.
#[derive(Clone)]
pub struct AppState {
    /// Required value of the webhook secret header, if any.
    pub webhook_secret: Option<String>,
    pub bot_token_set: bool,
    pub tz: Tz,
    pub telegram: Arc<dyn TelegramApi>,
    pub dedup: Arc<UpdateDeduplicator>,
    pub router: Arc<MessageRouter>,
    pub scheduler: Scheduler,
    pub tasks: TaskSupervisor,
}

pub fn build(state: AppState) -> Router {
    let scheduler_api = Router::new()
        .route("/jobs", get(jobs::list).post(jobs::add))
        .route("/jobs/once", post(jobs::add_once))
        .route("/jobs/{id}", get(jobs::get).delete(jobs::remove))
        .route("/trigger/{id}", post(jobs::trigger));

    Router::new()
        .route("/webhook", post(webhook::receive))
        .route("/health", get(webhook::health))
        .nest("/scheduler", scheduler_api)
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("🌐 Listening on http://{}", addr);
    }
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}
