//! In-process job scheduler.
//!
//! Every job owns one tokio task that sleeps until the next fire time and then
//! hands the job's content to the agent through the task supervisor. The job
//! table is the single source of truth: replacing or removing a job aborts its
//! task while the table lock is held, so an id never has two live triggers.

pub mod trigger;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bot::agent::{self, AgentContext, AgentRunner};
use crate::bot::tasks::TaskSupervisor;
pub use trigger::{CronSpec, JobTrigger, SchedulerError, TIMESTAMP_FORMAT, parse_run_at};

/// Jobs registered on every start.
pub const DEFAULT_JOBS: &[(&str, &str, &str)] = &[(
    "daily-summary",
    "0 8 * * *",
    "/daily-summary Run the daily-summary skill: collect the last 24 hours of Telegram messages and summarize them",
)];

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Listing entry for one job.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobInfo {
    pub id: String,
    pub next_run: Option<String>,
    pub trigger: String,
    pub content: String,
}

struct JobEntry {
    trigger: JobTrigger,
    content: String,
    generation: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    tz: Tz,
    clock: Clock,
    jobs: Mutex<HashMap<String, JobEntry>>,
    agent: Arc<dyn AgentRunner>,
    ctx: AgentContext,
    tasks: TaskSupervisor,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(tz: Tz, agent: Arc<dyn AgentRunner>, ctx: AgentContext, tasks: TaskSupervisor) -> Self {
        Self::with_clock(tz, agent, ctx, tasks, Arc::new(Utc::now))
    }

    pub fn with_clock(
        tz: Tz,
        agent: Arc<dyn AgentRunner>,
        ctx: AgentContext,
        tasks: TaskSupervisor,
        clock: Clock,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tz,
                clock,
                jobs: Mutex::new(HashMap::new()),
                agent,
                ctx,
                tasks,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.inner.tz
    }

    pub fn now(&self) -> DateTime<Tz> {
        self.inner.now()
    }

    /// Register the default jobs. Job tasks are already running once this returns.
    pub fn start(&self) -> Result<(), SchedulerError> {
        for (id, cron, content) in DEFAULT_JOBS {
            self.add_cron_job(id, cron, content)?;
            info!("📅 Default job registered: {} ({})", id, cron);
        }
        info!("⏰ Scheduler started ({})", self.inner.tz);
        Ok(())
    }

    /// Abort every job task. Runs already handed to the supervisor are left to it.
    pub fn shutdown(&self) {
        let mut jobs = self.inner.lock_jobs();
        for (_, entry) in jobs.drain() {
            entry.handle.abort();
        }
        info!("Scheduler stopped");
    }

    /// Add or replace a recurring job.
    pub fn add_cron_job(&self, id: &str, cron: &str, content: &str) -> Result<(), SchedulerError> {
        let spec = CronSpec::parse(cron)?;
        self.upsert(id, JobTrigger::Cron(spec), content);
        info!("➕ Job added: {} ({})", id, cron.trim());
        debug!("Job {} content: {}", id, preview(content));
        Ok(())
    }

    /// Add or replace a one-shot job; returns the resolved run time.
    pub fn add_once_job(&self, id: &str, run_at: &str, content: &str) -> Result<DateTime<Tz>, SchedulerError> {
        let at = parse_run_at(run_at, &self.now())?;
        self.upsert(id, JobTrigger::Once(at), content);
        info!("➕ One-shot job added: {} ({})", id, at.format(TIMESTAMP_FORMAT));
        debug!("Job {} content: {}", id, preview(content));
        Ok(at)
    }

    pub fn list_jobs(&self) -> Vec<JobInfo> {
        let now = self.now();
        let jobs = self.inner.lock_jobs();
        let mut list: Vec<JobInfo> = jobs.iter().map(|(id, entry)| job_info(id, entry, &now)).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn get_job(&self, id: &str) -> Result<JobInfo, SchedulerError> {
        let now = self.now();
        let jobs = self.inner.lock_jobs();
        jobs.get(id)
            .map(|entry| job_info(id, entry, &now))
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    pub fn remove_job(&self, id: &str) -> Result<(), SchedulerError> {
        let entry = self
            .inner
            .lock_jobs()
            .remove(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        entry.handle.abort();
        info!("🗑️ Job removed: {}", id);
        Ok(())
    }

    /// Run a job's content now, outside its schedule. Returns once the run is queued.
    pub fn trigger_job(&self, id: &str) -> Result<(), SchedulerError> {
        let content = {
            let jobs = self.inner.lock_jobs();
            let entry = jobs.get(id).ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
            entry.content.clone()
        };
        if content.trim().is_empty() {
            return Err(SchedulerError::NoContent);
        }

        info!("▶️ Job triggered manually: {}", id);
        self.inner.spawn_run(id, content, None);
        Ok(())
    }

    fn upsert(&self, id: &str, trigger: JobTrigger, content: &str) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut jobs = self.inner.lock_jobs();

        // Spawned while the table is locked: the new task cannot observe the
        // table before its own entry is in place.
        let handle = tokio::spawn(run_job(
            self.inner.clone(),
            id.to_string(),
            generation,
            trigger.clone(),
            content.to_string(),
        ));

        let entry = JobEntry { trigger, content: content.to_string(), generation, handle };
        if let Some(old) = jobs.insert(id.to_string(), entry) {
            old.handle.abort();
            debug!("Job {} replaced", id);
        }
    }

    #[cfg(test)]
    fn job_count(&self) -> usize {
        self.inner.lock_jobs().len()
    }
}

impl Inner {
    fn now(&self) -> DateTime<Tz> {
        (self.clock)().with_timezone(&self.tz)
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand `content` to the agent in the background. With `running`, the flag
    /// is held for the duration of the run.
    fn spawn_run(&self, id: &str, content: String, running: Option<RunningGuard>) {
        let agent = self.agent.clone();
        let workdir = self.ctx.workdir.clone();
        let timeout = self.ctx.scheduled_timeout;
        let job_id = id.to_string();

        self.tasks.spawn(format!("job:{id}"), async move {
            let _running = running;
            if !agent::run_scheduled(agent.as_ref(), &content, &workdir, timeout).await {
                warn!("Job {} did not complete successfully", job_id);
            }
            Ok::<(), std::convert::Infallible>(())
        });
    }
}

/// Sleep-fire loop for one job.
async fn run_job(inner: Arc<Inner>, id: String, generation: u64, trigger: JobTrigger, content: String) {
    let running = Arc::new(AtomicBool::new(false));
    let mut last_fire: Option<DateTime<Tz>> = None;

    loop {
        let now = inner.now();
        // Never fire the same instant twice, even if the clock lags the timer.
        let after = match last_fire {
            Some(last) if last > now => last,
            _ => now,
        };
        let Some(next) = trigger.next_fire(&after) else {
            debug!("Job {} has no further fire times", id);
            return;
        };

        let delay = (next - now).to_std().unwrap_or_default();
        tokio::time::sleep(delay).await;
        last_fire = Some(next);

        if trigger.is_once() {
            // Only remove our own entry, never a replacement under the same id.
            let removed = {
                let mut jobs = inner.lock_jobs();
                let ours = jobs.get(&id).is_some_and(|entry| entry.generation == generation);
                if ours {
                    jobs.remove(&id);
                }
                ours
            };
            if removed {
                info!("🔔 One-shot job fired: {}", id);
                inner.spawn_run(&id, content, None);
            }
            return;
        }

        match RunningGuard::acquire(&running) {
            Some(guard) => {
                info!("🔔 Job fired: {}", id);
                inner.spawn_run(&id, content.clone(), Some(guard));
            }
            None => warn!("⏭️ Job {} still running, skipping this fire", id),
        }
    }
}

/// Marks a job as running until dropped.
struct RunningGuard(Arc<AtomicBool>);

impl RunningGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        (!flag.swap(true, Ordering::SeqCst)).then(|| Self(flag.clone()))
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn job_info(id: &str, entry: &JobEntry, now: &DateTime<Tz>) -> JobInfo {
    JobInfo {
        id: id.to_string(),
        next_run: entry
            .trigger
            .next_fire(now)
            .map(|t| t.format(TIMESTAMP_FORMAT).to_string()),
        trigger: entry.trigger.describe(),
        content: entry.content.clone(),
    }
}

fn preview(content: &str) -> String {
    content.chars().take(100).collect()
}
