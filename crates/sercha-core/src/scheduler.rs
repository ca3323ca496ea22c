//! Background scheduler for named recurring tasks.
//!
//! The [`Scheduler`] owns its task registry (no process globals), polls at a
//! fixed tick, and launches every due task on its own tokio task so that a
//! slow or failing task never delays another. Each execution yields exactly
//! one [`TaskResult`], which is appended to the [`SchedulerStore`] history
//! and folded into the task's [`ScheduledTask`] row.
//!
//! Lifecycle management follows the tokio-util pattern: a
//! [`CancellationToken`] stops dispatching, a [`TaskTracker`] lets
//! [`Scheduler::stop`] wait for in-flight executions, and a second token is
//! handed to executions so that [`Scheduler::shutdown`] can ask them to stop
//! at their next safe point once the grace period runs out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{Error, Result};
use crate::models::{add_interval, ScheduledTask, TaskResult};
use crate::store::SchedulerStore;

/// Results kept per task after each execution.
pub const HISTORY_LIMIT: usize = 100;

pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

/// What a task run reports back to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutcome {
    pub items_processed: usize,
    pub items_failed: usize,
    /// Independent units (a source, a credential) that failed. Any entry
    /// marks the run as failed.
    pub unit_failures: Vec<String>,
    /// Problems that do not fail the run, such as skipped sync items.
    pub warnings: Vec<String>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.unit_failures.is_empty()
    }

    fn error_message(&self) -> Option<String> {
        if !self.unit_failures.is_empty() {
            Some(self.unit_failures.join("; "))
        } else if !self.warnings.is_empty() {
            Some(self.warnings.join("; "))
        } else {
            None
        }
    }
}

/// A named recurring job.
#[async_trait]
pub trait Task: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// Interval used when configuration does not set one.
    fn default_interval(&self) -> Duration;

    /// Run once. Implementations check `cancel` between units of work.
    async fn run(&self, cancel: &CancellationToken) -> Result<TaskOutcome>;
}

/// Per-task scheduling configuration. The zero value is disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub enabled: bool,
    /// `None` falls back to the task's default interval.
    pub interval: Option<Duration>,
}

impl TaskConfig {
    pub fn enabled(interval: Duration) -> Self {
        Self {
            enabled: true,
            interval: Some(interval),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// `false` suppresses all ticking.
    pub enabled: bool,
    pub tick: Duration,
    pub tasks: HashMap<String, TaskConfig>,
}

impl SchedulerConfig {
    /// Configuration for `task_id`; unknown tasks get the disabled zero
    /// config.
    pub fn task_config(&self, task_id: &str) -> TaskConfig {
        self.tasks.get(task_id).cloned().unwrap_or_default()
    }
}

impl Default for SchedulerConfig {
    /// Ticking every minute with both built-in tasks enabled at their
    /// default intervals.
    fn default() -> Self {
        use crate::tasks::{
            DOCUMENT_SYNC_INTERVAL, DOCUMENT_SYNC_TASK_ID, OAUTH_REFRESH_INTERVAL,
            OAUTH_REFRESH_TASK_ID,
        };
        let tasks = HashMap::from([
            (
                OAUTH_REFRESH_TASK_ID.to_string(),
                TaskConfig::enabled(OAUTH_REFRESH_INTERVAL),
            ),
            (
                DOCUMENT_SYNC_TASK_ID.to_string(),
                TaskConfig::enabled(DOCUMENT_SYNC_INTERVAL),
            ),
        ]);
        Self {
            enabled: true,
            tick: DEFAULT_TICK,
            tasks,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    config: SchedulerConfig,
    store: Arc<dyn SchedulerStore>,
    registry: RwLock<HashMap<String, Arc<dyn Task>>>,
    running: Mutex<HashSet<String>>,
    /// Stops the tick loop and further dispatch.
    stop: CancellationToken,
    /// Handed to executions; cancelled when a shutdown grace period expires.
    runs: CancellationToken,
    tracker: TaskTracker,
    tick_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Removes a task from the running set when its execution ends.
struct RunningGuard {
    inner: Arc<Inner>,
    task_id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock(&self.inner.running).remove(&self.task_id);
    }
}

/// Owned, cloneable handle to a scheduler instance.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: Arc<dyn SchedulerStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                registry: RwLock::new(HashMap::new()),
                running: Mutex::new(HashSet::new()),
                stop: CancellationToken::new(),
                runs: CancellationToken::new(),
                tracker: TaskTracker::new(),
                tick_loop: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Register a task. Replaces any task with the same id.
    pub fn register(&self, task: Arc<dyn Task>) {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id().to_string(), task);
    }

    fn registered(&self, task_id: &str) -> Option<Arc<dyn Task>> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    fn registered_all(&self) -> Vec<Arc<dyn Task>> {
        let mut tasks: Vec<Arc<dyn Task>> = self
            .inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id().cmp(b.id()));
        tasks
    }

    /// Write a row for every registered task, applying the configured
    /// enabled flag and interval while keeping its run history fields.
    pub async fn init_tasks(&self) -> Result<()> {
        for task in self.registered_all() {
            let config = self.inner.config.task_config(task.id());
            let interval = config.interval.unwrap_or_else(|| task.default_interval());
            let mut row = match self.inner.store.get_task(task.id()).await {
                Ok(row) => row,
                Err(err) if err.is_not_found() => {
                    ScheduledTask::new(task.id(), task.name(), interval)
                }
                Err(err) => return Err(err),
            };
            row.name = task.name().to_string();
            row.enabled = config.enabled;
            row.interval = interval;
            row.next_run = row.last_run.map(|last| add_interval(last, interval));
            self.inner.store.save_task(&row).await?;
            debug!(task_id = %row.id, enabled = row.enabled, interval_secs = interval.as_secs(), "task initialised");
        }
        Ok(())
    }

    /// Initialise task rows and spawn the tick loop. Does not tick when the
    /// scheduler is disabled.
    pub async fn start(&self) -> Result<()> {
        self.init_tasks().await?;
        if !self.inner.config.enabled {
            info!("scheduler disabled, not ticking");
            return Ok(());
        }

        let mut slot = lock(&self.inner.tick_loop);
        if slot.is_some() {
            return Ok(());
        }
        let this = self.clone();
        let stop = self.inner.stop.clone();
        let tick = self.inner.config.tick.max(Duration::from_millis(1));
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = this.dispatch_due(Utc::now()).await {
                            warn!(error = %err, "scheduler tick failed");
                        }
                    }
                }
            }
            debug!("scheduler tick loop stopped");
        }));
        info!(tick_secs = tick.as_secs(), "scheduler started");
        Ok(())
    }

    /// One tick: launch every enabled, due, registered task that is not
    /// already running. Returns handles to the launched executions.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<Vec<JoinHandle<TaskResult>>> {
        if !self.inner.config.enabled || self.inner.stop.is_cancelled() {
            return Ok(Vec::new());
        }
        let mut handles = Vec::new();
        for row in self.inner.store.list_tasks().await? {
            if !row.is_due(now) {
                continue;
            }
            let Some(task) = self.registered(&row.id) else {
                continue;
            };
            if let Some(handle) = self.launch(task) {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    /// Run an enabled task now, outside its schedule.
    pub fn run_now(&self, task_id: &str) -> Result<JoinHandle<TaskResult>> {
        let task = self
            .registered(task_id)
            .ok_or_else(|| Error::not_found(format!("task {task_id}")))?;
        if !self.inner.config.task_config(task_id).enabled {
            return Err(Error::invalid(format!("task {task_id} is disabled")));
        }
        if self.inner.stop.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.launch(task)
            .ok_or_else(|| Error::invalid(format!("task {task_id} is already running")))
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        lock(&self.inner.running).contains(task_id)
    }

    fn launch(&self, task: Arc<dyn Task>) -> Option<JoinHandle<TaskResult>> {
        let task_id = task.id().to_string();
        if !lock(&self.inner.running).insert(task_id.clone()) {
            debug!(task_id = %task_id, "task still running, not dispatched");
            return None;
        }
        let guard = RunningGuard {
            inner: self.inner.clone(),
            task_id: task_id.clone(),
        };
        let inner = self.inner.clone();
        let span = info_span!("task", task_id = %task_id);
        debug!(task_id = %task_id, "task dispatched");
        Some(self.inner.tracker.spawn(
            async move {
                let _guard = guard;
                inner.execute(task).await
            }
            .instrument(span),
        ))
    }

    /// Stop dispatching and wait for running executions to finish.
    pub async fn stop(&self) {
        self.halt_dispatch().await;
        self.inner.tracker.wait().await;
        info!("scheduler stopped");
    }

    /// Stop dispatching, give running executions `grace` to finish, then
    /// cancel them and wait until they return. Returns `true` if everything
    /// finished within the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.halt_dispatch().await;
        let clean = tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_ok();
        if !clean {
            warn!(
                active = self.inner.tracker.len(),
                "grace period elapsed, cancelling running tasks"
            );
            self.inner.runs.cancel();
            self.inner.tracker.wait().await;
        }
        info!(clean, "scheduler shut down");
        clean
    }

    async fn halt_dispatch(&self) {
        self.inner.stop.cancel();
        self.inner.tracker.close();
        let tick_loop = lock(&self.inner.tick_loop).take();
        if let Some(handle) = tick_loop {
            if let Err(err) = handle.await {
                warn!(error = %err, "scheduler tick loop panicked");
            }
        }
    }

    /// Snapshots of every registered task.
    pub async fn tasks(&self) -> Result<Vec<ScheduledTask>> {
        let mut rows = Vec::new();
        for task in self.registered_all() {
            rows.push(self.task(task.id()).await?);
        }
        Ok(rows)
    }

    pub async fn task(&self, task_id: &str) -> Result<ScheduledTask> {
        self.inner.store.get_task(task_id).await
    }

    /// Most recent results first.
    pub async fn history(&self, task_id: &str, limit: usize) -> Result<Vec<TaskResult>> {
        self.inner.store.task_history(task_id, limit).await
    }
}

impl Inner {
    async fn execute(&self, task: Arc<dyn Task>) -> TaskResult {
        let started_at = Utc::now();
        let outcome = task.run(&self.runs.child_token()).await;
        let ended_at = Utc::now();

        let result = match outcome {
            Ok(outcome) => TaskResult {
                task_id: task.id().to_string(),
                started_at,
                ended_at,
                success: outcome.is_success(),
                error: outcome.error_message(),
                items_processed: outcome.items_processed,
                items_failed: outcome.items_failed,
            },
            Err(err) => TaskResult {
                task_id: task.id().to_string(),
                started_at,
                ended_at,
                success: false,
                error: Some(err.to_string()),
                items_processed: 0,
                items_failed: 0,
            },
        };

        if result.success {
            info!(
                processed = result.items_processed,
                failed = result.items_failed,
                "task completed"
            );
        } else {
            warn!(error = result.error.as_deref().unwrap_or_default(), "task failed");
        }

        if let Err(err) = self.record(&result).await {
            warn!(error = %err, "failed to record task result");
        }
        result
    }

    async fn record(&self, result: &TaskResult) -> Result<()> {
        self.store.record_result(result).await?;
        let mut row = self.store.get_task(&result.task_id).await?;
        row.apply_result(result);
        self.store.save_task(&row).await?;
        self.store.prune_history(HISTORY_LIMIT).await?;
        Ok(())
    }
}
