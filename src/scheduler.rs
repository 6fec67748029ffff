//! Background jobs: the anomaly sweep, periodic retraining and the one-shot
//! train-on-startup.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::service::ForecastService;

// ---

/// A spawned background job that can be stopped and awaited.
#[derive(Debug)]
pub struct ScheduledTask {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `job` every `period` until stopped.
    ///
    /// A run in progress is allowed to finish; cancellation is observed
    /// between runs. Ticks missed while a run is slow are skipped.
    pub fn spawn_interval<F, Fut>(name: &str, period: Duration, run_immediately: bool, job: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // ---
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let task_name = name.to_string();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let first = if run_immediately {
                Instant::now()
            } else {
                Instant::now() + period
            };
            let mut ticker = tokio::time::interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!("Scheduled task {} started, every {:?}", task_name, period);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tracing::debug!("Running scheduled task {}", task_name);
                job().await;
            }
            tracing::info!("Scheduled task {} stopped", task_name);
        });

        Self {
            name: name.to_string(),
            token,
            handle,
        }
    }

    /// Run `job` once in the background. Stopping before it completes
    /// abandons it.
    pub fn spawn_once<Fut>(name: &str, job: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        // ---
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    tracing::info!("One-shot task {} cancelled", task_name);
                }
                _ = job => {
                    tracing::info!("One-shot task {} finished", task_name);
                }
            }
        });

        Self {
            name: name.to_string(),
            token,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait for the task to exit.
    pub async fn stop(self) {
        // ---
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!("Scheduled task {} ended abnormally: {}", self.name, e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrainPolicy {
    /// Only train when asked through the API.
    Manual,
    Every(Duration),
}

impl RetrainPolicy {
    /// `0` hours means manual.
    pub fn from_hours(hours: u64) -> Self {
        if hours == 0 {
            RetrainPolicy::Manual
        } else {
            RetrainPolicy::Every(Duration::from_secs(hours * 3600))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePlan {
    /// `None` disables the anomaly sweep.
    pub anomaly_interval: Option<Duration>,
    pub retrain: RetrainPolicy,
    pub train_on_startup: bool,
}

/// Owns every background task of the running service.
#[derive(Debug, Default)]
pub struct Scheduler {
    tasks: Vec<ScheduledTask>,
}

impl Scheduler {
    pub fn start(service: Arc<ForecastService>, plan: SchedulePlan) -> Self {
        // ---
        let mut tasks = Vec::new();

        if plan.train_on_startup {
            let svc = Arc::clone(&service);
            tasks.push(ScheduledTask::spawn_once("train-on-startup", async move {
                svc.train_missing().await;
            }));
        }

        if let Some(period) = plan.anomaly_interval {
            let svc = Arc::clone(&service);
            tasks.push(ScheduledTask::spawn_interval(
                "anomaly-sweep",
                period,
                true,
                move || {
                    let svc = Arc::clone(&svc);
                    async move {
                        svc.sweep_all().await;
                    }
                },
            ));
        }

        match plan.retrain {
            RetrainPolicy::Manual => tracing::info!("Retraining is manual"),
            RetrainPolicy::Every(period) => {
                let svc = Arc::clone(&service);
                tasks.push(ScheduledTask::spawn_interval(
                    "retrain",
                    period,
                    false,
                    move || {
                        let svc = Arc::clone(&svc);
                        async move { svc.retrain_all().await }
                    },
                ));
            }
        }

        Self { tasks }
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(ScheduledTask::name).collect()
    }

    pub async fn shutdown(self) {
        // ---
        for task in self.tasks {
            task.stop().await;
        }
        tracing::info!("Scheduler shut down");
    }
}
