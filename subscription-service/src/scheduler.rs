//! Periodic job runner for the lifecycle sweeps.
//!
//! Each job runs on its own task. A job never overlaps itself: the next tick
//! is only awaited after the previous run returns, and ticks missed while a
//! run was in progress are skipped rather than replayed.

use crate::config::SchedulerConfig;
use crate::services::clock::Clock;
use crate::services::lifecycle::SubscriptionManager;
use chrono::{DateTime, NaiveTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// When a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed interval, first run one interval after start.
    Every(Duration),
    /// Once a day at the given UTC time.
    DailyAt(NaiveTime),
}

impl Schedule {
    /// Delay from `now` until the next firing.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Schedule::Every(period) => *period,
            Schedule::DailyAt(at) => {
                let today = now.date_naive().and_time(*at).and_utc();
                let next = if today > now {
                    today
                } else {
                    today + chrono::Duration::days(1)
                };
                (next - now).to_std().unwrap_or(Duration::ZERO)
            }
        }
    }

    fn period(&self) -> Duration {
        match self {
            Schedule::Every(period) => *period,
            Schedule::DailyAt(_) => Duration::from_secs(24 * 60 * 60),
        }
    }
}

pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Job {
    name: &'static str,
    schedule: Schedule,
    run: JobFn,
}

pub struct Scheduler {
    jobs: Vec<Job>,
    clock: Arc<dyn Clock>,
    shutdown_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Daily schedules are placed against `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Vec::new(),
            clock,
            shutdown_token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn add_job<F>(&mut self, name: &'static str, schedule: Schedule, run: F)
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.jobs.push(Job {
            name,
            schedule,
            run: Arc::new(run),
        });
    }

    /// Spawn one task per registered job.
    pub fn start(&mut self) {
        let now = self.clock.now();
        for job in self.jobs.drain(..) {
            let shutdown = self.shutdown_token.clone();
            let first = Instant::now() + job.schedule.next_delay(now);

            tracing::info!(
                job = job.name,
                schedule = ?job.schedule,
                "Scheduling job"
            );

            self.handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(first, job.schedule.period());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            tracing::info!(job = job.name, "Job stopped");
                            break;
                        }
                        _ = ticker.tick() => {
                            tracing::debug!(job = job.name, "Job fired");
                            (job.run)().await;
                        }
                    }
                }
            }));
        }
    }

    /// Stop all jobs. A run in progress finishes its current item first.
    pub async fn shutdown(self) {
        tracing::info!("Initiating scheduler shutdown");
        self.shutdown_token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Scheduled job ended abnormally");
            }
        }
    }
}

/// Register the lifecycle sweeps.
pub fn register_subscription_jobs(
    scheduler: &mut Scheduler,
    manager: Arc<SubscriptionManager>,
    config: &SchedulerConfig,
) {
    let expiry = Arc::clone(&manager);
    scheduler.add_job(
        "expiry_sweep",
        Schedule::Every(Duration::from_secs(config.expiry_interval_secs.max(1))),
        move || {
            let manager = Arc::clone(&expiry);
            Box::pin(async move {
                if let Err(e) = manager.run_expiry_sweep().await {
                    tracing::error!(error = %e, "Expiry sweep failed");
                }
            })
        },
    );

    let reminders = Arc::clone(&manager);
    scheduler.add_job(
        "reminder_sweep",
        Schedule::DailyAt(config.reminder_time),
        move || {
            let manager = Arc::clone(&reminders);
            Box::pin(async move {
                if let Err(e) = manager.run_reminder_sweep().await {
                    tracing::error!(error = %e, "Reminder sweep failed");
                }
            })
        },
    );

    let usage_alerts = Arc::clone(&manager);
    scheduler.add_job(
        "usage_alert_sweep",
        Schedule::Every(Duration::from_secs(config.usage_alert_interval_secs.max(1))),
        move || {
            let manager = Arc::clone(&usage_alerts);
            Box::pin(async move {
                if let Err(e) = manager.run_usage_alert_sweep().await {
                    tracing::error!(error = %e, "Usage alert sweep failed");
                }
            })
        },
    );

    scheduler.add_job(
        "renewal_sweep",
        Schedule::DailyAt(config.renewal_time),
        move || {
            let manager = Arc::clone(&manager);
            Box::pin(async move {
                if let Err(e) = manager.run_renewal_sweep().await {
                    tracing::error!(error = %e, "Renewal sweep failed");
                }
            })
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::{ManualClock, SystemClock};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn daily_schedule_waits_for_next_occurrence() {
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let morning = Utc.with_ymd_and_hms(2026, 3, 10, 8, 30, 0).unwrap();
        assert_eq!(
            Schedule::DailyAt(nine).next_delay(morning),
            Duration::from_secs(30 * 60)
        );

        let evening = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();
        assert_eq!(
            Schedule::DailyAt(nine).next_delay(evening),
            Duration::from_secs(24 * 60 * 60)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn interval_job_fires_until_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(Arc::new(SystemClock));
        let counter = Arc::clone(&runs);
        scheduler.add_job("tick", Schedule::Every(Duration::from_secs(60)), move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(185)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        scheduler.shutdown().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_job_does_not_overlap_itself() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(Arc::new(SystemClock));
        let (a, m) = (Arc::clone(&active), Arc::clone(&max_active));
        scheduler.add_job("slow", Schedule::Every(Duration::from_secs(10)), move || {
            let (a, m) = (Arc::clone(&a), Arc::clone(&m));
            Box::pin(async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(35)).await;
                a.fetch_sub(1, Ordering::SeqCst);
            })
        });
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(200)).await;
        scheduler.shutdown().await;
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn daily_job_is_placed_by_injected_clock() {
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 10, 8, 30, 0).unwrap());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(Arc::new(clock));
        let counter = Arc::clone(&runs);
        scheduler.add_job("daily", Schedule::DailyAt(nine), move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(29 * 60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
    }
}
