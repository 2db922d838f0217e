/**
 * SCHEDULER - recurring background jobs
 *
 * ROLE:
 * Runs the per-kind reconciliations, the daily snapshot and the namespace
 * cleanup on their own cadence.
 *
 * HOW IT WORKS:
 * - every job is one tokio task
 * - `Every::Interval(d)`: first run after `d`, then every `d`; a late tick is
 *   delayed, never burst
 * - `Every::DailyAt { hour, minute }`: next occurrence of that UTC time
 * - a job awaits its own callback before waiting again, so it never
 *   overlaps itself
 * - `stop()` signals every task and waits for running callbacks to finish
 */

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use time::{OffsetDateTime, Time, UtcOffset};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Every {
    Interval(Duration),
    DailyAt { hour: u8, minute: u8 },
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("job {0}: interval must be greater than zero")]
    ZeroInterval(String),
    #[error("job {name}: invalid time of day {hour:02}:{minute:02}")]
    InvalidTime { name: String, hour: u8, minute: u8 },
    #[error("scheduler already started")]
    AlreadyStarted,
}

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

struct Job {
    name: String,
    every: Every,
    run: JobFn,
}

pub struct Scheduler {
    jobs: Vec<Job>,
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    started: bool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: Vec::new(),
            handles: Vec::new(),
            shutdown,
            started: false,
        }
    }

    pub fn schedule<F, Fut>(
        &mut self,
        name: impl Into<String>,
        every: Every,
        job: F,
    ) -> Result<(), ScheduleError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.started {
            return Err(ScheduleError::AlreadyStarted);
        }
        match every {
            Every::Interval(d) if d.is_zero() => return Err(ScheduleError::ZeroInterval(name)),
            Every::DailyAt { hour, minute } if hour > 23 || minute > 59 => {
                return Err(ScheduleError::InvalidTime { name, hour, minute })
            }
            _ => {}
        }

        let run: JobFn = Arc::new(move || Box::pin(job()) as JobFuture);
        self.jobs.push(Job { name, every, run });
        Ok(())
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    pub fn start(&mut self) -> Result<(), ScheduleError> {
        if self.started {
            return Err(ScheduleError::AlreadyStarted);
        }
        self.started = true;

        for job in &self.jobs {
            let name = job.name.clone();
            let every = job.every;
            let run = job.run.clone();
            let mut shutdown = self.shutdown.subscribe();

            self.handles.push(tokio::spawn(async move {
                match every {
                    Every::Interval(period) => {
                        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        loop {
                            tokio::select! {
                                biased;
                                _ = shutdown.changed() => break,
                                _ = ticker.tick() => {
                                    debug!(task = %name, "job triggered");
                                    run().await;
                                }
                            }
                        }
                    }
                    Every::DailyAt { hour, minute } => loop {
                        let wait = until_daily(OffsetDateTime::now_utc(), hour, minute);
                        tokio::select! {
                            biased;
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(wait) => {
                                debug!(task = %name, "job triggered");
                                run().await;
                            }
                        }
                    },
                }
                debug!(task = %name, "job stopped");
            }));
        }

        info!(jobs = self.jobs.len(), "scheduler started");
        Ok(())
    }

    /// Stops every job, waiting for callbacks in progress.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "job ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

/// Time left until the next `hour:minute` UTC, strictly in the future.
pub fn until_daily(now: OffsetDateTime, hour: u8, minute: u8) -> Duration {
    let Ok(at) = Time::from_hms(hour, minute, 0) else {
        return Duration::from_secs(24 * 3600);
    };
    let now = now.to_offset(UtcOffset::UTC);
    let mut next = now.replace_time(at);
    if next <= now {
        next += time::Duration::days(1);
    }
    Duration::try_from(next - now).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;

    #[test]
    fn test_until_daily() {
        let now = datetime!(2024-05-01 10:00 UTC);
        assert_eq!(until_daily(now, 10, 30), Duration::from_secs(30 * 60));
        assert_eq!(until_daily(now, 10, 0), Duration::from_secs(24 * 3600));
        assert_eq!(until_daily(now, 9, 0), Duration::from_secs(23 * 3600));
        // non-UTC clocks are normalized first
        let shifted = datetime!(2024-05-01 12:00 +2);
        assert_eq!(until_daily(shifted, 10, 30), Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_schedule_validation() {
        let mut scheduler = Scheduler::new();
        assert!(matches!(
            scheduler.schedule("zero", Every::Interval(Duration::ZERO), || async {}),
            Err(ScheduleError::ZeroInterval(_))
        ));
        assert!(matches!(
            scheduler.schedule("late", Every::DailyAt { hour: 24, minute: 0 }, || async {}),
            Err(ScheduleError::InvalidTime { .. })
        ));
        scheduler
            .schedule("ok", Every::DailyAt { hour: 0, minute: 5 }, || async {})
            .unwrap();
        assert_eq!(scheduler.job_names(), vec!["ok"]);
    }

    #[tokio::test]
    async fn test_interval_runs_until_stopped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        let c = counter.clone();
        scheduler
            .schedule("tick", Every::Interval(Duration::from_millis(20)), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        scheduler.start().unwrap();
        assert!(matches!(scheduler.start(), Err(ScheduleError::AlreadyStarted)));
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.stop().await;

        let runs = counter.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected several runs, got {runs}");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), runs);
    }

    #[tokio::test]
    async fn test_stop_waits_for_running_job() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        let f = finished.clone();
        scheduler
            .schedule("slow", Every::Interval(Duration::from_millis(10)), move || {
                let f = f.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    f.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.stop().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
