//! Named jobs driven by wall-clock triggers.
//!
//! Each running job owns a tokio task that sleeps until the trigger's next
//! fire time, runs the job to completion and repeats. Stopping only interrupts
//! the wait, never a run in progress.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveTime};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

pub trait Trigger: Send + Sync {
    /// First fire time strictly after `after`, or `None` if there is none.
    fn next_fire(&self, after: DateTime<Local>) -> Option<DateTime<Local>>;
}

/// Five-field cron expression (`MIN HOUR DOM MON DOW`).
/// Minute and hour accept `*`, `*/N`, comma lists and single values; the
/// remaining fields only accept `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: Vec<u32>,
    hours: Vec<u32>,
}

impl FromStr for CronSchedule {
    type Err = Error;

    fn from_str(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(Error::InvalidSchedule(format!(
                "'{expression}' needs 5 fields: MIN HOUR DOM MON DOW"
            )));
        }

        if let Some(field) = parts[2..].iter().find(|field| **field != "*") {
            return Err(Error::InvalidSchedule(format!(
                "'{expression}': only '*' is supported for day, month and weekday, got '{field}'"
            )));
        }

        let minutes = parse_field(parts[0], 0, 59)
            .ok_or_else(|| Error::InvalidSchedule(format!("bad minute field in '{expression}'")))?;
        let hours = parse_field(parts[1], 0, 23)
            .ok_or_else(|| Error::InvalidSchedule(format!("bad hour field in '{expression}'")))?;

        Ok(Self { minutes, hours })
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    if field == "*" {
        return Some((min..=max).collect());
    }

    if let Some(step) = field.strip_prefix("*/") {
        let n: usize = step.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some((min..=max).step_by(n).collect());
    }

    let mut values = Vec::new();
    for part in field.split(',') {
        let n: u32 = part.trim().parse().ok()?;
        if n < min || n > max {
            return None;
        }
        values.push(n);
    }
    values.sort_unstable();
    values.dedup();
    Some(values)
}

impl Trigger for CronSchedule {
    fn next_fire(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        let today = after.date_naive();
        // Two days covers every hour/minute combination, plus a spare day for
        // local times skipped by a DST transition.
        for offset in 0..=2 {
            let date = today + Duration::days(offset);
            for hour in &self.hours {
                for minute in &self.minutes {
                    let Some(time) = NaiveTime::from_hms_opt(*hour, *minute, 0) else {
                        continue;
                    };
                    let Some(candidate) = date.and_time(time).and_local_timezone(Local).earliest()
                    else {
                        continue;
                    };
                    if candidate > after {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Stopped,
    Running,
}

struct Armed {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct ScheduledJob {
    trigger: Arc<dyn Trigger>,
    job: Arc<dyn Job>,
    guard: Arc<Mutex<()>>,
    armed: Option<Armed>,
}

impl ScheduledJob {
    /// Signals the job's task to exit and hands back its handle. The task may
    /// still be finishing a run.
    fn disarm(&mut self) -> Option<JoinHandle<()>> {
        let armed = self.armed.take()?;
        let _ = armed.shutdown.send(true);
        Some(armed.handle)
    }
}

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    jobs: BTreeMap<String, ScheduledJob>,
    // Tasks of disarmed jobs, kept so shutdown can wait for their last run.
    draining: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            jobs: BTreeMap::new(),
            draining: Vec::new(),
        }
    }

    /// Registers `job` under `name`. A previous registration with the same
    /// name is replaced and its running state carried over. The replacement
    /// shares the previous run guard, so it never overlaps a run still in
    /// progress under the old registration.
    pub fn register(&mut self, name: &str, trigger: Arc<dyn Trigger>, job: Arc<dyn Job>) {
        let (was_running, guard) = match self.jobs.get_mut(name) {
            Some(previous) => {
                let running = previous.armed.is_some();
                if let Some(handle) = previous.disarm() {
                    self.draining.push(handle);
                }
                tracing::info!(job = name, "replacing scheduled job");
                (running, previous.guard.clone())
            }
            None => (false, Arc::new(Mutex::new(()))),
        };

        self.jobs.insert(
            name.to_string(),
            ScheduledJob {
                trigger,
                job,
                guard,
                armed: None,
            },
        );

        if was_running {
            self.arm(name);
        }
    }

    pub fn start(&mut self) {
        let names: Vec<String> = self.jobs.keys().cloned().collect();
        for name in names {
            self.arm(&name);
        }
    }

    pub fn stop(&mut self) {
        self.draining.retain(|handle| !handle.is_finished());
        for (name, entry) in self.jobs.iter_mut() {
            if let Some(handle) = entry.disarm() {
                tracing::info!(job = %name, "stopping scheduled job");
                self.draining.push(handle);
            }
        }
    }

    /// Stops every job, then waits for runs already in progress to finish.
    pub async fn shutdown(&mut self) {
        self.stop();
        for handle in self.draining.drain(..) {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "scheduled job task failed");
            }
        }
    }

    pub fn state(&self, name: &str) -> Option<JobState> {
        self.jobs.get(name).map(|entry| {
            if entry.armed.is_some() {
                JobState::Running
            } else {
                JobState::Stopped
            }
        })
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.keys().map(String::as_str).collect()
    }

    /// Runs a registered job immediately. Returns `false` if the job is
    /// unknown or a run is already in progress.
    pub async fn run_now(&self, name: &str) -> bool {
        let Some(entry) = self.jobs.get(name) else {
            tracing::warn!(job = name, "run requested for unknown job");
            return false;
        };
        run_guarded(name, &entry.job, &entry.guard).await
    }

    fn arm(&mut self, name: &str) {
        let clock = self.clock.clone();
        let Some(entry) = self.jobs.get_mut(name) else {
            return;
        };
        if entry.armed.is_some() {
            return;
        }

        tracing::info!(job = name, "starting scheduled job");
        let (shutdown, receiver) = watch::channel(false);
        let handle = tokio::spawn(drive(
            name.to_string(),
            entry.trigger.clone(),
            entry.job.clone(),
            entry.guard.clone(),
            clock,
            receiver,
        ));
        entry.armed = Some(Armed { shutdown, handle });
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_guarded(name: &str, job: &Arc<dyn Job>, guard: &Mutex<()>) -> bool {
    let Ok(_running) = guard.try_lock() else {
        tracing::warn!(job = name, "previous run still in progress, skipping");
        return false;
    };
    job.run().await;
    true
}

/// Next fire time as seen from `now`, never earlier than one already used.
/// A wall clock stepped back after a short run would otherwise yield the
/// same fire time twice.
fn next_fire_after(
    trigger: &dyn Trigger,
    now: DateTime<Local>,
    last_fire: Option<DateTime<Local>>,
) -> Option<DateTime<Local>> {
    let from = match last_fire {
        Some(last) if last > now => last,
        _ => now,
    };
    trigger.next_fire(from)
}

async fn drive(
    name: String,
    trigger: Arc<dyn Trigger>,
    job: Arc<dyn Job>,
    guard: Arc<Mutex<()>>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_fire = None;
    loop {
        let now = clock.now();
        let Some(next) = next_fire_after(trigger.as_ref(), now, last_fire) else {
            tracing::warn!(job = %name, "trigger has no upcoming fire time");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        tracing::debug!(job = %name, next = %next, "waiting for next run");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => return,
        }

        tracing::info!(job = %name, "scheduled job fired");
        last_fire = Some(next);
        run_guarded(&name, &job, &guard).await;
    }
}
