//! Scheduled module runs.
//!
//! A task names a registered module, the device it acts for, and a schedule.
//! When a task comes due the scheduler builds an empty `rori/command`
//! interaction from that device and the task's parameters, then runs the module
//! through `Router::run_module`. It uses the same loader, the same isolation and
//! the same timeout as a dispatched interaction. All times are UTC.
//!
//! Schedules come in two shapes:
//! - interval: every `days` (a count) plus `hours`/`minutes`/`seconds`,
//!   optionally anchored to a time of day with `at`; no fields at all means daily
//! - calendar: on one weekday or on `Weekday` (Monday to Friday), at `at`
//!   (midnight when unset) shifted by `hours`/`minutes`/`seconds`

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDateTime, NaiveTime, TimeDelta, Utc, Weekday};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::error::{DatabaseError, ModuleError, ScheduleError};
use crate::interaction::{COMMAND_DATATYPE, Interaction};
use crate::router::{Outcome, Router};
use crate::store::{IdentityStore, TaskStore};

/// Parameter key naming the device a task acts for.
pub const RING_ID_KEY: &str = "ring_id";

/// Parameter key naming the user that device must belong to.
pub const USERNAME_KEY: &str = "username";

/// Day component of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DaySpec {
    #[default]
    Unset,
    /// Every `n` days.
    Every(u32),
    /// One weekday.
    On(Weekday),
    /// Monday to Friday.
    Weekdays,
}

impl DaySpec {
    /// Parse the stored form: empty, a day count, a weekday name, or `Weekday`.
    pub fn parse(raw: &str) -> Result<Self, ScheduleError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::Unset);
        }
        if raw.eq_ignore_ascii_case("weekday") {
            return Ok(Self::Weekdays);
        }
        if let Ok(days) = raw.parse::<u32>() {
            if days == 0 {
                return Err(ScheduleError::InvalidField {
                    field: "days",
                    reason: "day interval must be positive".to_string(),
                });
            }
            return Ok(Self::Every(days));
        }
        raw.parse::<Weekday>()
            .map(Self::On)
            .map_err(|_| ScheduleError::InvalidField {
                field: "days",
                reason: format!("{raw:?} is not a day count, a weekday or \"Weekday\""),
            })
    }

    fn is_calendar(&self) -> bool {
        matches!(self, Self::On(_) | Self::Weekdays)
    }

    fn includes(&self, day: Weekday) -> bool {
        match self {
            Self::On(wanted) => *wanted == day,
            Self::Weekdays => !matches!(day, Weekday::Sat | Weekday::Sun),
            Self::Unset | Self::Every(_) => true,
        }
    }
}

impl fmt::Display for DaySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => Ok(()),
            Self::Every(days) => write!(f, "{days}"),
            Self::Weekdays => f.write_str("Weekday"),
            Self::On(day) => f.write_str(match day {
                Weekday::Mon => "Monday",
                Weekday::Tue => "Tuesday",
                Weekday::Wed => "Wednesday",
                Weekday::Thu => "Thursday",
                Weekday::Fri => "Friday",
                Weekday::Sat => "Saturday",
                Weekday::Sun => "Sunday",
            }),
        }
    }
}

/// Parse the stored `at` column: empty, `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(raw: &str) -> Result<Option<NaiveTime>, ScheduleError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map(Some)
        .map_err(|e| ScheduleError::InvalidField {
            field: "at",
            reason: format!("{raw:?}: {e}"),
        })
}

/// A persisted schedule entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    /// Row id; 0 until stored.
    pub id: i64,
    /// Registry name of the module to run.
    pub module: String,
    /// Handed to the module as interaction metadata. Must hold `ring_id` and `username`.
    pub parameter: HashMap<String, String>,
    pub at: Option<NaiveTime>,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub days: DaySpec,
    /// One-shot tasks are deleted after their run.
    pub repeat: bool,
}

impl ScheduledTask {
    /// A daily repeating task running `module` for `device`, which belongs to `username`.
    pub fn new(
        module: impl Into<String>,
        device: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        let parameter = HashMap::from([
            (RING_ID_KEY.to_string(), device.into()),
            (USERNAME_KEY.to_string(), username.into()),
        ]);
        Self {
            id: 0,
            module: module.into(),
            parameter,
            at: None,
            hours: 0,
            minutes: 0,
            seconds: 0,
            days: DaySpec::Unset,
            repeat: true,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameter.insert(key.into(), value.into());
        self
    }

    pub fn every(mut self, hours: u32, minutes: u32, seconds: u32) -> Self {
        self.hours = hours;
        self.minutes = minutes;
        self.seconds = seconds;
        self
    }

    pub fn on(mut self, days: DaySpec) -> Self {
        self.days = days;
        self
    }

    pub fn at(mut self, time: NaiveTime) -> Self {
        self.at = Some(time);
        self
    }

    pub fn once(mut self) -> Self {
        self.repeat = false;
        self
    }

    pub fn device(&self) -> Option<&str> {
        self.param(RING_ID_KEY)
    }

    pub fn username(&self) -> Option<&str> {
        self.param(USERNAME_KEY)
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.parameter
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    fn offset(&self) -> TimeDelta {
        TimeDelta::hours(self.hours as i64)
            + TimeDelta::minutes(self.minutes as i64)
            + TimeDelta::seconds(self.seconds as i64)
    }

    /// Gap between interval runs. Never zero.
    fn period(&self) -> TimeDelta {
        let days = match self.days {
            DaySpec::Every(days) => TimeDelta::days(days as i64),
            _ => TimeDelta::zero(),
        };
        let period = days + self.offset();
        if period.is_zero() {
            TimeDelta::days(1)
        } else {
            period
        }
    }

    /// First run strictly after `now`.
    pub fn first_run(&self, now: NaiveDateTime) -> NaiveDateTime {
        if self.days.is_calendar() {
            return self.calendar_run_after(now);
        }
        match self.at {
            Some(at) => {
                let today = now.date().and_time(at);
                if today > now {
                    today
                } else {
                    today + TimeDelta::days(1)
                }
            }
            None => now + self.period(),
        }
    }

    /// Run following the one due at `previous`, skipping any that fell at or before `now`.
    pub fn next_run(&self, previous: NaiveDateTime, now: NaiveDateTime) -> NaiveDateTime {
        if self.days.is_calendar() {
            return self.calendar_run_after(previous.max(now));
        }

        let period = self.period();
        let next = previous + period;
        if next > now {
            return next;
        }
        let step = period.num_seconds().max(1);
        let missed = (now - next).num_seconds() / step + 1;
        next + TimeDelta::seconds(missed * step)
    }

    fn calendar_run_after(&self, after: NaiveDateTime) -> NaiveDateTime {
        let (time, _) = self
            .at
            .unwrap_or_default()
            .overflowing_add_signed(self.offset());

        let mut day = after.date();
        for _ in 0..8 {
            if self.days.includes(day.weekday()) {
                let candidate = day.and_time(time);
                if candidate > after {
                    return candidate;
                }
            }
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        after + TimeDelta::weeks(1)
    }
}

/// One scheduled run.
#[derive(Debug)]
pub struct TaskRun {
    pub task_id: i64,
    pub module: String,
    /// When the run was due.
    pub due: NaiveDateTime,
    pub outcome: Outcome,
}

struct Plan {
    task: ScheduledTask,
    next: NaiveDateTime,
}

/// Runs stored tasks when they come due.
pub struct Scheduler {
    tasks: Arc<dyn TaskStore>,
    identities: Arc<dyn IdentityStore>,
    router: Arc<Router>,
    plans: Mutex<HashMap<i64, Plan>>,
}

impl Scheduler {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        identities: Arc<dyn IdentityStore>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            tasks,
            identities,
            router,
            plans: Mutex::new(HashMap::new()),
        }
    }

    /// Sync the plan with the store. Tasks naming an unknown module, missing a
    /// parameter or acting for an unlinked device are deleted. Unchanged tasks
    /// keep their next run. Returns the number of planned tasks.
    pub async fn refresh(&self, now: NaiveDateTime) -> Result<usize, DatabaseError> {
        let stored = self.tasks.list_tasks().await?;

        let mut valid = Vec::with_capacity(stored.len());
        for task in stored {
            match self.check(&task).await {
                Ok(()) => valid.push(task),
                Err(ScheduleError::Persistence(e)) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        task = task.id,
                        module = %task.module,
                        error = %e,
                        "Removing invalid scheduled task"
                    );
                    self.tasks.remove_task(task.id).await?;
                }
            }
        }

        let mut plans = self.plans.lock().await;
        let mut refreshed = HashMap::with_capacity(valid.len());
        for task in valid {
            let next = match plans.remove(&task.id) {
                Some(plan) if plan.task == task => plan.next,
                _ => {
                    let next = task.first_run(now);
                    tracing::debug!(
                        task = task.id,
                        module = %task.module,
                        next = %next,
                        "Task planned"
                    );
                    next
                }
            };
            refreshed.insert(task.id, Plan { task, next });
        }
        *plans = refreshed;
        Ok(plans.len())
    }

    async fn check(&self, task: &ScheduledTask) -> Result<(), ScheduleError> {
        if self.router.registry().get(&task.module).await.is_none() {
            return Err(ScheduleError::UnknownModule {
                task: task.id,
                module: task.module.clone(),
            });
        }
        let device = task.device().ok_or(ScheduleError::MissingParameter {
            task: task.id,
            key: RING_ID_KEY,
        })?;
        let username = task.username().ok_or(ScheduleError::MissingParameter {
            task: task.id,
            key: USERNAME_KEY,
        })?;
        if self.identities.resolve_username(device).await?.as_deref() != Some(username) {
            return Err(ScheduleError::UnknownDevice {
                task: task.id,
                device: device.to_string(),
                username: username.to_string(),
            });
        }
        Ok(())
    }

    /// When the task runs next, if planned.
    pub async fn next_run(&self, task_id: i64) -> Option<NaiveDateTime> {
        self.plans.lock().await.get(&task_id).map(|plan| plan.next)
    }

    /// Run every task due at `now`, earliest first. Tasks whose module is
    /// disabled are skipped: a repeating one moves on to its next run, a one-shot
    /// one waits for the module to come back.
    pub async fn run_due(&self, now: NaiveDateTime) -> Vec<TaskRun> {
        let mut due: Vec<(ScheduledTask, NaiveDateTime)> = self
            .plans
            .lock()
            .await
            .values()
            .filter(|plan| plan.next <= now)
            .map(|plan| (plan.task.clone(), plan.next))
            .collect();
        due.sort_by_key(|(task, next)| (*next, task.id));

        let mut runs = Vec::with_capacity(due.len());
        for (task, due_at) in due {
            let outcome = self.fire(&task, due_at).await;

            if task.repeat {
                let next = task.next_run(due_at, now);
                if let Some(plan) = self.plans.lock().await.get_mut(&task.id) {
                    plan.next = next;
                }
            } else if outcome.is_some() {
                self.plans.lock().await.remove(&task.id);
                match self.tasks.remove_task(task.id).await {
                    Ok(_) => tracing::debug!(task = task.id, "One-shot task consumed"),
                    Err(e) => {
                        tracing::warn!(task = task.id, error = %e, "Failed to delete one-shot task")
                    }
                }
            }

            if let Some(outcome) = outcome {
                runs.push(TaskRun {
                    task_id: task.id,
                    module: task.module,
                    due: due_at,
                    outcome,
                });
            }
        }
        runs
    }

    /// Run the task's module once. `None` when the module is disabled.
    async fn fire(&self, task: &ScheduledTask, due: NaiveDateTime) -> Option<Outcome> {
        let Some(descriptor) = self.router.registry().get(&task.module).await else {
            return Some(Outcome::Failed(ModuleError::Resolution {
                location: task.module.clone(),
                reason: "module is no longer registered".to_string(),
            }));
        };
        if !descriptor.enabled {
            tracing::debug!(task = task.id, module = %task.module, "Module disabled, run skipped");
            return None;
        }

        let device = task.device().unwrap_or_default();
        let interaction = Interaction::new(device, "", due.and_utc().fixed_offset())
            .with_datatype(COMMAND_DATATYPE)
            .with_metadatas(task.parameter.clone());

        let started = std::time::Instant::now();
        let outcome = self.router.run_module(&descriptor, &interaction).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Outcome::Failed(e) => {
                tracing::warn!(
                    task = task.id,
                    module = %task.module,
                    elapsed_ms,
                    error = %e,
                    "Scheduled run failed"
                );
            }
            _ => {
                tracing::info!(
                    task = task.id,
                    module = %task.module,
                    elapsed_ms,
                    "Scheduled run complete"
                );
            }
        }
        Some(outcome)
    }
}

/// Spawn the background ticker: each tick re-reads the task table and runs what is due.
pub fn spawn_ticker(scheduler: Arc<Scheduler>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let now = Utc::now().naive_utc();
            if let Err(e) = scheduler.refresh(now).await {
                tracing::error!(error = %e, "Failed to load scheduled tasks");
                continue;
            }
            scheduler.run_due(now).await;
        }
    })
}
