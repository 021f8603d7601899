//! Cron-driven repetition of the backup pipeline.
//!
//! Each tick runs in its own task: a failed or panicking tick is logged and
//! the schedule keeps going. Ticks that would overlap a still-running backup
//! are refused by the shared [`RunRegistry`] and skipped.

use std::collections::BTreeSet;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use cron::Schedule;
use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::BackupError;
use crate::pipeline::{BackupReport, CancelSignal, Pipeline, RunRegistry};

/// How long shutdown waits for an in-flight run to reach a step boundary
/// before aborting it.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub type JobFuture = BoxFuture<'static, Result<BackupReport, BackupError>>;

/// One scheduled unit of work.
pub type Job = Arc<dyn Fn(CancelSignal) -> JobFuture + Send + Sync>;

/// Parse `backup.schedule`.
///
/// Classic 5-field expressions (`min hour dom mon dow`) fire at second 0 and
/// number weekdays 0-7 with Sunday as both 0 and 7. 6- and 7-field
/// expressions (leading seconds, optional trailing year) are taken as-is and
/// number weekdays 1-7 from Sunday.
pub fn parse_schedule(expr: &str) -> Result<Schedule, BackupError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(BackupError::config("backup.schedule is not set"));
    }
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.as_slice() {
        [minute, hour, dom, month, dow] => {
            let dow = classic_day_of_week(dow)
                .map_err(|e| BackupError::config(format!("invalid backup.schedule '{expr}': {e}")))?;
            format!("0 {minute} {hour} {dom} {month} {dow}")
        }
        [_, _, _, _, _, _] | [_, _, _, _, _, _, _] => expr.to_string(),
        _ => {
            return Err(BackupError::config(format!(
                "invalid backup.schedule '{expr}': expected 5, 6 or 7 fields, got {}",
                fields.len()
            )));
        }
    };
    Schedule::from_str(&normalized)
        .map_err(|e| BackupError::config(format!("invalid backup.schedule '{expr}': {e}")))
}

/// Rewrite a 0-7 weekday field as the explicit 1-7 list the cron parser uses.
/// Day names are left for the parser.
fn classic_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }
    let mut named = Vec::new();
    let mut days = BTreeSet::new();
    for part in field.split(',') {
        if part.chars().any(|c| c.is_ascii_alphabetic()) {
            named.push(part.to_string());
            continue;
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("bad day-of-week step in '{part}'"))?;
                if step == 0 {
                    return Err(format!("day-of-week step must be positive in '{part}'"));
                }
                (range, Some(step))
            }
            None => (part, None),
        };
        let (first, last) = if range == "*" {
            (0, 6)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (weekday(lo, part)?, weekday(hi, part)?)
        } else {
            let day = weekday(range, part)?;
            (day, if step.is_some() { 6 } else { day })
        };
        if first > last {
            return Err(format!("day-of-week range '{part}' runs backwards"));
        }
        days.extend((first..=last).step_by(step.unwrap_or(1)).map(|day| day % 7 + 1));
    }
    named.extend(days.iter().map(ToString::to_string));
    Ok(named.join(","))
}

fn weekday(text: &str, part: &str) -> Result<u8, String> {
    match text.parse::<u8>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("day of week must be 0-7 in '{part}'")),
    }
}

#[derive(Clone)]
pub struct Scheduler {
    schedule: Schedule,
    job: Job,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("schedule", &self.schedule.to_string())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(schedule: Schedule, job: Job) -> Self {
        Self { schedule, job }
    }

    /// Run the configured backup pipeline on `backup.schedule`. Providers are
    /// rebuilt for every tick.
    pub fn from_config(config: AppConfig) -> Result<Self, BackupError> {
        let schedule = parse_schedule(&config.backup.schedule)?;
        // Fail before the first tick if the providers cannot be built at all.
        Pipeline::new(&config)?;

        let config = Arc::new(config);
        let registry = RunRegistry::new();
        let job: Job = Arc::new(move |cancel: CancelSignal| -> JobFuture {
            let config = Arc::clone(&config);
            let registry = registry.clone();
            Box::pin(async move {
                let mut pipeline = Pipeline::new(&config)?
                    .with_registry(registry)
                    .with_cancel(cancel);
                pipeline.run_backup().await
            })
        });
        Ok(Self::new(schedule, job))
    }

    pub fn next_after(&self, after: &DateTime<Local>) -> Option<DateTime<Local>> {
        self.schedule.after(after).next()
    }

    /// Fire the job on every tick until `shutdown` resolves, then cancel any
    /// in-flight run and wait up to [`SHUTDOWN_GRACE`] for it.
    pub async fn run<S>(&self, shutdown: S) -> Result<(), BackupError>
    where
        S: Future<Output = ()>,
    {
        self.run_with_grace(shutdown, SHUTDOWN_GRACE).await
    }

    pub async fn run_with_grace<S>(&self, shutdown: S, grace: Duration) -> Result<(), BackupError>
    where
        S: Future<Output = ()>,
    {
        let (cancel_handle, cancel) = CancelSignal::new();
        let mut ticks: JoinSet<()> = JoinSet::new();
        tokio::pin!(shutdown);

        info!(schedule = %self.schedule, "backup scheduler started");
        loop {
            let now = Local::now();
            let Some(next) = self.next_after(&now) else {
                warn!("schedule has no upcoming fire times; stopping");
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(next = %next.to_rfc3339(), "next backup scheduled");

            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                () = tokio::time::sleep(wait) => {}
            }

            while let Some(done) = ticks.try_join_next() {
                log_join(done);
            }
            info!("running scheduled backup");
            ticks.spawn(run_tick(Arc::clone(&self.job), cancel.clone()));
        }

        cancel_handle.cancel();
        if !ticks.is_empty() {
            info!(in_flight = ticks.len(), "waiting for in-flight backup to stop");
            let drained = tokio::time::timeout(grace, async {
                while let Some(done) = ticks.join_next().await {
                    log_join(done);
                }
            })
            .await;
            if drained.is_err() {
                warn!(grace = ?grace, "in-flight backup did not stop in time; aborting it");
                ticks.shutdown().await;
            }
        }
        info!("backup scheduler stopped");
        Ok(())
    }
}

async fn run_tick(job: Job, cancel: CancelSignal) {
    match job(cancel).await {
        Ok(report) => {
            info!(key = %report.remote_key, location = %report.location, elapsed = ?report.elapsed, "scheduled backup succeeded");
        }
        Err(BackupError::RunInProgress { run_id }) => {
            warn!(%run_id, "previous backup still running; skipping this tick");
        }
        Err(BackupError::Cancelled { step }) => {
            info!(step, "scheduled backup cancelled");
        }
        Err(e) => {
            error!(step = e.step(), error = %e, "scheduled backup failed");
        }
    }
}

fn log_join(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done
        && e.is_panic()
    {
        error!(error = %e, "scheduled backup panicked; schedule continues");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{Datelike, TimeZone, Weekday};

    use super::*;
    use crate::pipeline::PipelineState;

    #[test]
    fn five_field_expressions_fire_at_second_zero() -> anyhow::Result<()> {
        let schedule = parse_schedule("30 3 * * *")?;
        let start = Local
            .with_ymd_and_hms(2024, 1, 2, 0, 0, 0)
            .single()
            .ok_or_else(|| anyhow::anyhow!("ambiguous local time"))?;
        let next = schedule
            .after(&start)
            .next()
            .ok_or_else(|| anyhow::anyhow!("no upcoming time"))?;
        assert_eq!(next.format("%H:%M:%S").to_string(), "03:30:00");
        Ok(())
    }

    fn fire_days(expr: &str, count: usize) -> anyhow::Result<Vec<Weekday>> {
        let schedule = parse_schedule(expr)?;
        // 2024-01-01 is a Monday.
        let start = Local
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| anyhow::anyhow!("ambiguous local time"))?;
        Ok(schedule.after(&start).take(count).map(|at| at.weekday()).collect())
    }

    #[test]
    fn five_field_weekday_range_counts_from_sunday_zero() -> anyhow::Result<()> {
        use Weekday::{Fri, Mon, Thu, Tue, Wed};
        assert_eq!(fire_days("0 2 * * 1-5", 7)?, [Mon, Tue, Wed, Thu, Fri, Mon, Tue]);
        Ok(())
    }

    #[test]
    fn five_field_sunday_is_zero_or_seven() -> anyhow::Result<()> {
        assert_eq!(fire_days("0 3 * * 0", 2)?, [Weekday::Sun, Weekday::Sun]);
        assert_eq!(fire_days("0 3 * * 7", 2)?, [Weekday::Sun, Weekday::Sun]);
        assert_eq!(fire_days("0 3 * * 5-7", 3)?, [Weekday::Fri, Weekday::Sat, Weekday::Sun]);
        Ok(())
    }

    #[test]
    fn five_field_weekday_steps_and_names() -> anyhow::Result<()> {
        use Weekday::{Fri, Mon, Sat, Sun, Thu, Tue, Wed};
        assert_eq!(fire_days("0 3 * * */2", 4)?, [Tue, Thu, Sat, Sun]);
        assert_eq!(fire_days("0 3 * * 1,3,5", 3)?, [Mon, Wed, Fri]);
        assert_eq!(fire_days("0 3 * * Mon-Fri", 5)?, [Mon, Tue, Wed, Thu, Fri]);
        Ok(())
    }

    #[test]
    fn classic_weekday_field_is_rewritten() {
        assert_eq!(classic_day_of_week("*").as_deref(), Ok("*"));
        assert_eq!(classic_day_of_week("1-5").as_deref(), Ok("2,3,4,5,6"));
        assert_eq!(classic_day_of_week("0,7").as_deref(), Ok("1"));
        assert_eq!(classic_day_of_week("1/3").as_deref(), Ok("2,5"));
        assert!(classic_day_of_week("8").is_err());
        assert!(classic_day_of_week("5-1").is_err());
        assert!(classic_day_of_week("*/0").is_err());
    }

    #[test]
    fn six_and_seven_field_expressions_are_accepted() {
        assert!(parse_schedule("*/10 * * * * *").is_ok());
        assert!(parse_schedule("0 0 3 * * * 2099").is_ok());
    }

    #[test]
    fn invalid_or_missing_schedule_is_config_error() {
        for expr in ["", "   ", "every day", "61 * * * *", "* * *", "0 3 * * 8"] {
            assert!(
                matches!(parse_schedule(expr), Err(BackupError::Config(_))),
                "{expr:?} should be rejected"
            );
        }
    }

    #[test]
    fn from_config_requires_a_schedule() {
        let mut config = AppConfig::default();
        config.database.kind = "sqlite".into();
        config.database.dbname = "app.db".into();
        config.storage.kind = "local".into();
        assert!(matches!(Scheduler::from_config(config), Err(BackupError::Config(_))));
    }

    fn counting_job(counter: Arc<AtomicUsize>, outcome: fn() -> Result<BackupReport, BackupError>) -> Job {
        Arc::new(move |_cancel: CancelSignal| -> JobFuture {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                outcome()
            })
        })
    }

    fn failing() -> Result<BackupReport, BackupError> {
        Err(BackupError::Dump(anyhow::anyhow!("pg_dump: connection refused")))
    }

    fn succeeding() -> Result<BackupReport, BackupError> {
        Ok(BackupReport {
            remote_key: "orders.sql".into(),
            location: "/backups/orders.sql".into(),
            bytes: 1,
            compressed: false,
            elapsed: Duration::from_millis(5),
            state: PipelineState::Done,
        })
    }

    #[tokio::test]
    async fn failed_ticks_do_not_stop_the_schedule() -> anyhow::Result<()> {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(parse_schedule("* * * * * *")?, counting_job(Arc::clone(&counter), failing));

        scheduler
            .run_with_grace(tokio::time::sleep(Duration::from_millis(2500)), Duration::from_secs(1))
            .await?;
        assert!(counter.load(Ordering::SeqCst) >= 2, "ticks: {}", counter.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_before_first_tick_runs_nothing() -> anyhow::Result<()> {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(
            parse_schedule("0 0 0 1 1 * 2099")?,
            counting_job(Arc::clone(&counter), succeeding),
        );
        scheduler.run(async {}).await?;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_run() -> anyhow::Result<()> {
        let observed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&observed);
        let job: Job = Arc::new(move |cancel: CancelSignal| -> JobFuture {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                while !cancel.is_cancelled() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                seen.fetch_add(1, Ordering::SeqCst);
                Err(BackupError::Cancelled { step: "upload" })
            })
        });
        let scheduler = Scheduler::new(parse_schedule("* * * * * *")?, job);

        scheduler
            .run_with_grace(tokio::time::sleep(Duration::from_millis(1500)), Duration::from_secs(5))
            .await?;
        assert!(observed.load(Ordering::SeqCst) >= 1);
        Ok(())
    }
}
