//! Cron-driven triggers for backup runs and liveness pings.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::parse_schedule;
use crate::notify::Notifier;
use crate::task::BackupTask;

/// Start the backup and liveness loops for one job.
pub fn spawn_job(task: Arc<BackupTask>, notifier: Arc<Notifier>) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let backup = parse_schedule(&task.job().schedule)?;
    let liveness = parse_schedule(&task.job().liveness)?;
    let id = task.id().to_string();

    info!(
        job = %id,
        schedule = %task.job().schedule,
        liveness = %task.job().liveness,
        next = ?next_after(&backup, &Local::now()),
        "Job scheduled"
    );

    let backup_loop = {
        let task = task.clone();
        tokio::spawn(run_schedule(format!("{}:backup", id), backup, move || {
            let task = task.clone();
            async move {
                // Runs may overlap when one outlasts the interval.
                tokio::spawn(async move {
                    task.run().await;
                });
            }
        }))
    };

    let liveness_loop = tokio::spawn(run_schedule(format!("{}:liveness", id), liveness, move || {
        let notifier = notifier.clone();
        let id = id.clone();
        async move {
            let text = format!(
                "live check report {}",
                Local::now().format("%Y-%m-%d %H:%M:%S")
            );
            notifier.notice_text(&id, &text).await;
        }
    }));

    Ok(vec![backup_loop, liveness_loop])
}

/// Call `fire` at every instant produced by `schedule`, forever.
pub async fn run_schedule<F, Fut>(name: String, schedule: Schedule, mut fire: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut after = Local::now();
    loop {
        let Some(next) = next_after(&schedule, &after) else {
            warn!(schedule = %name, "Schedule has no upcoming instants, stopping");
            return;
        };
        let wait = delay_until(&next, &Local::now());
        debug!(schedule = %name, next = %next, wait_secs = wait.as_secs(), "Waiting for next run");
        tokio::time::sleep(wait).await;

        fire().await;
        after = next.max(Local::now());
    }
}

pub fn next_after(schedule: &Schedule, after: &DateTime<Local>) -> Option<DateTime<Local>> {
    schedule.after(after).next()
}

fn delay_until(next: &DateTime<Local>, now: &DateTime<Local>) -> Duration {
    (*next - *now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_next_after_daily_schedule() {
        let schedule = parse_schedule("0 25 0 * * ?").unwrap();
        let start = Local.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let next = next_after(&schedule, &start).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (0, 25, 0));
        assert_eq!(next.date_naive(), start.date_naive());

        let following = next_after(&schedule, &next).unwrap();
        assert_eq!(following.date_naive(), start.date_naive().succ_opt().unwrap());
    }

    #[test]
    fn test_delay_until_never_negative() {
        let now = Local.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        assert_eq!(delay_until(&(now + chrono::Duration::seconds(90)), &now), Duration::from_secs(90));
        assert_eq!(delay_until(&(now - chrono::Duration::seconds(5)), &now), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_run_schedule_fires_each_second() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let schedule = parse_schedule("* * * * * *").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = tokio::spawn(run_schedule("test".to_string(), schedule, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.abort();
        let fired = count.load(Ordering::SeqCst);
        assert!((1..=3).contains(&fired), "fired {} times", fired);
    }
}
