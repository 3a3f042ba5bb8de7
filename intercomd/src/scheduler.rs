//! Cron/interval/once task scheduling loop (SPEC_FULL.md §4.6).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use intercom_core::store::{ScheduledTask, Store, now_iso};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// One due task, resolved and ready for dispatch.
#[derive(Debug, Clone)]
pub struct DueTask {
    pub id: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    pub context_mode: String,
}

impl From<ScheduledTask> for DueTask {
    fn from(t: ScheduledTask) -> Self {
        Self {
            id: t.id,
            group_folder: t.group_folder,
            chat_jid: t.chat_jid,
            prompt: t.prompt,
            schedule_type: t.schedule_type,
            schedule_value: t.schedule_value,
            context_mode: t.context_mode,
        }
    }
}

pub type TaskCallback = Arc<dyn Fn(DueTask) + Send + Sync>;

/// Computes the next run time for a task, or `None` if the schedule has no
/// further occurrences (a `once` task after it has already run, or an invalid
/// schedule value).
pub fn calculate_next_run(schedule_type: &str, schedule_value: &str, timezone: &str) -> Option<DateTime<Utc>> {
    match schedule_type {
        "interval" => {
            let ms: i64 = schedule_value.parse().ok()?;
            if ms <= 0 {
                return None;
            }
            Some(Utc::now() + chrono::Duration::milliseconds(ms))
        }
        "once" => DateTime::parse_from_rfc3339(schedule_value)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        "cron" => {
            let schedule = Schedule::from_str(schedule_value).ok()?;
            let tz: Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
            let now_in_tz = Utc::now().with_timezone(&tz);
            let next = schedule.after(&now_in_tz).next()?;
            Some(next.with_timezone(&Utc))
        }
        other => {
            warn!(schedule_type = other, "unknown schedule_type");
            None
        }
    }
}

/// Truncates a run result/error to a short human-readable summary for
/// `TaskRunLog`/`ScheduledTask.last_result`.
pub fn result_summary(result: Option<&str>, error: Option<&str>) -> String {
    const MAX_LEN: usize = 200;
    if let Some(err) = error {
        let mut s = format!("Error: {err}");
        s.truncate(MAX_LEN);
        return s;
    }
    match result {
        Some(r) if !r.is_empty() => {
            let mut s = r.to_string();
            s.truncate(MAX_LEN);
            s
        }
        _ => "Completed".to_string(),
    }
}

/// Runs the scheduler poll loop until `shutdown` fires. On every tick, fetches
/// due tasks, re-verifies each is still `active` immediately before dispatch
/// (closes the race against a concurrent `pause_task`/`cancel_task`), and
/// hands it to `on_due` via `try_mark_task_in_progress` so it cannot be
/// double-fired on the next tick.
pub async fn run_scheduler_loop(
    poll_interval: Duration,
    store: Arc<Store>,
    on_due: TaskCallback,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = poll_once(&store, &on_due).await {
                    error!(err = %e, "scheduler poll failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("scheduler loop shutting down");
                    break;
                }
            }
        }
    }
}

async fn poll_once(store: &Arc<Store>, on_due: &TaskCallback) -> anyhow::Result<()> {
    let due = store.get_due_tasks().await?;
    for task in due {
        let id = task.id.clone();
        // Re-verify immediately before dispatch: get_due_tasks already excludes
        // in_progress rows, but another tick or an IPC pause/cancel could have
        // raced between the query above and this line.
        if !store.try_mark_task_in_progress(&id).await? {
            debug!(task_id = id.as_str(), "task no longer active at dispatch time, skipping");
            continue;
        }
        debug!(task_id = id.as_str(), "dispatching due task");
        on_due(task.into());
    }
    Ok(())
}

pub fn now_iso_string() -> String {
    now_iso()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calculate_next_run_interval() {
        let next = calculate_next_run("interval", "60000", "UTC").unwrap();
        assert!(next > Utc::now());
    }

    #[test]
    fn calculate_next_run_once() {
        let next = calculate_next_run("once", "2099-01-01T00:00:00Z", "UTC").unwrap();
        assert_eq!(next.to_rfc3339(), "2099-01-01T00:00:00+00:00");
    }

    #[test]
    fn calculate_next_run_cron() {
        let next = calculate_next_run("cron", "0 0 * * * *", "UTC");
        assert!(next.is_some());
    }

    #[test]
    fn calculate_next_run_invalid_cron_returns_none() {
        assert!(calculate_next_run("cron", "not a cron expr", "UTC").is_none());
    }

    #[test]
    fn calculate_next_run_invalid_interval_returns_none() {
        assert!(calculate_next_run("interval", "not-a-number", "UTC").is_none());
        assert!(calculate_next_run("interval", "-5", "UTC").is_none());
    }

    #[test]
    fn calculate_next_run_unknown_type_returns_none() {
        assert!(calculate_next_run("bogus", "x", "UTC").is_none());
    }

    #[test]
    fn result_summary_error_takes_precedence() {
        let s = result_summary(Some("ok"), Some("boom"));
        assert_eq!(s, "Error: boom");
    }

    #[test]
    fn result_summary_truncates_long_result() {
        let long = "x".repeat(500);
        let s = result_summary(Some(&long), None);
        assert_eq!(s.len(), 200);
    }

    #[test]
    fn result_summary_default_when_empty() {
        assert_eq!(result_summary(None, None), "Completed");
        assert_eq!(result_summary(Some(""), None), "Completed");
    }

    #[test]
    fn result_summary_short_result_untouched() {
        assert_eq!(result_summary(Some("done"), None), "done");
    }

    #[tokio::test]
    async fn due_task_marked_in_progress_is_not_redispatched_same_tick() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let task = ScheduledTask {
            id: "t1".into(),
            group_folder: "main".into(),
            chat_jid: "tg:1".into(),
            prompt: "p".into(),
            schedule_type: "interval".into(),
            schedule_value: "60000".into(),
            context_mode: "isolated".into(),
            next_run: Some("2000-01-01T00:00:00.000Z".into()),
            last_run: None,
            last_result: None,
            status: intercom_core::store::TaskStatus::Active,
            created_at: now_iso(),
        };
        store.create_task(&task).await.unwrap();

        let dispatched = Arc::new(std::sync::Mutex::new(Vec::new()));
        let dispatched_clone = dispatched.clone();
        let callback: TaskCallback = Arc::new(move |t: DueTask| {
            dispatched_clone.lock().unwrap().push(t.id);
        });

        poll_once(&store, &callback).await.unwrap();
        poll_once(&store, &callback).await.unwrap();

        assert_eq!(dispatched.lock().unwrap().len(), 1);
    }
}
