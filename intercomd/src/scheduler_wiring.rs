//! Scheduler → GroupQueue wiring (SPEC_FULL.md §4.6).
//!
//! Builds the `TaskCallback` the scheduler loop invokes for each due task.
//! The callback enqueues a `TaskFn` into `GroupQueue` that resolves the
//! target group and session, runs the agent with the task's prompt, streams
//! output to the channel, logs the run, and advances `next_run`.

use std::sync::Arc;
use std::time::Instant;

use intercom_core::agent::{AgentInput, AgentOutput, AgentStatus};
use intercom_core::config::AgentConfig;
use intercom_core::store::{Store, TaskRunLog, now_iso};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::agent_runner::{self, OnOutput};
use crate::channel::Channel;
use crate::process_group::strip_internal_blocks;
use crate::queue::GroupQueue;
use crate::scheduler::{DueTask, TaskCallback, calculate_next_run, result_summary};
use crate::secrets::read_secrets;
use crate::workspace;

#[derive(Clone)]
pub struct SchedulerWiringContext {
    pub store: Arc<Store>,
    pub queue: Arc<GroupQueue>,
    pub channel: Arc<dyn Channel>,
    pub agent_config: AgentConfig,
    pub idle_timeout_ms: u64,
    pub groups_dir: std::path::PathBuf,
    pub data_dir: std::path::PathBuf,
    pub assistant_name: String,
    pub timezone: String,
}

/// Build the `TaskCallback` the scheduler loop invokes for each due task.
///
/// The callback captures all shared state and enqueues a `TaskFn` into the
/// `GroupQueue` for per-group serialized execution.
pub fn build_task_callback(ctx: SchedulerWiringContext) -> TaskCallback {
    Arc::new(move |task: DueTask| {
        let ctx = ctx.clone();
        let task_id = task.id.clone();
        let chat_jid = task.chat_jid.clone();
        let queue_for_enqueue = ctx.queue.clone();

        let task_fn = Box::new(move || -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
            Box::pin(async move { run_scheduled_task(task, &ctx).await })
        });

        // enqueue_task is async; spawn a small task to call it.
        tokio::spawn(async move {
            queue_for_enqueue.enqueue_task(&chat_jid, &task_id, task_fn).await;
        });
    })
}

async fn run_scheduled_task(task: DueTask, ctx: &SchedulerWiringContext) {
    let start = Instant::now();

    let group = match ctx.store.get_registered_group_by_folder(&task.group_folder).await {
        Ok(Some(g)) => g,
        Ok(None) => {
            error!(
                task_id = task.id.as_str(),
                group_folder = task.group_folder.as_str(),
                "scheduled task references unknown group folder"
            );
            log_and_update(&ctx.store, &task, start, None, Some("unknown group folder"), &ctx.timezone).await;
            return;
        }
        Err(e) => {
            error!(task_id = task.id.as_str(), err = %e, "failed to look up group for task");
            log_and_update(&ctx.store, &task, start, None, Some("store error resolving group"), &ctx.timezone).await;
            return;
        }
    };

    // Resolve session per context_mode: "group" reuses the group's live
    // session, "isolated" always starts fresh.
    let session_id = if task.context_mode == "group" {
        ctx.store.get_session(&task.group_folder).await.ok().flatten()
    } else {
        None
    };

    if let Err(e) = workspace::ensure_group_workspace(&ctx.groups_dir, &group.folder) {
        warn!(err = %e, "failed to ensure group workspace for scheduled task");
    }
    if let Err(e) = workspace::ensure_ipc_dirs(&ctx.data_dir, &group.folder) {
        warn!(err = %e, "failed to ensure ipc dirs for scheduled task");
    }
    refresh_snapshots(ctx, &group.folder).await;
    let secrets = read_secrets(&ctx.groups_dir.join(&group.folder).join(".env")).unwrap_or_default();

    let input = AgentInput {
        prompt: task.prompt.clone(),
        session_id,
        group_folder: task.group_folder.clone(),
        chat_jid: task.chat_jid.clone(),
        is_main: false,
        is_scheduled_task: Some(true),
        assistant_name: Some(ctx.assistant_name.clone()),
        model: group.model.clone(),
        secrets: None,
    };

    let result_text: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));
    let error_text: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));

    let store_cb = ctx.store.clone();
    let queue_cb = ctx.queue.clone();
    let channel_cb = ctx.channel.clone();
    let chat_jid_cb = task.chat_jid.clone();
    let group_folder_cb = task.group_folder.clone();
    let result_cb = result_text.clone();
    let error_cb = error_text.clone();

    let on_output: OnOutput = Arc::new(move |output: AgentOutput| {
        let store = store_cb.clone();
        let queue = queue_cb.clone();
        let channel = channel_cb.clone();
        let chat_jid = chat_jid_cb.clone();
        let group_folder = group_folder_cb.clone();
        let result_cb = result_cb.clone();
        let error_cb = error_cb.clone();

        Box::pin(async move {
            if let Some(ref sid) = output.new_session_id {
                if let Err(e) = store.set_session(&group_folder, sid).await {
                    warn!(err = %e, "failed to persist session");
                }
            }

            if let Some(ref text) = output.result {
                let stripped = strip_internal_blocks(text);
                if !stripped.is_empty() {
                    if let Err(e) = channel.send_message(&chat_jid, &stripped).await {
                        error!(err = %e, "failed to send task output via channel");
                    }
                    *result_cb.write().await = Some(stripped);
                }
            }

            if output.status == AgentStatus::Error {
                let err_msg = output.error.clone().unwrap_or_else(|| "unknown error".to_string());
                *error_cb.write().await = Some(err_msg);
            }

            if output.status == AgentStatus::Success {
                queue.notify_idle(&chat_jid).await;
            }
        })
    });

    let workspace_dir = ctx.groups_dir.join(&group.folder);
    let log_path = workspace::agent_log_path(
        &ctx.groups_dir,
        &group.folder,
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    );

    info!(task_id = task.id.as_str(), group = group.name.as_str(), "running scheduled task");

    let run_result = agent_runner::run_agent(
        input,
        secrets,
        workspace_dir,
        &ctx.agent_config,
        ctx.idle_timeout_ms,
        log_path,
        |_child| {},
        on_output,
    )
    .await;

    let result = result_text.read().await.clone();
    let error = error_text.read().await.clone();

    let (final_result, final_error) = match run_result {
        Ok(outcome) => {
            if outcome.success {
                (result, None)
            } else {
                (result, error.or(outcome.error))
            }
        }
        Err(e) => {
            error!(task_id = task.id.as_str(), err = %e, "scheduled agent run error");
            (result, Some(e.to_string()))
        }
    };

    log_and_update(&ctx.store, &task, start, final_result.as_deref(), final_error.as_deref(), &ctx.timezone).await;
}

/// Refreshes the group's `current_tasks.json`/`available_groups.json` IPC
/// snapshot files immediately before a scheduled run (SPEC_FULL.md §6).
/// Failure is logged, not propagated — a stale snapshot is the agent's
/// problem, never a reason to skip the run.
async fn refresh_snapshots(ctx: &SchedulerWiringContext, group_folder: &str) {
    let tasks = match ctx.store.get_tasks_for_group(group_folder).await {
        Ok(tasks) => tasks,
        Err(e) => {
            warn!(err = %e, "failed to load tasks for snapshot");
            Vec::new()
        }
    };
    let groups = match ctx.store.get_all_registered_groups().await {
        Ok(groups) => groups,
        Err(e) => {
            warn!(err = %e, "failed to load groups for snapshot");
            std::collections::HashMap::new()
        }
    };
    if let Err(e) = workspace::write_snapshots(&ctx.data_dir, group_folder, &tasks, &groups) {
        warn!(err = %e, "failed to write IPC snapshot files");
    }
}

async fn log_and_update(
    store: &Store,
    task: &DueTask,
    start: Instant,
    result: Option<&str>,
    error: Option<&str>,
    timezone: &str,
) {
    let duration_ms = start.elapsed().as_millis() as i64;
    let status = if error.is_some() { "error" } else { "success" };

    let log = TaskRunLog {
        task_id: task.id.clone(),
        run_at: now_iso(),
        duration_ms,
        status: status.to_string(),
        result: result.map(str::to_string),
        error: error.map(str::to_string),
    };
    if let Err(e) = store.log_task_run(&log).await {
        error!(task_id = task.id.as_str(), err = %e, "failed to log task run");
    }

    let next_run = calculate_next_run(&task.schedule_type, &task.schedule_value, timezone)
        .map(|dt| dt.to_rfc3339());
    let summary = result_summary(result, error);

    if let Err(e) = store.update_task_after_run(&task.id, next_run.as_deref(), &summary).await {
        error!(task_id = task.id.as_str(), err = %e, "failed to update task after run");
    }

    info!(
        task_id = task.id.as_str(),
        status,
        duration_ms,
        next_run = next_run.as_deref().unwrap_or("none"),
        "scheduled task completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_summary_delegates() {
        assert_eq!(result_summary(Some("ok"), None), "ok");
        assert_eq!(result_summary(None, Some("fail")), "Error: fail");
    }
}
