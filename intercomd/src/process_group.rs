//! `processGroupMessages` — the callback `GroupQueue` invokes when it is a
//! group's turn to run (SPEC_FULL.md §4.2).
//!
//! Implements the two-phase cursor commit: read pending messages since the
//! confirmed agent cursor, write a pending cursor, spawn the agent, stream
//! its output back through the channel, then promote or roll back the
//! cursor depending on the outcome.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use intercom_core::agent::{AgentInput, AgentOutput, AgentStatus};
use intercom_core::config::AgentConfig;
use intercom_core::store::{NewMessage, Store, now_iso};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::agent_runner::{self, OnOutput};
use crate::channel::Channel;
use crate::message_loop::{build_trigger_regex, format_messages};
use crate::queue::{GroupQueue, ProcessMessagesFn};
use crate::secrets::read_secrets;
use crate::workspace;

#[derive(Clone)]
pub struct ProcessGroupContext {
    pub store: Arc<Store>,
    pub queue: Arc<GroupQueue>,
    pub channel: Arc<dyn Channel>,
    pub agent_config: AgentConfig,
    pub idle_timeout_ms: u64,
    pub groups_dir: PathBuf,
    pub data_dir: PathBuf,
    pub assistant_name: String,
    pub main_group_folder: String,
}

/// Builds the `ProcessMessagesFn` closure `GroupQueue` invokes by chat JID.
pub fn build_process_messages_fn(ctx: ProcessGroupContext) -> ProcessMessagesFn {
    Arc::new(move |chat_jid: String| {
        let ctx = ctx.clone();
        Box::pin(async move {
            match process_group_messages(&chat_jid, &ctx).await {
                Ok(success) => success,
                Err(e) => {
                    error!(chat_jid = chat_jid.as_str(), err = %e, "process_group_messages failed");
                    false
                }
            }
        })
    })
}

async fn process_group_messages(chat_jid: &str, ctx: &ProcessGroupContext) -> anyhow::Result<bool> {
    let group = match ctx.store.get_registered_group(chat_jid).await? {
        Some(g) => g,
        None => return Ok(true), // unregistered chat, nothing to do
    };
    let is_main = group.folder == ctx.main_group_folder;

    // Step 1: read pending messages since the confirmed cursor.
    let confirmed = ctx.store.get_agent_cursor(chat_jid).await?.unwrap_or_default();
    let pending = ctx
        .store
        .get_messages_since(chat_jid, &confirmed, &ctx.assistant_name)
        .await?;
    if pending.is_empty() {
        return Ok(true);
    }

    // Step 2: trigger check for non-main groups.
    if !is_main && group.requires_trigger.unwrap_or(true) {
        let trigger = (!group.trigger.is_empty()).then_some(group.trigger.as_str());
        let re = build_trigger_regex(&ctx.assistant_name, trigger);
        if !pending.iter().any(|m| re.is_match(m.content.trim())) {
            return Ok(true);
        }
    }

    // Step 3: write pending cursor, format prompt.
    let new_cursor = pending
        .last()
        .map(|m| m.timestamp.clone())
        .unwrap_or_default();
    ctx.store.set_pending_cursor(chat_jid, &new_cursor).await?;
    let prompt = format_messages(&pending);

    info!(
        group = group.name.as_str(),
        message_count = pending.len(),
        "processing messages"
    );

    workspace::ensure_group_workspace(&ctx.groups_dir, &group.folder)?;
    workspace::ensure_ipc_dirs(&ctx.data_dir, &group.folder)?;
    refresh_snapshots(ctx, &group.folder).await;

    let session_id = ctx.store.get_session(&group.folder).await?;
    let secrets = read_secrets(&ctx.groups_dir.join(&group.folder).join(".env"))?;

    let input = AgentInput {
        prompt,
        session_id,
        group_folder: group.folder.clone(),
        chat_jid: chat_jid.to_string(),
        is_main,
        is_scheduled_task: None,
        assistant_name: Some(ctx.assistant_name.clone()),
        model: group.model.clone(),
        secrets: None,
    };

    let output_sent = Arc::new(AtomicBool::new(false));
    let on_output = build_on_output_callback(
        ctx.store.clone(),
        ctx.queue.clone(),
        ctx.channel.clone(),
        chat_jid.to_string(),
        group.folder.clone(),
        output_sent.clone(),
    );

    let workspace_dir = ctx.groups_dir.join(&group.folder);
    let ts_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let log_path = workspace::agent_log_path(&ctx.groups_dir, &group.folder, ts_millis);

    let queue = ctx.queue.clone();
    let group_jid = chat_jid.to_string();
    let group_folder_for_spawn = group.folder.clone();
    let on_spawn = move |child: Arc<AsyncMutex<tokio::process::Child>>| {
        let queue = queue.clone();
        let group_jid = group_jid.clone();
        let folder = group_folder_for_spawn.clone();
        tokio::spawn(async move {
            queue.register_process(&group_jid, child, Some(&folder)).await;
        });
    };

    let outcome = agent_runner::run_agent(
        input,
        secrets,
        workspace_dir,
        &ctx.agent_config,
        ctx.idle_timeout_ms,
        log_path,
        on_spawn,
        on_output,
    )
    .await;

    match outcome {
        Ok(outcome) => {
            if let Some(ref sid) = outcome.new_session_id {
                ctx.store.set_session(&group.folder, sid).await?;
            }

            if outcome.success {
                // Steps 5/6: promote on success, or on error-after-output.
                ctx.store.set_agent_cursor(chat_jid, &new_cursor).await?;
                ctx.store.clear_pending_cursor(chat_jid).await?;
                Ok(true)
            } else {
                // Step 7: error with no output — leave the confirmed cursor
                // untouched so the next attempt retries the same batch.
                ctx.store.clear_pending_cursor(chat_jid).await?;
                warn!(
                    group = group.name.as_str(),
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "agent run failed with no output, cursor not advanced"
                );
                Ok(false)
            }
        }
        Err(e) => {
            ctx.store.clear_pending_cursor(chat_jid).await?;
            error!(group = group.name.as_str(), err = %e, "agent runner error");
            Ok(false)
        }
    }
}

/// Refreshes the group's `current_tasks.json`/`available_groups.json` IPC
/// snapshot files immediately before dispatch (SPEC_FULL.md §6). Failure is
/// logged, not propagated — a stale or missing snapshot is the agent's
/// problem, never a reason to skip the run.
async fn refresh_snapshots(ctx: &ProcessGroupContext, group_folder: &str) {
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

fn build_on_output_callback(
    store: Arc<Store>,
    queue: Arc<GroupQueue>,
    channel: Arc<dyn Channel>,
    chat_jid: String,
    group_folder: String,
    output_sent: Arc<AtomicBool>,
) -> OnOutput {
    Arc::new(move |output: AgentOutput| {
        let store = store.clone();
        let queue = queue.clone();
        let channel = channel.clone();
        let chat_jid = chat_jid.clone();
        let group_folder = group_folder.clone();
        let output_sent = output_sent.clone();

        Box::pin(async move {
            if let Some(ref sid) = output.new_session_id {
                if let Err(e) = store.set_session(&group_folder, sid).await {
                    warn!(err = %e, "failed to persist session id");
                }
            }

            if let Some(ref result_text) = output.result {
                let text = strip_internal_blocks(result_text);
                if !text.is_empty() {
                    if let Err(e) = channel.send_message(&chat_jid, &text).await {
                        error!(err = %e, "failed to send agent output via channel");
                    } else {
                        output_sent.store(true, Ordering::SeqCst);
                    }

                    let bot_msg = NewMessage {
                        id: format!("bot-{}", now_iso()),
                        chat_jid: chat_jid.clone(),
                        sender: "bot".to_string(),
                        sender_name: group_folder.clone(),
                        content: text,
                        timestamp: now_iso(),
                        is_from_me: true,
                        is_bot_message: true,
                    };
                    if let Err(e) = store.store_message(&bot_msg).await {
                        warn!(err = %e, "failed to store bot response");
                    }
                }
            }

            if output.status == AgentStatus::Success {
                queue.notify_idle(&chat_jid).await;
            }
        })
    })
}

/// Strips `<internal>...</internal>` blocks from agent output before it is
/// ever shown to a user (SPEC_FULL.md §4.2 step 4a).
pub fn strip_internal_blocks(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("<internal>") {
        result.push_str(&rest[..start]);
        if let Some(end) = rest[start..].find("</internal>") {
            rest = &rest[start + end + "</internal>".len()..];
        } else {
            rest = "";
            break;
        }
    }
    result.push_str(rest);
    result.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_internal_basic() {
        let input = "Hello <internal>reasoning here</internal> World";
        assert_eq!(strip_internal_blocks(input), "Hello  World");
    }

    #[test]
    fn strip_internal_multiple() {
        let input = "A <internal>x</internal> B <internal>y</internal> C";
        assert_eq!(strip_internal_blocks(input), "A  B  C");
    }

    #[test]
    fn strip_internal_none() {
        assert_eq!(strip_internal_blocks("Hello World"), "Hello World");
    }

    #[test]
    fn strip_internal_unclosed() {
        let input = "Hello <internal>never closed";
        assert_eq!(strip_internal_blocks(input), "Hello");
    }

    #[test]
    fn strip_internal_multiline() {
        let input = "Before\n<internal>\nmulti\nline\n</internal>\nAfter";
        assert_eq!(strip_internal_blocks(input), "Before\n\nAfter");
    }

    #[tokio::test]
    async fn unregistered_group_is_a_no_op_success() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let queue = Arc::new(GroupQueue::new(5, std::env::temp_dir()));
        let ctx = ProcessGroupContext {
            store,
            queue,
            channel: Arc::new(NoopChannel),
            agent_config: AgentConfig {
                command: "true".to_string(),
                args: vec![],
                output_cap_bytes: 1024,
                timeout_ms: 1000,
                idle_grace_ms: 100,
            },
            idle_timeout_ms: 1000,
            groups_dir: std::env::temp_dir(),
            data_dir: std::env::temp_dir(),
            assistant_name: "Assistant".to_string(),
            main_group_folder: "main".to_string(),
        };
        let result = process_group_messages("tg:unregistered", &ctx).await.unwrap();
        assert!(result);
    }

    struct NoopChannel;

    #[async_trait::async_trait]
    impl Channel for NoopChannel {
        fn name(&self) -> &str {
            "noop"
        }
        fn is_enabled(&self) -> bool {
            true
        }
        fn owns_jid(&self, _jid: &str) -> bool {
            true
        }
        async fn connect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send_message(&self, _chat_jid: &str, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }
}
