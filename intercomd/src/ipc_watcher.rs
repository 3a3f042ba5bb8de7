//! Filesystem-based IPC watcher for intercomd.
//!
//! Polls `{ipc_base}/{group}/{messages,tasks}/` directories. Processes files
//! atomically (read → act → unlink), moving failures to an `errors/`
//! directory for debugging. Authorization is always derived from the
//! directory a file was found in, never from a field inside the file itself
//! (SPEC_FULL.md §4.5).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use intercom_core::ipc::{is_valid_folder_name, is_valid_group_name, is_valid_jid};
use intercom_core::store::{RegisteredGroup, Store, TaskUpdate, now_iso};
use intercom_core::{IpcGroupContext, IpcMessage, IpcTask};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::Channel;

/// Distinguishes why a task payload was rejected, so the caller can decide
/// whether the file is bad evidence (quarantine) or the store had a transient
/// hiccup (leave in place for the next poll tick to retry).
#[derive(Debug, thiserror::Error)]
pub enum TaskDispatchError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct IpcWatcherConfig {
    pub ipc_base_dir: PathBuf,
    pub poll_interval: Duration,
    pub main_group_folder: String,
}

pub struct IpcWatcher {
    config: IpcWatcherConfig,
    store: Arc<Store>,
    channel: Arc<dyn Channel>,
}

impl IpcWatcher {
    pub fn new(config: IpcWatcherConfig, store: Arc<Store>, channel: Arc<dyn Channel>) -> Self {
        Self {
            config,
            store,
            channel,
        }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        fs::create_dir_all(&self.config.ipc_base_dir).ok();
        info!(dir = %self.config.ipc_base_dir.display(), "IPC watcher started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("IPC watcher shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Runs the poll loop's `errors/` cleanup: deletes quarantined files older
    /// than `max_age` and warns when the directory holds more than
    /// `warn_threshold` entries (SPEC_FULL.md §4.4 "Cleanup").
    pub fn sweep_errors_dir(&self, max_age: Duration, warn_threshold: usize) {
        let error_dir = self.config.ipc_base_dir.join("errors");
        let entries = match fs::read_dir(&error_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let mut remaining = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok());
            match age {
                Some(age) if age > max_age => {
                    if let Err(err) = fs::remove_file(&path) {
                        warn!(path = %path.display(), err = %err, "failed to remove stale error file");
                    }
                }
                _ => remaining += 1,
            }
        }

        if remaining > warn_threshold {
            warn!(count = remaining, "ipc errors/ directory exceeds expected size");
        }
    }

    async fn poll_once(&self) {
        let group_folders = match fs::read_dir(&self.config.ipc_base_dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|entry| {
                    entry.file_type().is_ok_and(|ft| ft.is_dir())
                        && entry.file_name() != "errors"
                })
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
            Err(err) => {
                debug!(err = %err, "IPC base directory not readable");
                return;
            }
        };

        for group_folder in group_folders {
            let ctx = IpcGroupContext::new(&group_folder, &self.config.main_group_folder);
            let group_dir = self.config.ipc_base_dir.join(&group_folder);

            self.process_messages(&group_dir, &ctx).await;
            self.process_tasks(&group_dir, &ctx).await;
        }
    }

    async fn process_messages(&self, group_dir: &Path, ctx: &IpcGroupContext) {
        let messages_dir = group_dir.join("messages");
        let files = match read_json_files(&messages_dir) {
            Some(files) => files,
            None => return,
        };

        for file_path in files {
            match read_and_parse::<IpcMessage>(&file_path) {
                Ok(msg) => {
                    if msg.msg_type != "message" || msg.chat_jid.is_empty() || msg.text.is_empty()
                    {
                        warn!(path = %file_path.display(), "invalid IPC message, missing fields");
                        move_to_errors(&self.config.ipc_base_dir, &file_path, &ctx.group_folder);
                        continue;
                    }

                    if self.is_authorized_target(&msg.chat_jid, ctx).await {
                        if let Err(e) = self.channel.send_message(&msg.chat_jid, &msg.text).await {
                            error!(err = %e, chat_jid = %msg.chat_jid, "failed to dispatch IPC message");
                        } else {
                            debug!(
                                chat_jid = %msg.chat_jid,
                                group = %ctx.group_folder,
                                "IPC message dispatched"
                            );
                        }
                    } else {
                        warn!(
                            chat_jid = %msg.chat_jid,
                            group = %ctx.group_folder,
                            "unauthorized IPC message attempt blocked"
                        );
                    }

                    remove_file(&file_path);
                }
                Err(err) => {
                    error!(path = %file_path.display(), err = %err, "failed to parse IPC message");
                    move_to_errors(&self.config.ipc_base_dir, &file_path, &ctx.group_folder);
                }
            }
        }
    }

    async fn process_tasks(&self, group_dir: &Path, ctx: &IpcGroupContext) {
        let tasks_dir = group_dir.join("tasks");
        let files = match read_json_files(&tasks_dir) {
            Some(files) => files,
            None => return,
        };

        for file_path in files {
            match read_and_parse::<IpcTask>(&file_path) {
                Ok(task) => match self.dispatch_task(task, ctx).await {
                    Ok(()) => remove_file(&file_path),
                    Err(e @ (TaskDispatchError::Unauthorized(_)
                    | TaskDispatchError::InvalidPayload(_)
                    | TaskDispatchError::NotFound(_))) => {
                        warn!(err = %e, group = %ctx.group_folder, "task dispatch rejected, quarantining");
                        move_to_errors(&self.config.ipc_base_dir, &file_path, &ctx.group_folder);
                    }
                    Err(e @ TaskDispatchError::Store(_)) => {
                        error!(err = %e, group = %ctx.group_folder, "store error dispatching task, will retry");
                    }
                },
                Err(err) => {
                    error!(path = %file_path.display(), err = %err, "failed to parse IPC task");
                    move_to_errors(&self.config.ipc_base_dir, &file_path, &ctx.group_folder);
                }
            }
        }
    }

    /// SPEC_FULL.md §4.5 task-authorization table.
    async fn dispatch_task(&self, task: IpcTask, ctx: &IpcGroupContext) -> Result<(), TaskDispatchError> {
        match task {
            IpcTask::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                target_jid,
                ..
            } => {
                let chat_jid = match target_jid {
                    Some(_) if !ctx.is_main => {
                        warn!(group = %ctx.group_folder, "non-main group may not target another chat");
                        return Err(TaskDispatchError::Unauthorized(
                            "non-main group cannot set targetJid".to_string(),
                        ));
                    }
                    Some(jid) => jid,
                    None => {
                        let group = self
                            .store
                            .get_registered_group_by_folder(&ctx.group_folder)
                            .await?
                            .ok_or_else(|| TaskDispatchError::NotFound("group not registered".to_string()))?;
                        group.jid
                    }
                };

                let task = intercom_core::store::ScheduledTask {
                    id: Uuid::new_v4().to_string(),
                    group_folder: ctx.group_folder.clone(),
                    chat_jid,
                    prompt,
                    schedule_type,
                    schedule_value,
                    context_mode,
                    next_run: None,
                    last_run: None,
                    last_result: None,
                    status: intercom_core::store::TaskStatus::Active,
                    created_at: now_iso(),
                };
                self.store.create_task(&task).await?;
                info!(task_id = %task.id, group = %ctx.group_folder, "task scheduled");
                Ok(())
            }
            IpcTask::PauseTask { task_id, .. } => {
                self.require_owns_task(&task_id, ctx).await?;
                self.store
                    .update_task(
                        &task_id,
                        &TaskUpdate {
                            status: Some(intercom_core::store::TaskStatus::Paused),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
            IpcTask::ResumeTask { task_id, .. } => {
                self.require_owns_task(&task_id, ctx).await?;
                self.store
                    .update_task(
                        &task_id,
                        &TaskUpdate {
                            status: Some(intercom_core::store::TaskStatus::Active),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
            IpcTask::CancelTask { task_id, .. } => {
                self.require_owns_task(&task_id, ctx).await?;
                self.store.delete_task(&task_id).await?;
                Ok(())
            }
            IpcTask::RefreshGroups { .. } => {
                debug!(group = %ctx.group_folder, "refresh_groups acknowledged, registry is store-backed");
                Ok(())
            }
            IpcTask::RegisterGroup {
                jid,
                name,
                folder,
                trigger,
                ..
            } => {
                if !ctx.is_main {
                    return Err(TaskDispatchError::Unauthorized(
                        "only the main group may register groups".to_string(),
                    ));
                }
                if !is_valid_jid(&jid) {
                    return Err(TaskDispatchError::InvalidPayload(format!("invalid jid: {jid}")));
                }
                if !is_valid_folder_name(&folder) {
                    return Err(TaskDispatchError::InvalidPayload(format!("invalid folder name: {folder}")));
                }
                if !is_valid_group_name(&name) {
                    return Err(TaskDispatchError::InvalidPayload(format!("invalid group name: {name}")));
                }
                let group = RegisteredGroup {
                    jid,
                    name,
                    folder,
                    trigger,
                    added_at: now_iso(),
                    agent_config: None,
                    requires_trigger: None,
                    runtime: None,
                    model: None,
                };
                self.store.set_registered_group(&group).await?;
                info!(folder = %group.folder, "group registered");
                Ok(())
            }
        }
    }

    /// A group may only pause/resume/cancel its own tasks, unless main.
    async fn require_owns_task(&self, task_id: &str, ctx: &IpcGroupContext) -> Result<(), TaskDispatchError> {
        let task = self
            .store
            .get_task_by_id(task_id)
            .await?
            .ok_or_else(|| TaskDispatchError::NotFound(format!("task not found: {task_id}")))?;
        if !ctx.is_main && task.group_folder != ctx.group_folder {
            return Err(TaskDispatchError::Unauthorized(format!(
                "group {} may not manage task {task_id}",
                ctx.group_folder
            )));
        }
        Ok(())
    }

    /// Main can send anywhere; a non-main group may only send to the chat
    /// JID it is itself registered under.
    async fn is_authorized_target(&self, chat_jid: &str, ctx: &IpcGroupContext) -> bool {
        if ctx.is_main {
            return true;
        }
        match self
            .store
            .get_registered_group_by_folder(&ctx.group_folder)
            .await
        {
            Ok(Some(group)) => group.jid == chat_jid,
            _ => false,
        }
    }
}

fn read_json_files(dir: &Path) -> Option<Vec<PathBuf>> {
    if !dir.exists() {
        return None;
    }
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut files: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            files.sort();
            Some(files)
        }
        Err(err) => {
            error!(dir = %dir.display(), err = %err, "failed to read IPC directory");
            None
        }
    }
}

fn read_and_parse<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Quarantines a bad file under `errors/`, timestamp-prefixed so two agents
/// racing on the same original filename never clobber each other's evidence.
fn move_to_errors(ipc_base: &Path, file_path: &Path, group_folder: &str) {
    let error_dir = ipc_base.join("errors");
    fs::create_dir_all(&error_dir).ok();

    if let Some(filename) = file_path.file_name() {
        let ts = now_iso().replace([':', '.'], "-");
        let dest = error_dir.join(format!(
            "{ts}-{group_folder}-{}",
            filename.to_string_lossy()
        ));
        if let Err(err) = fs::rename(file_path, &dest) {
            error!(path = %file_path.display(), err = %err, "failed to move error file");
        }
    }
}

fn remove_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        debug!(path = %path.display(), err = %err, "failed to remove processed IPC file");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn ipc_group_context_detects_main() {
        let ctx = IpcGroupContext::new("main", "main");
        assert!(ctx.is_main);
        let ctx = IpcGroupContext::new("team-eng", "main");
        assert!(!ctx.is_main);
    }

    #[test]
    fn move_to_errors_timestamp_prefixes_filename() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path();
        let file_path = ipc_base.join("bad.json");
        fs::write(&file_path, "not json").unwrap();

        move_to_errors(ipc_base, &file_path, "team-eng");

        assert!(!file_path.exists());
        let mut entries: Vec<_> = fs::read_dir(ipc_base.join("errors"))
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        entries.sort();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ends_with("-team-eng-bad.json"));
    }

    #[test]
    fn read_json_files_returns_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();

        fs::write(dir.join("003-xyz.json"), "{}").unwrap();
        fs::write(dir.join("001-abc.json"), "{}").unwrap();
        fs::write(dir.join("readme.txt"), "not json").unwrap();

        let files = read_json_files(dir).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("001-abc.json"));
        assert!(files[1].ends_with("003-xyz.json"));
    }

    #[test]
    fn read_json_files_nonexistent_dir_returns_none() {
        assert!(read_json_files(Path::new("/nonexistent/path")).is_none());
    }

    #[test]
    fn parse_ipc_message_from_json() {
        let json = r#"{
            "type": "message",
            "chatJid": "tg:1108701034",
            "text": "hello from agent",
            "sender": "assistant",
            "groupFolder": "main",
            "timestamp": "2026-02-25T12:00:00Z"
        }"#;
        let msg: IpcMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.chat_jid, "tg:1108701034");
        assert_eq!(msg.text, "hello from agent");
    }

    #[test]
    fn sweep_errors_dir_removes_old_files_and_warns_over_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path().to_path_buf();
        let error_dir = ipc_base.join("errors");
        fs::create_dir_all(&error_dir).unwrap();
        fs::write(error_dir.join("recent.json"), "{}").unwrap();

        let watcher = IpcWatcher::new(
            IpcWatcherConfig {
                ipc_base_dir: ipc_base.clone(),
                poll_interval: Duration::from_secs(1),
                main_group_folder: "main".to_string(),
            },
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(NoopChannel),
        );

        // max_age of 0 treats every file as stale regardless of mtime.
        watcher.sweep_errors_dir(Duration::from_secs(0), 50);
        assert!(!error_dir.join("recent.json").exists());
    }

    #[tokio::test]
    async fn non_main_group_cannot_target_other_chat() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let watcher = IpcWatcher::new(
            IpcWatcherConfig {
                ipc_base_dir: PathBuf::from("/tmp/unused"),
                poll_interval: Duration::from_secs(1),
                main_group_folder: "main".to_string(),
            },
            store,
            Arc::new(NoopChannel),
        );
        let ctx = IpcGroupContext::new("team-eng", "main");
        let task = IpcTask::ScheduleTask {
            prompt: "do it".to_string(),
            schedule_type: "interval".to_string(),
            schedule_value: "60000".to_string(),
            context_mode: "isolated".to_string(),
            target_jid: Some("tg:999".to_string()),
            created_by: None,
            timestamp: None,
        };
        assert!(watcher.dispatch_task(task, &ctx).await.is_err());
    }

    #[tokio::test]
    async fn register_group_rejected_from_non_main() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let watcher = IpcWatcher::new(
            IpcWatcherConfig {
                ipc_base_dir: PathBuf::from("/tmp/unused"),
                poll_interval: Duration::from_secs(1),
                main_group_folder: "main".to_string(),
            },
            store,
            Arc::new(NoopChannel),
        );
        let ctx = IpcGroupContext::new("team-eng", "main");
        let task = IpcTask::RegisterGroup {
            jid: "tg:1".to_string(),
            name: "Team".to_string(),
            folder: "team".to_string(),
            trigger: "@bot".to_string(),
            timestamp: None,
        };
        assert!(watcher.dispatch_task(task, &ctx).await.is_err());
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
