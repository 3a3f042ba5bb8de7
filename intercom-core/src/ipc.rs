//! IPC wire types shared between agent subprocesses and the `intercomd` host.
//!
//! Agents write JSON files into `{DATA_DIR}/ipc/{groupFolder}/{messages,tasks}/`.
//! The host daemon polls these directories, validates and authorizes each file,
//! dispatches it, and deletes it — or moves it to `{DATA_DIR}/ipc/errors/` on
//! failure. Authorization is always derived from the directory a file was found
//! in, never from a field inside the file itself.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Outbound message from an agent to a messaging channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcMessage {
    /// Must be "message".
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Target chat JID (e.g., "tg:1108701034").
    #[serde(rename = "chatJid")]
    pub chat_jid: String,
    /// Message text content.
    pub text: String,
    /// Optional sender identity override.
    pub sender: Option<String>,
    /// Source group folder (set by the watcher from the directory, not trusted from the file).
    #[serde(rename = "groupFolder")]
    pub group_folder: Option<String>,
    pub timestamp: Option<String>,
}

/// Task management command from an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcTask {
    ScheduleTask {
        prompt: String,
        schedule_type: String,
        schedule_value: String,
        #[serde(default = "default_context_mode")]
        context_mode: String,
        #[serde(rename = "targetJid")]
        target_jid: Option<String>,
        #[serde(rename = "createdBy")]
        created_by: Option<String>,
        timestamp: Option<String>,
    },
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: Option<String>,
        timestamp: Option<String>,
    },
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: Option<String>,
        timestamp: Option<String>,
    },
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: Option<String>,
        timestamp: Option<String>,
    },
    RefreshGroups {
        timestamp: Option<String>,
    },
    RegisterGroup {
        jid: String,
        name: String,
        folder: String,
        trigger: String,
        timestamp: Option<String>,
    },
}

fn default_context_mode() -> String {
    "isolated".to_string()
}

static FOLDER_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("static regex"));
static JID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(tg:-?\d+|[\w.+-]+@[\w.+-]+)$").expect("static regex"));

/// Validates a folder name against the `^[a-z0-9][a-z0-9_-]*$` pattern required
/// by the data model (SPEC_FULL.md §3, `RegisteredGroup.folder_name`).
pub fn is_valid_folder_name(folder: &str) -> bool {
    FOLDER_NAME_RE.is_match(folder)
}

/// Validates a chat JID against the two supported shapes: Telegram (`tg:-?\d+`)
/// or an XMPP-like `user@domain` address.
pub fn is_valid_jid(jid: &str) -> bool {
    JID_RE.is_match(jid)
}

/// Validates a display name length (SPEC_FULL.md §4.5: `register_group` rejects
/// names over 100 characters).
pub fn is_valid_group_name(name: &str) -> bool {
    !name.is_empty() && name.chars().count() <= 100
}

/// Context for authorization decisions — derived from the IPC directory path a
/// file was found in, never from a field inside the file.
#[derive(Debug, Clone)]
pub struct IpcGroupContext {
    /// Group folder name (e.g., "main", "team-eng").
    pub group_folder: String,
    /// Whether this is the main group (has elevated privileges).
    pub is_main: bool,
}

impl IpcGroupContext {
    pub fn new(group_folder: impl Into<String>, main_group_name: &str) -> Self {
        let group_folder = group_folder.into();
        let is_main = group_folder == main_group_name;
        Self {
            group_folder,
            is_main,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_task_schedule_task_deserializes_camel_case_fields() {
        let json = r#"{"type":"schedule_task","prompt":"p","schedule_type":"interval","schedule_value":"60000","targetJid":"tg:1","createdBy":"main"}"#;
        let task: IpcTask = serde_json::from_str(json).unwrap();
        match task {
            IpcTask::ScheduleTask {
                context_mode,
                target_jid,
                created_by,
                ..
            } => {
                assert_eq!(context_mode, "isolated");
                assert_eq!(target_jid.as_deref(), Some("tg:1"));
                assert_eq!(created_by.as_deref(), Some("main"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn ipc_group_context_identifies_main() {
        let ctx = IpcGroupContext::new("main", "main");
        assert!(ctx.is_main);
        let ctx = IpcGroupContext::new("team-eng", "main");
        assert!(!ctx.is_main);
    }

    #[test]
    fn folder_name_validation() {
        assert!(is_valid_folder_name("main"));
        assert!(is_valid_folder_name("team-eng_2"));
        assert!(!is_valid_folder_name("Main"));
        assert!(!is_valid_folder_name("-leading-dash"));
        assert!(!is_valid_folder_name(""));
    }

    #[test]
    fn jid_validation() {
        assert!(is_valid_jid("tg:-1001234567890"));
        assert!(is_valid_jid("tg:123"));
        assert!(is_valid_jid("user@example.com"));
        assert!(!is_valid_jid("not-a-jid"));
        assert!(!is_valid_jid(""));
    }

    #[test]
    fn group_name_validation() {
        assert!(is_valid_group_name("Engineering"));
        assert!(!is_valid_group_name(""));
        assert!(!is_valid_group_name(&"x".repeat(101)));
        assert!(is_valid_group_name(&"x".repeat(100)));
    }
}
