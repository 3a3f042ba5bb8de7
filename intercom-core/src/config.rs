use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IntercomConfig {
    pub storage: StorageConfig,
    pub agent: AgentConfig,
    pub orchestrator: OrchestratorConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the embedded sqlite database file.
    pub path: String,
    /// Directory holding each group's workspace (AGENTS.md, memory/, logs/).
    pub groups_dir: String,
    /// Directory holding the IPC mailbox tree (`{data_dir}/ipc/...`).
    pub data_dir: String,
    /// Message retention, in days, before the retention sweep deletes a row.
    pub message_retention_days: i64,
    /// Task run log retention, in days.
    pub task_log_retention_days: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "store/messages.db".to_string(),
            groups_dir: "groups".to_string(),
            data_dir: "data".to_string(),
            message_retention_days: 90,
            task_log_retention_days: 30,
        }
    }
}

/// Spawn contract for the agent subprocess (SPEC_FULL.md §4.3). One configured
/// executable — no multi-runtime provider selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable to spawn for each turn.
    pub command: String,
    /// Extra argv entries, in order, before the executable receives its stdin payload.
    pub args: Vec<String>,
    /// Stdout cap in bytes; output is truncated, not killed, once exceeded.
    pub output_cap_bytes: usize,
    /// Hard timeout floor, milliseconds. The effective hard timeout is
    /// `max(timeout_ms, idle_timeout_ms + idle_grace_ms)`.
    pub timeout_ms: u64,
    /// Grace period added to the idle timeout when computing the hard timeout.
    pub idle_grace_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "intercom-agent".to_string(),
            args: Vec::new(),
            output_cap_bytes: 10 * 1024 * 1024,
            timeout_ms: 600_000,
            idle_grace_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Enable the orchestrator (message loop, GroupQueue, agent dispatch).
    pub enabled: bool,
    /// Maximum concurrent agent processes across all groups.
    pub max_concurrent: usize,
    /// Poll interval for the message loop (milliseconds).
    pub poll_interval_ms: u64,
    /// Idle timeout before closing an agent's stdin (milliseconds).
    pub idle_timeout_ms: u64,
    /// Folder name for the main group.
    pub main_group_folder: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 5,
            poll_interval_ms: 1_000,
            idle_timeout_ms: 1_800_000,
            main_group_folder: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Enable the task scheduler loop.
    pub enabled: bool,
    /// Poll interval for due tasks (milliseconds).
    pub poll_interval_ms: u64,
    /// IANA timezone for cron expressions.
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 60_000,
            timezone: "UTC".to_string(),
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<IntercomConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(IntercomConfig::default().with_env_overrides());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let parsed: IntercomConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(parsed.with_env_overrides())
}

impl IntercomConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var("INTERCOM_STORE_PATH") {
            if !path.trim().is_empty() {
                self.storage.path = path;
            }
        }

        if let Ok(dir) = std::env::var("INTERCOM_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.storage.data_dir = dir;
            }
        }

        if let Ok(command) = std::env::var("INTERCOM_AGENT_COMMAND") {
            if !command.trim().is_empty() {
                self.agent.command = command;
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_storage_paths() {
        let cfg = IntercomConfig::default();
        assert_eq!(cfg.storage.path, "store/messages.db");
        assert_eq!(cfg.storage.groups_dir, "groups");
        assert_eq!(cfg.storage.data_dir, "data");
    }

    #[test]
    fn default_scheduler_poll_interval_is_sixty_seconds() {
        let cfg = IntercomConfig::default();
        assert_eq!(cfg.scheduler.poll_interval_ms, 60_000);
    }

    #[test]
    fn parse_toml_uses_defaults_for_missing_fields() {
        let parsed: IntercomConfig = toml::from_str(
            r#"
            [storage]
            path = "custom/store.db"
            "#,
        )
        .expect("parse toml");

        assert_eq!(parsed.storage.path, "custom/store.db");
        assert_eq!(parsed.storage.groups_dir, "groups");
        assert_eq!(parsed.orchestrator.max_concurrent, 5);
    }

    #[test]
    fn env_overrides_apply_on_top_of_file_config() {
        // SAFETY: tests in this crate run single-threaded per-test via serial env access is
        // not required here because each test sets and immediately reads its own var.
        unsafe {
            std::env::set_var("INTERCOM_STORE_PATH", "/tmp/override.db");
        }
        let cfg = IntercomConfig::default().with_env_overrides();
        assert_eq!(cfg.storage.path, "/tmp/override.db");
        unsafe {
            std::env::remove_var("INTERCOM_STORE_PATH");
        }
    }
}
