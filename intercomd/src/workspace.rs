//! Creates the on-disk directory layout a group's agent and the IPC watcher
//! both depend on (SPEC_FULL.md §6, "on-disk layout").

use std::path::{Path, PathBuf};

use anyhow::Context;

/// Ensures `{data_dir}/ipc/{group_folder}/{input,messages,tasks}/` and
/// `{data_dir}/ipc/errors/` exist.
pub fn ensure_ipc_dirs(data_dir: &Path, group_folder: &str) -> anyhow::Result<()> {
    let base = data_dir.join("ipc").join(group_folder);
    for sub in ["input", "messages", "tasks"] {
        std::fs::create_dir_all(base.join(sub))
            .with_context(|| format!("failed to create {}", base.join(sub).display()))?;
    }
    std::fs::create_dir_all(data_dir.join("ipc").join("errors"))
        .context("failed to create ipc/errors directory")?;
    Ok(())
}

/// Ensures `{groups_dir}/{folder}/{logs,memory}/` exist for a registered group.
pub fn ensure_group_workspace(groups_dir: &Path, folder: &str) -> anyhow::Result<PathBuf> {
    let workspace = groups_dir.join(folder);
    std::fs::create_dir_all(workspace.join("logs"))
        .with_context(|| format!("failed to create {}/logs", workspace.display()))?;
    std::fs::create_dir_all(workspace.join("memory"))
        .with_context(|| format!("failed to create {}/memory", workspace.display()))?;
    Ok(workspace)
}

/// Path to the per-run agent log file (`logs/agent-{timestamp_millis}.log`).
pub fn agent_log_path(groups_dir: &Path, folder: &str, timestamp_millis: u128) -> PathBuf {
    groups_dir
        .join(folder)
        .join("logs")
        .join(format!("agent-{timestamp_millis}.log"))
}

/// Refreshes `{data_dir}/ipc/{folder}/{current_tasks,available_groups}.json`
/// immediately before a dispatch (SPEC_FULL.md §6, "on-disk layout"). These
/// are opaque to the core beyond their existence — agents read them directly
/// rather than round-tripping through the IPC watcher for read-only state.
pub fn write_snapshots(
    data_dir: &Path,
    group_folder: &str,
    tasks: &[intercom_core::store::ScheduledTask],
    groups: &std::collections::HashMap<String, intercom_core::store::RegisteredGroup>,
) -> anyhow::Result<()> {
    let dir = data_dir.join("ipc").join(group_folder);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let tasks_json = serde_json::to_string(tasks).context("serialize current_tasks.json")?;
    std::fs::write(dir.join("current_tasks.json"), tasks_json)
        .context("write current_tasks.json")?;

    let mut group_list: Vec<&intercom_core::store::RegisteredGroup> = groups.values().collect();
    group_list.sort_by(|a, b| a.folder.cmp(&b.folder));
    let groups_json = serde_json::to_string(&group_list).context("serialize available_groups.json")?;
    std::fs::write(dir.join("available_groups.json"), groups_json)
        .context("write available_groups.json")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_ipc_dirs_creates_full_tree() {
        let dir = tempfile::tempdir().unwrap();
        ensure_ipc_dirs(dir.path(), "main").unwrap();
        assert!(dir.path().join("ipc/main/input").is_dir());
        assert!(dir.path().join("ipc/main/messages").is_dir());
        assert!(dir.path().join("ipc/main/tasks").is_dir());
        assert!(dir.path().join("ipc/errors").is_dir());
    }

    #[test]
    fn ensure_group_workspace_creates_logs_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = ensure_group_workspace(dir.path(), "team-eng").unwrap();
        assert!(workspace.join("logs").is_dir());
        assert!(workspace.join("memory").is_dir());
    }

    #[test]
    fn agent_log_path_is_namespaced_by_folder_and_timestamp() {
        let path = agent_log_path(Path::new("/groups"), "main", 12345);
        assert_eq!(path, PathBuf::from("/groups/main/logs/agent-12345.log"));
    }

    #[test]
    fn write_snapshots_creates_both_files() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshots(dir.path(), "main", &[], &std::collections::HashMap::new()).unwrap();
        let base = dir.path().join("ipc/main");
        assert!(base.join("current_tasks.json").is_file());
        assert!(base.join("available_groups.json").is_file());
        assert_eq!(
            std::fs::read_to_string(base.join("current_tasks.json")).unwrap(),
            "[]"
        );
    }
}
