//! Spawns the agent subprocess and drives its stdin/stdout protocol
//! (SPEC_FULL.md §4.3).
//!
//! The agent is a plain OS process — no container runtime, image, or
//! volume-mount layer is involved. Its environment is built from scratch
//! (never inherited wholesale) and secret material is delivered once, in the
//! stdin JSON payload, then scrubbed from this process's memory.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use intercom_core::agent::{AgentInput, AgentOutput, extract_output_markers};
use intercom_core::config::AgentConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::secrets::zeroize_secrets;

/// Callback invoked for each decoded stdout record, in strictly sequential order.
pub type OnOutput = Arc<dyn Fn(AgentOutput) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

const READ_CHUNK_SIZE: usize = 8192;

pub struct RunOutcome {
    /// True if the run should be treated as a success for cursor-advancement
    /// purposes (includes "timed out but had already streamed output").
    pub success: bool,
    pub new_session_id: Option<String>,
    /// True once at least one record reached `on_output`.
    pub output_sent: bool,
    pub error: Option<String>,
}

/// Spawns the agent, writes `input` (plus `secrets`) to its stdin, and streams
/// decoded records from stdout to `on_output` until the process exits or a
/// timeout fires. Returns the registered child handle immediately via
/// `on_spawn` so the caller can register it with the `GroupQueue` for
/// `kill_group` before the run completes.
pub async fn run_agent(
    input: AgentInput,
    mut secrets: HashMap<String, String>,
    workspace_dir: PathBuf,
    config: &AgentConfig,
    idle_timeout_ms: u64,
    log_path: PathBuf,
    on_spawn: impl FnOnce(Arc<Mutex<Child>>),
    on_output: OnOutput,
) -> anyhow::Result<RunOutcome> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .current_dir(&workspace_dir)
        .env_clear()
        .kill_on_drop(true)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    if let Ok(path) = std::env::var("PATH") {
        cmd.env("PATH", path);
    }
    if let Ok(home) = std::env::var("HOME") {
        cmd.env("HOME", home);
    }
    cmd.env("RUST_LOG", std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()));
    if let Some(ref name) = input.assistant_name {
        cmd.env("ASSISTANT_NAME", name);
    }
    cmd.env("IPC_DIR", workspace_dir.join("ipc"));
    cmd.env("GROUP_FOLDER", &input.group_folder);
    cmd.env("CHAT_JID", &input.chat_jid);
    cmd.env("IS_MAIN", if input.is_main { "1" } else { "0" });

    let mut payload = serde_json::to_value(&input)?;
    if !secrets.is_empty() {
        if let serde_json::Value::Object(ref mut map) = payload {
            map.insert("secrets".to_string(), serde_json::to_value(&secrets)?);
        }
    }
    let payload_bytes = serde_json::to_vec(&payload)?;
    zeroize_secrets(&mut secrets);

    let mut child = cmd.spawn().map_err(|e| {
        error!(command = %config.command, err = %e, "failed to spawn agent process");
        anyhow::anyhow!("failed to spawn agent process: {e}")
    })?;

    let mut stdin = child.stdin.take().expect("stdin piped");
    stdin.write_all(&payload_bytes).await.ok();
    drop(stdin); // EOF — agent reads exactly one JSON payload then proceeds

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let child = Arc::new(Mutex::new(child));
    on_spawn(child.clone());

    let (activity_tx, mut activity_rx) = watch::channel(Instant::now());
    let start = Instant::now();
    let idle_timeout = Duration::from_millis(idle_timeout_ms);
    let hard_timeout = Duration::from_millis(config.timeout_ms).max(idle_timeout + Duration::from_millis(config.idle_grace_ms));

    let stderr_cap = config.output_cap_bytes;
    let stderr_task = tokio::spawn(capture_stderr(stderr, stderr_cap));

    let mut buffer = String::new();
    let mut stdout_log = String::new();
    let mut stdout_log_truncated = false;
    let mut raw = vec![0u8; READ_CHUNK_SIZE];
    let mut output_sent = false;
    let mut last_output: Option<AgentOutput> = None;
    let mut reader = stdout;
    let mut timed_out = false;

    loop {
        let idle_deadline = *activity_rx.borrow() + idle_timeout;
        let hard_deadline = start + hard_timeout;
        let sleep_until = idle_deadline.min(hard_deadline);

        tokio::select! {
            n = reader.read(&mut raw) => {
                match n {
                    Ok(0) => break, // EOF — process closed stdout
                    Ok(n) => {
                        if stdout_log.len() >= config.output_cap_bytes {
                            stdout_log_truncated = true;
                        } else {
                            let room = config.output_cap_bytes - stdout_log.len();
                            let take = room.min(n);
                            stdout_log.push_str(&String::from_utf8_lossy(&raw[..take]));
                            if take < n {
                                stdout_log_truncated = true;
                            }
                        }
                        buffer.push_str(&String::from_utf8_lossy(&raw[..n]));
                        if buffer.len() > config.output_cap_bytes {
                            warn!(cap = config.output_cap_bytes, "agent stdout exceeded cap, truncating");
                            let overflow = buffer.len() - config.output_cap_bytes;
                            buffer.drain(..overflow);
                        }
                        let (records, consumed) = extract_output_markers(&buffer);
                        if consumed > 0 {
                            buffer.drain(..consumed);
                        }
                        for record in records {
                            match serde_json::from_str::<AgentOutput>(&record) {
                                Ok(output) => {
                                    if output.result.is_some() {
                                        let _ = activity_tx.send(Instant::now());
                                    }
                                    output_sent = true;
                                    last_output = Some(output.clone());
                                    on_output(output).await;
                                }
                                Err(e) => {
                                    warn!(err = %e, "failed to parse agent output record, dropping");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(err = %e, "error reading agent stdout");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(sleep_until.into()) => {
                if Instant::now() >= hard_deadline || Instant::now() >= idle_deadline {
                    timed_out = true;
                    warn!("agent run timed out, killing process");
                    let mut c = child.lock().await;
                    let _ = c.kill().await;
                    break;
                }
            }
        }
    }

    let (stderr_log, stderr_log_truncated) = stderr_task.await.unwrap_or_default();

    let exit_status = {
        let mut c = child.lock().await;
        c.wait().await.ok()
    };
    let exit_code = exit_status.and_then(|s| s.code());
    debug!(?exit_code, timed_out, output_sent, "agent run finished");

    write_agent_log(
        &log_path,
        &input.group_folder,
        &input.chat_jid,
        start.elapsed(),
        exit_code,
        timed_out,
        output_sent,
        &stdout_log,
        stdout_log_truncated,
        &stderr_log,
        stderr_log_truncated,
    )
    .await;

    if timed_out {
        return Ok(RunOutcome {
            success: output_sent,
            new_session_id: last_output.as_ref().and_then(|o| o.new_session_id.clone()),
            output_sent,
            error: if output_sent {
                None
            } else {
                Some("agent run timed out with no output".to_string())
            },
        });
    }

    let new_session_id = last_output.as_ref().and_then(|o| o.new_session_id.clone());
    let had_error = last_output
        .as_ref()
        .map(|o| matches!(o.status, intercom_core::agent::AgentStatus::Error))
        .unwrap_or(!output_sent);

    Ok(RunOutcome {
        // An error after output was already sent is still treated as success
        // for cursor-advancement purposes (SPEC_FULL.md §4.2 step 6).
        success: output_sent,
        new_session_id,
        output_sent,
        error: if had_error && !output_sent {
            last_output.and_then(|o| o.error).or_else(|| Some("agent exited without producing output".to_string()))
        } else {
            None
        },
    })
}

/// Reads stderr to completion, capped at `cap` bytes. Returns the captured
/// text and whether it was truncated.
async fn capture_stderr(mut stderr: tokio::process::ChildStderr, cap: usize) -> (String, bool) {
    let mut captured = String::new();
    let mut truncated = false;
    let mut raw = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match stderr.read(&mut raw).await {
            Ok(0) => break,
            Ok(n) => {
                if captured.len() >= cap {
                    truncated = true;
                    continue;
                }
                let room = cap - captured.len();
                let take = room.min(n);
                captured.push_str(&String::from_utf8_lossy(&raw[..take]));
                if take < n {
                    truncated = true;
                }
            }
            Err(e) => {
                warn!(err = %e, "error reading agent stderr");
                break;
            }
        }
    }
    (captured, truncated)
}

/// Writes the per-run agent log: a header with timestamp/group/duration/exit
/// code/had-output, and on non-zero exit the captured stdout/stderr
/// (SPEC_FULL.md §4.3 "Exit handling").
async fn write_agent_log(
    log_path: &PathBuf,
    group_folder: &str,
    chat_jid: &str,
    duration: Duration,
    exit_code: Option<i32>,
    timed_out: bool,
    had_output: bool,
    stdout: &str,
    stdout_truncated: bool,
    stderr: &str,
    stderr_truncated: bool,
) {
    if let Some(parent) = log_path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }

    let is_error = exit_code.unwrap_or(0) != 0 || timed_out;

    let mut lines = vec![
        format!("=== Agent Run Log{} ===", if timed_out { " (TIMEOUT)" } else { "" }),
        format!("Timestamp: {}", intercom_core::store::now_iso()),
        format!("Group: {}", group_folder),
        format!("Chat: {}", chat_jid),
        format!("Duration: {}ms", duration.as_millis()),
        format!("Exit Code: {:?}", exit_code),
        format!("Had Streaming Output: {}", had_output),
        String::new(),
    ];

    if is_error {
        lines.push(format!("=== Stderr{} ===", if stderr_truncated { " (TRUNCATED)" } else { "" }));
        lines.push(stderr.to_string());
        lines.push(String::new());
        lines.push(format!("=== Stdout{} ===", if stdout_truncated { " (TRUNCATED)" } else { "" }));
        lines.push(stdout.to_string());
    }

    let content = lines.join("\n");
    if let Err(e) = tokio::fs::write(log_path, &content).await {
        warn!(log_file = %log_path.display(), err = %e, "failed to write agent log");
    } else {
        debug!(log_file = %log_path.display(), "agent log written");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_timeout_is_never_below_idle_plus_grace() {
        let cfg = AgentConfig {
            command: "true".to_string(),
            args: vec![],
            output_cap_bytes: 1024,
            timeout_ms: 1000,
            idle_grace_ms: 30_000,
        };
        let idle = Duration::from_millis(1_800_000);
        let hard = Duration::from_millis(cfg.timeout_ms).max(idle + Duration::from_millis(cfg.idle_grace_ms));
        assert!(hard >= idle + Duration::from_millis(cfg.idle_grace_ms));
    }

    #[tokio::test]
    async fn agent_log_omits_stdout_stderr_on_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("agent-1.log");
        write_agent_log(
            &log_path, "main", "tg:-100", Duration::from_millis(5), Some(0), false, true, "stdout text", false,
            "stderr text", false,
        )
        .await;
        let content = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(content.contains("Exit Code: Some(0)"));
        assert!(content.contains("Had Streaming Output: true"));
        assert!(!content.contains("stdout text"));
        assert!(!content.contains("stderr text"));
    }

    #[tokio::test]
    async fn agent_log_includes_stdout_stderr_on_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("agent-2.log");
        write_agent_log(
            &log_path, "main", "tg:-100", Duration::from_millis(5), Some(1), false, false, "stdout text", false,
            "stderr text", true,
        )
        .await;
        let content = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(content.contains("Exit Code: Some(1)"));
        assert!(content.contains("stdout text"));
        assert!(content.contains("=== Stderr (TRUNCATED) ==="));
        assert!(content.contains("stderr text"));
    }
}
