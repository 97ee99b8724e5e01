//! Handlers the `work` command registers.

use async_trait::async_trait;
use taskrunner_core::TaskRecord;
use taskrunner_engine::{HandlerRegistry, TaskHandler};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

/// Logs the task payload. Always succeeds.
pub struct LogHandler;

#[async_trait]
impl TaskHandler for LogHandler {
    async fn handle(&self, task: &TaskRecord) -> anyhow::Result<()> {
        info!(task_id = %task.task_id, data = %task.data, "log task");
        Ok(())
    }
}

/// Runs `data.command` through `sh -c`. A non-zero exit is a failure whose
/// message carries the exit code and the tail of stderr.
pub struct ShellHandler;

const STDERR_TAIL: usize = 500;

#[async_trait]
impl TaskHandler for ShellHandler {
    async fn handle(&self, task: &TaskRecord) -> anyhow::Result<()> {
        let command = task
            .data
            .get("command")
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("shell task needs a string `command` in data"))?;

        debug!(task_id = %task.task_id, %command, "running shell task");
        let output = AsyncCommand::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("spawn failed: {e}"))?;

        if output.status.success() {
            info!(
                task_id = %task.task_id,
                stdout_bytes = output.stdout.len(),
                "shell task finished"
            );
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let tail = match stderr.char_indices().rev().nth(STDERR_TAIL - 1) {
            Some((i, _)) => &stderr[i..],
            None => stderr,
        };
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        anyhow::bail!("command exited with {code}: {tail}")
    }
}

pub fn builtin_registry() -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    registry.register("log", LogHandler);
    registry.register("shell", ShellHandler);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn shell_task(data: serde_json::Value) -> TaskRecord {
        TaskRecord::new("t", "shell", data, Utc::now())
    }

    #[tokio::test]
    async fn shell_success_and_failure() {
        let ok = ShellHandler
            .handle(&shell_task(json!({ "command": "true" })))
            .await;
        assert!(ok.is_ok());

        let err = ShellHandler
            .handle(&shell_task(json!({ "command": "echo broken >&2; exit 3" })))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "command exited with 3: broken");
    }

    #[tokio::test]
    async fn shell_requires_command() {
        let err = ShellHandler
            .handle(&shell_task(json!({ "cmd": "true" })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn builtins_registered() {
        assert_eq!(builtin_registry().names(), vec!["log", "shell"]);
    }
}
