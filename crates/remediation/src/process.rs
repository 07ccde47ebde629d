//! Bounded external process execution and the `restart_worker` handler.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use pulse_core::event::SystemEvent;

use crate::registry::{Remediation, RemediationHandler};

/// Run a command with a hard wall-clock bound. Returns
/// `(exit_ok, stdout, stderr)`; a timeout kills the child and errors.
pub async fn run_command(
    program: &str,
    args: &[&str],
    wait: Duration,
) -> anyhow::Result<(bool, String, String)> {
    let child = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(wait, child)
        .await
        .map_err(|_| anyhow::anyhow!("`{program}` timed out after {}s", wait.as_secs()))??;

    Ok((
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

/// Kicks the managed worker via the configured supervisor command.
pub struct RestartWorkerHandler {
    command: Vec<String>,
    wait: Duration,
}

impl RestartWorkerHandler {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            wait: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl RemediationHandler for RestartWorkerHandler {
    fn name(&self) -> &'static str {
        "restart_worker"
    }

    async fn run(&self, _event: &SystemEvent) -> anyhow::Result<Remediation> {
        let Some((program, args)) = self.command.split_first() else {
            return Ok(Remediation::unfixed("no restart command configured"));
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        info!(command = %self.command.join(" "), "restarting worker");
        let (ok, _, stderr) = run_command(program, &args, self.wait).await?;
        if ok {
            Ok(Remediation::fixed(format!(
                "worker restart issued via `{program}`"
            )))
        } else {
            Ok(Remediation::unfixed(format!(
                "restart command failed: {}",
                stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::event::EventInput;

    fn event() -> SystemEvent {
        SystemEvent::build(EventInput {
            level: "error".to_string(),
            source: "worker".to_string(),
            component: "runtime".to_string(),
            action: "invoke".to_string(),
            success: false,
            error: Some("unreachable".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_empty_command_is_unfixed() {
        let handler = RestartWorkerHandler::new(Vec::new());
        let remediation = handler.run(&event()).await.unwrap();
        assert!(!remediation.fixed);
        assert!(remediation.detail.contains("no restart command"));
    }

    #[tokio::test]
    async fn test_successful_command_is_fixed() {
        let handler = RestartWorkerHandler::new(vec!["true".to_string()]);
        let remediation = handler.run(&event()).await.unwrap();
        assert!(remediation.fixed);
    }

    #[tokio::test]
    async fn test_failing_command_is_unfixed() {
        let handler = RestartWorkerHandler::new(vec!["false".to_string()]);
        let remediation = handler.run(&event()).await.unwrap();
        assert!(!remediation.fixed);
    }

    #[tokio::test]
    async fn test_run_command_captures_stdout() {
        let (ok, stdout, _) = run_command("echo", &["hello"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(stdout.trim(), "hello");
    }
}
