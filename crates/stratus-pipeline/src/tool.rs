//! External tool runner
//!
//! Every infrastructure, configuration and bootstrap step is carried out by an
//! external program. [`ToolRunner`] starts those programs inside a bounded
//! subprocess pool, retries non-zero exits with linear backoff and turns the
//! structured report of configuration-management tools into readable errors.
//!
//! A started tool is never killed: cancellation only takes effect between
//! pipeline passes, so a half-applied infrastructure change is never left
//! behind by this crate.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use stratus_common::config::ToolCommand;
use stratus_common::retry::{retry_with_backoff_if, RetryConfig};

use crate::error::ToolError;

/// How a tool reports failures on stdout
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Free-form output; stderr is the failure description
    #[default]
    Raw,
    /// JSON report listing per-host task results
    HostTaskJson,
}

/// One invocation of an external tool
#[derive(Clone, Debug, PartialEq)]
pub struct ToolInvocation {
    /// Executable name or path
    pub program: String,
    /// Command-line arguments
    pub args: Vec<String>,
    /// Working directory of the process
    pub work_dir: PathBuf,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
    /// How failures are reported
    pub output: OutputFormat,
}

impl ToolInvocation {
    /// Invocation of `program` in `work_dir` with no arguments
    pub fn new(program: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: work_dir.into(),
            env: BTreeMap::new(),
            output: OutputFormat::Raw,
        }
    }

    /// Invocation built from a configured tool command
    pub fn from_command(command: &ToolCommand, work_dir: impl Into<PathBuf>) -> Self {
        Self::new(command.program.clone(), work_dir).args(command.args.iter().cloned())
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Select how failures are parsed
    pub fn output(mut self, output: OutputFormat) -> Self {
        self.output = output;
        self
    }

    /// Command line for logs
    pub fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Retry policy for a configured tool: `attempts` tries, linear backoff.
///
/// Always bounded: an unvalidated zero still means a single try.
pub fn retry_for(command: &ToolCommand) -> RetryConfig {
    RetryConfig::linear(command.attempts.max(1), Duration::from_secs(command.backoff_secs))
}

/// Runs external tools inside a bounded subprocess pool
#[derive(Clone, Debug)]
pub struct ToolRunner {
    permits: Arc<Semaphore>,
}

impl ToolRunner {
    /// Runner allowing at most `limit` concurrent subprocesses
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Subprocess slots currently free
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `invocation`, retrying non-zero exits according to `retry`.
    ///
    /// Returns stdout of the first successful attempt.
    pub async fn run(
        &self,
        invocation: &ToolInvocation,
        retry: &RetryConfig,
    ) -> Result<String, ToolError> {
        retry_with_backoff_if(
            retry,
            &invocation.describe(),
            || self.run_once(invocation),
            ToolError::is_retryable,
        )
        .await
    }

    /// Run `invocation` exactly once
    pub async fn run_once(&self, invocation: &ToolInvocation) -> Result<String, ToolError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ToolError::PoolClosed)?;

        debug!(
            command = %invocation.describe(),
            work_dir = %invocation.work_dir.display(),
            "starting tool"
        );

        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.work_dir)
            .envs(&invocation.env)
            .output()
            .await
            .map_err(|source| ToolError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            info!(program = %invocation.program, "tool succeeded");
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = match invocation.output {
            OutputFormat::HostTaskJson => {
                let failures = host_task_failures(&stdout);
                if failures.is_empty() {
                    stderr
                } else {
                    failures.join("\n")
                }
            }
            OutputFormat::Raw => stderr,
        };

        warn!(
            program = %invocation.program,
            status = %output.status,
            error = %message,
            "tool failed"
        );
        Err(ToolError::Failed {
            program: invocation.program.clone(),
            status: output.status.to_string(),
            message,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct HostTaskReport {
    #[serde(default)]
    plays: Vec<PlayReport>,
}

#[derive(Debug, Deserialize)]
struct PlayReport {
    #[serde(default)]
    tasks: Vec<TaskReport>,
}

#[derive(Debug, Deserialize)]
struct TaskReport {
    task: TaskName,
    #[serde(default)]
    hosts: BTreeMap<String, HostOutcome>,
}

#[derive(Debug, Deserialize)]
struct TaskName {
    name: String,
}

#[derive(Debug, Deserialize)]
struct HostOutcome {
    #[serde(default)]
    failed: bool,
    #[serde(default)]
    unreachable: bool,
    #[serde(default)]
    msg: serde_json::Value,
}

/// Extract one line per failed host and task from a host-task JSON report.
///
/// Output that is not a valid report yields no failures, so the caller falls
/// back to stderr.
pub fn host_task_failures(stdout: &str) -> Vec<String> {
    let report: HostTaskReport = match serde_json::from_str(stdout) {
        Ok(report) => report,
        Err(e) => {
            debug!(error = %e, "tool output is not a host-task report");
            return Vec::new();
        }
    };

    report
        .plays
        .iter()
        .flat_map(|play| play.tasks.iter())
        .flat_map(|task| {
            task.hosts
                .iter()
                .filter(|(_, outcome)| outcome.failed || outcome.unreachable)
                .map(move |(host, outcome)| {
                    let message = match &outcome.msg {
                        serde_json::Value::String(s) => s.clone(),
                        serde_json::Value::Null => "unknown error".to_string(),
                        other => other.to_string(),
                    };
                    format!(
                        "{host} failed inside task {} due to: {message}",
                        task.task.name
                    )
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, dir: &std::path::Path) -> ToolInvocation {
        ToolInvocation::new("sh", dir).arg("-c").arg(script)
    }

    #[test]
    fn host_task_report_aggregates_every_failed_host() {
        let stdout = r#"{
          "plays": [{
            "tasks": [
              {"task": {"name": "install wireguard"},
               "hosts": {
                 "node-1": {"failed": false},
                 "node-2": {"failed": true, "msg": "apt lock held"}
               }},
              {"task": {"name": "ping"},
               "hosts": {"node-3": {"unreachable": true, "msg": "ssh timeout"}}}
            ]
          }]
        }"#;

        assert_eq!(
            host_task_failures(stdout),
            vec![
                "node-2 failed inside task install wireguard due to: apt lock held".to_string(),
                "node-3 failed inside task ping due to: ssh timeout".to_string(),
            ]
        );
    }

    #[test]
    fn unparseable_report_yields_no_failures() {
        assert!(host_task_failures("PLAY RECAP *****").is_empty());
        assert!(host_task_failures("{}").is_empty());
    }

    #[test]
    fn describe_joins_program_and_arguments() {
        let command = ToolCommand::new("stratus-infra", &["--auto-approve"]);
        let invocation = ToolInvocation::from_command(&command, "/tmp").arg("apply");
        assert_eq!(invocation.describe(), "stratus-infra --auto-approve apply");
    }

    #[tokio::test]
    async fn successful_run_returns_stdout_and_uses_work_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ToolRunner::new(2);
        let invocation = sh("printf '%s:%s' \"$STAGE\" \"$(basename \"$PWD\")\"", dir.path())
            .env("STAGE", "vpn");

        let out = runner.run_once(&invocation).await.unwrap();

        let dir_name = dir.path().file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(out, format!("vpn:{dir_name}"));
        assert_eq!(runner.available(), 2);
    }

    #[tokio::test]
    async fn failing_host_task_tool_reports_aggregated_errors() {
        let dir = tempfile::tempdir().unwrap();
        let report = r#"{"plays":[{"tasks":[{"task":{"name":"join"},"hosts":{"cp-1":{"failed":true,"msg":"kubelet down"}}}]}]}"#;
        let invocation = sh(&format!("echo '{report}'; exit 2"), dir.path())
            .output(OutputFormat::HostTaskJson);

        let err = ToolRunner::new(1).run_once(&invocation).await.unwrap_err();

        match err {
            ToolError::Failed { message, .. } => {
                assert_eq!(message, "cp-1 failed inside task join due to: kubelet down")
            }
            other => panic!("expected failed exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn raw_failures_carry_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = sh("echo 'quota exceeded' >&2; exit 1", dir.path());

        let err = ToolRunner::new(1).run_once(&invocation).await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_retried_until_success() {
        let dir = tempfile::tempdir().unwrap();
        // Fails until the marker file has been written twice
        let script = "echo x >> attempts; [ $(wc -l < attempts) -ge 3 ] || exit 1; echo done";
        let retry = RetryConfig::linear(3, Duration::from_millis(1));

        let out = ToolRunner::new(1)
            .run(&sh(script, dir.path()), &retry)
            .await
            .unwrap();

        assert_eq!(out.trim(), "done");
        let attempts = std::fs::read_to_string(dir.path().join("attempts")).unwrap();
        assert_eq!(attempts.lines().count(), 3);
    }

    #[tokio::test]
    async fn missing_program_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = ToolInvocation::new("/nonexistent/stratus-tool", dir.path());
        let retry = RetryConfig::linear(5, Duration::from_secs(60));

        let start = std::time::Instant::now();
        let err = ToolRunner::new(1).run(&invocation, &retry).await.unwrap_err();

        assert!(matches!(err, ToolError::Spawn { .. }));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn tool_retries_are_never_unbounded() {
        let mut command = ToolCommand::new("kubeone", &[]);
        command.attempts = 0;
        assert_eq!(retry_for(&command).max_attempts, 1);

        command.attempts = 4;
        assert_eq!(retry_for(&command).max_attempts, 4);
    }
}
