//! Command provisioner: runs an external program per resource.
//!
//! The program named by the URI (`cmd://<program>`) is spawned with the
//! configured `args`. It receives `{"request": .., "prior": ..}` as JSON on
//! stdin and must print `{"outputs": .., "services": .., "volumes": ..}` as
//! JSON on stdout. A non-zero exit status or unparseable output fails the
//! resource.

use super::{ProvisionRequest, Provisioner};
use crate::core::error::ProvisionError;
use crate::core::types::{Provisioned, ResolvedResource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const SCHEME: &str = "cmd://";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandProvisioner {
    uri: String,

    #[serde(rename = "type")]
    resource_type: String,

    #[serde(default)]
    class: Option<String>,

    #[serde(default)]
    description: Option<String>,

    #[serde(default)]
    args: Vec<String>,

    /// Kill the program after this many seconds
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

#[derive(Serialize)]
struct CommandInput<'a> {
    request: &'a ProvisionRequest,
    prior: Option<&'a ResolvedResource>,
}

/// Captured result of running a provisioner program.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl CommandProvisioner {
    /// Program to run: the URI with its scheme removed.
    pub fn program(&self) -> &str {
        self.uri.strip_prefix(SCHEME).unwrap_or_default()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    async fn provision(
        &self,
        request: &ProvisionRequest,
        prior: Option<&ResolvedResource>,
    ) -> Result<Provisioned, ProvisionError> {
        let input = serde_json::to_vec(&CommandInput { request, prior })
            .map_err(|e| ProvisionError::new(format!("cannot encode request: {}", e)))?;

        tracing::debug!(program = self.program(), resource = %request.id, "running command provisioner");
        let out = run_command(self.program(), &self.args, &input, self.timeout())
            .await
            .map_err(|e| ProvisionError::new(format!("{}: {}", self.uri, e)))?;

        if !out.success() {
            return Err(ProvisionError::new(format!(
                "{} exited with status {}: {}",
                self.uri,
                out.exit_code,
                out.stderr.trim()
            )));
        }
        serde_json::from_str(&out.stdout)
            .map_err(|e| ProvisionError::new(format!("{}: invalid output: {}", self.uri, e)))
    }
}

/// Spawn `program` with `args`, feed `input` on stdin and collect its output.
/// The timeout covers the whole exchange, stdin included; on expiry the child
/// is killed.
pub async fn run_command(
    program: &str,
    args: &[String],
    input: &[u8],
    timeout: Option<Duration>,
) -> Result<CommandOutput, String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn {}: {}", program, e))?;

    let stdin = child.stdin.take();
    let feed = async move {
        let Some(mut stdin) = stdin else {
            return Ok(());
        };
        match stdin.write_all(input).await {
            // A program that ignores its input may close stdin early.
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                Err(format!("stdin write error: {}", e))
            }
            _ => Ok(()),
        }
    };
    let exchange = async move {
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed?;
        output.map_err(|e| format!("wait error: {}", e))
    };

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| format!("timed out after {}s", limit.as_secs()))??,
        None => exchange.await?,
    };

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn request() -> ProvisionRequest {
        ProvisionRequest {
            id: "db".to_string(),
            resource_type: "postgres".to_string(),
            class: "default".to_string(),
            params: Default::default(),
            workloads: vec!["web".to_string()],
        }
    }

    fn bash(script: &str, timeout: Option<u64>) -> CommandProvisioner {
        CommandProvisioner {
            uri: "cmd://bash".to_string(),
            resource_type: "postgres".to_string(),
            class: None,
            description: None,
            args: vec!["-c".to_string(), script.to_string()],
            timeout_seconds: timeout,
        }
    }

    #[test]
    fn test_program_from_uri() {
        assert_eq!(bash("true", None).program(), "bash");
    }

    #[tokio::test]
    async fn test_run_command_echo() {
        let out = run_command("bash", &["-c".to_string(), "cat".to_string()], b"hello", None).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn test_run_command_failure_code() {
        let out = run_command("bash", &["-c".to_string(), "exit 42".to_string()], b"", None).await.unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 42);
    }

    #[tokio::test]
    async fn test_run_command_missing_program() {
        let err = run_command("/nonexistent/score-ecs-provisioner", &[], b"", None).await.unwrap_err();
        assert!(err.contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_provision_parses_outputs() {
        let p = bash(
            r#"cat >/dev/null; echo '{"outputs": {"host": "pg", "port": 5432, "password": {"secret": "arn:pw"}}}'"#,
            None,
        );
        let out = p.provision(&request(), None).await.unwrap();
        assert_eq!(out.outputs["host"], crate::core::types::OutputValue::string("pg"));
        assert_eq!(out.outputs["password"], crate::core::types::OutputValue::secret("arn:pw"));
    }

    #[tokio::test]
    async fn test_provision_receives_request() {
        let p = bash(
            r#"input=$(cat); case "$input" in *'"id":"db"'*) echo '{"outputs": {}}';; *) exit 3;; esac"#,
            None,
        );
        assert!(p.provision(&request(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_provision_nonzero_exit() {
        let p = bash("echo boom >&2; exit 1", None);
        let err = p.provision(&request(), None).await.unwrap_err();
        assert!(err.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_provision_invalid_json() {
        let p = bash("echo not-json", None);
        let err = p.provision(&request(), None).await.unwrap_err();
        assert!(err.message.contains("invalid output"));
    }

    #[tokio::test]
    async fn test_provision_timeout() {
        let p = bash("sleep 5", Some(1));
        let started = Instant::now();
        let err = p.provision(&request(), None).await.unwrap_err();
        assert!(err.message.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_timeout_covers_unread_stdin() {
        let mut req = request();
        req.params.insert(
            "blob".to_string(),
            serde_yaml_ng::Value::String("x".repeat(4 * 1024 * 1024)),
        );
        let p = bash("sleep 30", Some(1));
        let started = Instant::now();
        let err = p.provision(&req, None).await.unwrap_err();
        assert!(err.message.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
