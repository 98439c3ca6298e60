use std::future::Future;

use crate::error::FirewallError;

/// Command-execution seam between the engine and the host. Everything the
/// engine does to the kernel goes through one of these: an argument vector,
/// optional stdin payload, captured stdout on success, exit code on failure.
pub trait CommandExecutor: Send + Sync {
    fn execute(
        &self,
        args: &[String],
        stdin: Option<&str>,
    ) -> impl Future<Output = Result<String, FirewallError>> + Send;
}

/// Runs commands directly on the host. The agent is expected to run with
/// enough privilege to drive ebtables/iptables.
pub struct HostExecutor;

impl CommandExecutor for HostExecutor {
    async fn execute(&self, args: &[String], stdin: Option<&str>) -> Result<String, FirewallError> {
        use tokio::io::AsyncWriteExt;
        use tokio::process::Command;

        let (program, rest) = args.split_first().ok_or_else(|| FirewallError::Exec {
            command: String::new(),
            code: None,
            stderr: "empty argument vector".to_string(),
        })?;

        let mut command = Command::new(program);
        command
            .args(rest)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if stdin.is_some() {
            command.stdin(std::process::Stdio::piped());
        }

        let mut child = command.spawn()?;

        if let Some(payload) = stdin {
            if let Some(mut handle) = child.stdin.take() {
                handle.write_all(payload.as_bytes()).await?;
                drop(handle);
            }
        }

        let output = child.wait_with_output().await?;

        if !output.status.success() {
            return Err(FirewallError::Exec {
                command: args.join(" "),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
