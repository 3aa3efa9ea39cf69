//! Runs the external signing tools as child processes

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{log_debug, log_error, Error, Result};

/// Arguments whose following value is a password
const SECRET_FLAGS: &[&str] = &[
    "-storepass",
    "-keypass",
    "-srcstorepass",
    "-deststorepass",
    "-srckeypass",
    "-destkeypass",
];

/// Distinct command forms issued to the external tools
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ToolAction {
    Probe,
    GenerateKeyPair,
    ExportCertificate,
    ConvertContainer,
    SignPayload,
    VerifySignature,
    Install,
}

impl fmt::Display for ToolAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ToolAction::Probe => "tool probe",
            ToolAction::GenerateKeyPair => "key pair generation",
            ToolAction::ExportCertificate => "certificate export",
            ToolAction::ConvertContainer => "PKCS12 conversion",
            ToolAction::SignPayload => "payload signing",
            ToolAction::VerifySignature => "signature verification",
            ToolAction::Install => "installation step",
        };
        write!(f, "{name}")
    }
}

/// A single command to run, always with an explicit working directory
#[derive(Clone, Eq, PartialEq)]
pub struct ToolInvocation {
    pub action: ToolAction,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: PathBuf,
}

impl ToolInvocation {
    pub fn new(action: ToolAction, program: impl Into<PathBuf>, current_dir: impl Into<PathBuf>) -> Self {
        ToolInvocation {
            action,
            program: program.into(),
            args: vec![],
            current_dir: current_dir.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Returns the value following `flag`, if present
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(|s| s.as_str())
    }

    /// Renders the command line with password values masked, suitable for logs
    pub fn redacted(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        let mut mask_next = false;
        for arg in &self.args {
            if mask_next {
                parts.push("********".to_string());
                mask_next = false;
            } else {
                parts.push(arg.clone());
                mask_next = SECRET_FLAGS.contains(&arg.as_str());
            }
        }
        parts.join(" ")
    }
}

impl fmt::Debug for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolInvocation")
            .field("action", &self.action)
            .field("command", &self.redacted())
            .field("current_dir", &self.current_dir)
            .finish()
    }
}

/// Captured result of a finished child process
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ToolOutput {
    /// Exit code, or None when the process was terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Text to show an operator when the invocation failed. Falls back to stdout because
    /// keytool reports some failures there.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else if !self.stdout.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            match self.status {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            }
        }
    }
}

/// Seam between the producer and the operating system. Returns `Err` only when the process could
/// not be run at all; a non-zero exit is reported through [ToolOutput::status].
pub trait ToolRunner: Send + Sync + 'static {
    fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<ToolOutput>> + Send;
}

/// [ToolRunner] that spawns real child processes with a bounded run time
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        ProcessRunner { timeout }
    }
}

impl ToolRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        log_debug(&format!(
            "Running {} in {}",
            invocation.redacted(),
            invocation.current_dir.display()
        ));

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.current_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                log_error(&format!(
                    "Failed to start {}: {e}",
                    invocation.program.display()
                ));
                Error::Io(format!("{}: {e}", invocation.program.display()))
            })?;

        // dropping the wait future drops the child, which kills it
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = tokio::time::timeout(self.timeout, child.wait_with_output()) => match r {
                Ok(output) => output?,
                Err(_) => {
                    log_error(&format!("{} timed out after {:?}", invocation.action, self.timeout));
                    return Err(Error::Timeout);
                }
            },
        };

        Ok(ToolOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_masks_every_password_flag() {
        let inv = ToolInvocation::new(ToolAction::ConvertContainer, "keytool", ".")
            .arg("-importkeystore")
            .arg("-srcstorepass")
            .arg("one")
            .arg("-deststorepass")
            .arg("two")
            .arg("-alias")
            .arg("mykey");
        let shown = inv.redacted();
        assert_eq!(
            shown,
            "keytool -importkeystore -srcstorepass ******** -deststorepass ******** -alias mykey"
        );
        assert!(!format!("{inv:?}").contains("one"));
        assert_eq!(inv.value_of("-alias"), Some("mykey"));
        assert_eq!(inv.value_of("-missing"), None);
    }

    #[test]
    fn diagnostic_prefers_stderr() {
        let out = ToolOutput {
            status: Some(1),
            stdout: "ignored".to_string(),
            stderr: "keytool error: bad\n".to_string(),
        };
        assert_eq!(out.diagnostic(), "keytool error: bad");
        let out = ToolOutput {
            status: Some(2),
            ..Default::default()
        };
        assert_eq!(out.diagnostic(), "exit status 2");
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_captures_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(Duration::from_secs(10));
        let inv = ToolInvocation::new(ToolAction::Probe, "sh", dir.path())
            .arg("-c")
            .arg("echo out; echo err 1>&2; exit 3");
        let out = runner.run(&inv, &CancellationToken::new()).await.unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_honours_timeout_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let inv = ToolInvocation::new(ToolAction::Probe, "sleep", dir.path()).arg("5");

        let runner = ProcessRunner::new(Duration::from_millis(100));
        let r = runner.run(&inv, &CancellationToken::new()).await;
        assert_eq!(r, Err(Error::Timeout));

        let runner = ProcessRunner::new(Duration::from_secs(30));
        let token = CancellationToken::new();
        token.cancel();
        let r = runner.run(&inv, &token).await;
        assert_eq!(r, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(Duration::from_secs(10));
        let inv = ToolInvocation::new(ToolAction::Probe, "definitely-not-a-real-tool-xyz", dir.path());
        assert!(matches!(
            runner.run(&inv, &CancellationToken::new()).await,
            Err(Error::Io(_))
        ));
    }
}
