//! Remote administrative shell used during server provisioning. The real
//! implementation shells out to `ssh` via `sshpass`; tests substitute their
//! own [`RemoteShell`].

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs one command as root on the remote host. `stdin` feeds scripted
    /// answers into interactive installers.
    async fn run(
        &self,
        host: &str,
        password: &str,
        command: &str,
        stdin: Option<&str>,
    ) -> Result<ShellOutput>;
}

/// Password-authenticated ssh through the local `ssh`/`sshpass` binaries.
/// Host keys are not checked; provisioned machines are freshly created and
/// have no prior known-hosts entry.
#[derive(Debug, Default)]
pub struct SshShell;

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(
        &self,
        host: &str,
        password: &str,
        command: &str,
        stdin: Option<&str>,
    ) -> Result<ShellOutput> {
        let mut child = Command::new("sshpass")
            .arg("-p")
            .arg(password)
            .arg("ssh")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg(format!("root@{host}"))
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(input) = stdin {
            let mut handle = child.stdin.take().ok_or_else(|| {
                Error::ProvisioningFailed("ssh child has no stdin handle".to_string())
            })?;
            handle.write_all(input.as_bytes()).await?;
            handle.shutdown().await?;
        } else {
            drop(child.stdin.take());
        }

        let output = child.wait_with_output().await?;
        Ok(ShellOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
