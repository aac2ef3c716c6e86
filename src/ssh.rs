//! Exec-over-SSH for container host provisioning.
//!
//! Each remote command is a stream of [`ExecRecord`]s: stdout and stderr
//! lines as they arrive, then exactly one exit status. [`SshSession::run`]
//! bounds every command by a timeout and turns the first non-zero exit into
//! a permanent error, so a provisioning script stops at the first failure.
//!
//! The `ssh` binary does the transport; the session only builds its argument
//! list. Unit tests run the same commands through a local `sh -c` instead.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ProviderError;

/// Default bound for a single remote command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// One event of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecRecord {
    /// A line written to stdout.
    Stdout(String),
    /// A line written to stderr.
    Stderr(String),
    /// Exit status; always the last record. `-1` when killed by a signal.
    Exit(i32),
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// Host name or address.
    pub host: String,
    /// Login user.
    pub user: String,
    /// SSH port.
    pub port: u16,
    /// Jump host, `user@host` or `host`.
    pub bastion: Option<String>,
    /// Private key file passed with `-i`; the agent is used otherwise.
    pub identity_file: Option<PathBuf>,
}

impl SshTarget {
    /// Target `user@host` on port 22.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: 22,
            bastion: None,
            identity_file: None,
        }
    }

    /// Connect through `bastion`.
    pub fn with_bastion(mut self, bastion: impl Into<String>) -> Self {
        self.bastion = Some(bastion.into()).filter(|b: &String| !b.is_empty());
        self
    }

    /// Authenticate with the key at `path`.
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Arguments for `ssh`, up to and including the destination.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(bastion) = &self.bastion {
            args.push("-J".to_string());
            args.push(bastion.clone());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", self.user, self.host));
        args
    }
}

/// How commands are started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
    /// `ssh <target> -- <command>`.
    Ssh(SshTarget),
    /// `sh -c <command>` on this machine.
    #[cfg(test)]
    Shell,
}

/// A private key in a temporary file only the current user can read.
/// The file is removed on drop.
#[derive(Debug)]
pub struct IdentityFile {
    file: tempfile::NamedTempFile,
}

impl IdentityFile {
    /// Write `private_key` to a fresh temporary file.
    pub async fn write(private_key: &str) -> Result<Self, ProviderError> {
        let mut content = private_key.trim_end().to_string();
        content.push('\n');
        let written = tokio::task::spawn_blocking(move || -> std::io::Result<tempfile::NamedTempFile> {
            use std::io::Write;
            let mut file = tempfile::Builder::new().prefix("hsdp-ssh-").tempfile()?;
            file.write_all(content.as_bytes())?;
            file.flush()?;
            Ok(file)
        })
        .await
        .map_err(|e| ProviderError::Configuration(format!("cannot write ssh key: {}", e)))?;
        let file =
            written.map_err(|e| ProviderError::Configuration(format!("cannot write ssh key: {}", e)))?;
        Ok(Self { file })
    }

    /// Location of the key.
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Records of a running command.
#[derive(Debug)]
pub struct ExecStream {
    rx: mpsc::Receiver<ExecRecord>,
}

impl ExecStream {
    /// Next record; `None` once the stream is finished.
    pub async fn next(&mut self) -> Option<ExecRecord> {
        self.rx.recv().await
    }
}

async fn forward<R>(pipe: Option<R>, tx: mpsc::Sender<ExecRecord>, wrap: fn(String) -> ExecRecord)
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return;
    };
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(wrap(line)).await.is_err() {
            break;
        }
    }
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Runs commands on one host.
#[derive(Debug, Clone)]
pub struct SshSession {
    launcher: Launcher,
    command_timeout: Duration,
}

impl SshSession {
    /// Session using `launcher`.
    pub fn new(launcher: Launcher) -> Self {
        Self {
            launcher,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Bound each command by `timeout`.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn command(&self, remote: &str) -> Command {
        match &self.launcher {
            Launcher::Ssh(target) => {
                let mut cmd = Command::new("ssh");
                cmd.args(target.args()).arg("--").arg(remote);
                cmd
            },
            #[cfg(test)]
            Launcher::Shell => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(remote);
                cmd
            },
        }
    }

    /// Start `remote`, feeding `stdin` when given. The process is killed
    /// when the returned stream is dropped.
    pub fn spawn(&self, remote: &str, stdin: Option<Vec<u8>>) -> Result<ExecStream, ProviderError> {
        let mut child = self
            .command(remote)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::Transport(format!("cannot start command: {}", e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if let (Some(mut pipe), Some(bytes)) = (child.stdin.take(), stdin) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&bytes).await {
                    debug!(error = %e, "writing command stdin failed");
                }
            });
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let out = forward(stdout, tx.clone(), ExecRecord::Stdout);
            let err = forward(stderr, tx.clone(), ExecRecord::Stderr);
            let status = tokio::select! {
                _ = tx.closed() => return,
                (_, _, status) = async { tokio::join!(out, err, child.wait()) } => status,
            };
            let code = match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            let _ = tx.send(ExecRecord::Exit(code)).await;
        });
        Ok(ExecStream { rx })
    }

    /// Run `remote` to completion. Returns every record on exit status 0.
    pub async fn run(
        &self,
        remote: &str,
        stdin: Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExecRecord>, ProviderError> {
        let mut stream = self.spawn(remote, stdin)?;
        let deadline = tokio::time::sleep(self.command_timeout);
        tokio::pin!(deadline);
        let mut records = Vec::new();

        loop {
            let record = tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = &mut deadline => {
                    return Err(ProviderError::DeadlineExceeded(format!(
                        "command '{}' did not finish within {:?}",
                        remote, self.command_timeout
                    )))
                },
                record = stream.next() => record,
            };
            match record {
                Some(ExecRecord::Exit(0)) => {
                    records.push(ExecRecord::Exit(0));
                    return Ok(records);
                },
                Some(ExecRecord::Exit(code)) => {
                    let stderr: Vec<&str> = records
                        .iter()
                        .filter_map(|r| match r {
                            ExecRecord::Stderr(line) => Some(line.as_str()),
                            _ => None,
                        })
                        .collect();
                    return Err(ProviderError::FailedPrecondition(format!(
                        "command '{}' exited with status {}: {}",
                        remote,
                        code,
                        stderr.join("\n")
                    )));
                },
                Some(record) => {
                    debug!(?record, "command output");
                    records.push(record);
                },
                None => {
                    return Err(ProviderError::Transport(format!(
                        "command '{}' ended without an exit status",
                        remote
                    )))
                },
            }
        }
    }

    /// Run `commands` in order, stopping at the first failure.
    pub async fn run_all(
        &self,
        commands: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<ExecRecord>, ProviderError> {
        let mut records = Vec::new();
        for (index, command) in commands.iter().enumerate() {
            info!(index, "running provisioning command");
            records.extend(self.run(command, None, cancel).await?);
        }
        Ok(records)
    }

    /// Write `content` to `destination` on the host, then set `permissions`.
    pub async fn upload(
        &self,
        content: &[u8],
        destination: &str,
        permissions: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let target = shell_quote(destination);
        let mut command = format!("cat > {}", target);
        if let Some(mode) = permissions.filter(|m| !m.is_empty()) {
            command.push_str(&format!(" && chmod {} {}", shell_quote(mode), target));
        }
        info!(destination, bytes = content.len(), "uploading file");
        self.run(&command, Some(content.to_vec()), cancel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> SshSession {
        SshSession::new(Launcher::Shell).with_command_timeout(Duration::from_secs(10))
    }

    #[test]
    fn test_ssh_args() {
        let target = SshTarget::new("10.0.0.5", "core")
            .with_bastion("gw@bastion.example")
            .with_identity_file("/tmp/key");
        let args = target.args();
        assert_eq!(args.last().map(String::as_str), Some("core@10.0.0.5"));
        let joined = args.join(" ");
        assert!(joined.contains("-J gw@bastion.example"));
        assert!(joined.contains("-i /tmp/key"));
        assert!(joined.contains("-p 22"));

        let direct = SshTarget::new("h", "u").with_bastion("");
        assert!(!direct.args().contains(&"-J".to_string()));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/etc/app.conf"), "'/etc/app.conf'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_run_collects_records() {
        let records = shell()
            .run("echo hello; echo oops 1>&2", None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(records.contains(&ExecRecord::Stdout("hello".into())));
        assert!(records.contains(&ExecRecord::Stderr("oops".into())));
        assert_eq!(records.last(), Some(&ExecRecord::Exit(0)));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        let err = shell()
            .run("echo broken 1>&2; exit 3", None, &CancellationToken::new())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("status 3"), "{}", msg);
        assert!(msg.contains("broken"), "{}", msg);
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let err = SshSession::new(Launcher::Shell)
            .with_command_timeout(Duration::from_millis(50))
            .run("sleep 5", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn test_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = shell().run("sleep 5", None, &cancel).await.unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }

    #[tokio::test]
    async fn test_run_all_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let commands = vec![
            "true".to_string(),
            "exit 2".to_string(),
            format!("touch {}", shell_quote(&marker.display().to_string())),
        ];
        assert!(shell()
            .run_all(&commands, &CancellationToken::new())
            .await
            .is_err());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_upload() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("app.conf");
        shell()
            .upload(
                b"listen 8080\n",
                &dest.display().to_string(),
                Some("0600"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "listen 8080\n");
    }

    #[tokio::test]
    async fn test_identity_file_removed_on_drop() {
        let key = IdentityFile::write("-----BEGIN KEY-----\nabc\n-----END KEY-----")
            .await
            .unwrap();
        let path = key.path().to_path_buf();
        assert!(path.exists());
        drop(key);
        assert!(!path.exists());
    }
}
