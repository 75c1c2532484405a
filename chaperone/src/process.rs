//! Spawns and supervises the varnishd child process: secret generation,
//! argument assembly, readiness detection and graceful termination.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

const SECRET_LEN: usize = 32;
const TERMINATE_GRACE: Duration = Duration::from_secs(10);
const READY_MARKER: &str = "said Child starts";
const READY_PREFIX: &str = "Info: Child";

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to write secret file: {0}")]
    SecretWrite(std::io::Error),
    #[error("failed to spawn varnishd: {0}")]
    Spawn(std::io::Error),
    #[error("failed to wait on varnishd: {0}")]
    Wait(std::io::Error),
}

/// Generates a fresh secret and writes it to `path` (mode 0600).
pub fn write_secret_file(path: &Path) -> Result<String, ProcessError> {
    let mut bytes = [0u8; SECRET_LEN];
    rand::rng().fill_bytes(&mut bytes);
    let secret = hex::encode(bytes);
    std::fs::write(path, &secret).map_err(ProcessError::SecretWrite)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms).map_err(ProcessError::SecretWrite)?;
    }
    Ok(secret)
}

pub struct VarnishdArgs {
    pub secret_path: PathBuf,
    pub admin_port: u16,
    pub listen: Vec<String>,
    pub storage: Vec<String>,
    pub extra: Vec<String>,
}

impl VarnishdArgs {
    /// Mandated flags come first and cannot be overridden; `extra` is
    /// validated by `Config::validate` before it ever reaches here.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-S".to_string(),
            self.secret_path.display().to_string(),
            "-M".to_string(),
            format!("localhost:{}", self.admin_port),
            "-F".to_string(),
            "-f".to_string(),
            String::new(),
        ];
        for listen in &self.listen {
            args.push("-a".to_string());
            args.push(listen.clone());
        }
        for storage in &self.storage {
            args.push("-s".to_string());
            args.push(storage.clone());
        }
        args.extend(self.extra.iter().cloned());
        args
    }
}

/// Owns the spawned varnishd child and its readiness/log-scanning tasks.
pub struct ProcessManager {
    child: Child,
    ready_rx: watch::Receiver<bool>,
}

impl ProcessManager {
    pub fn spawn(binary: &str, args: &VarnishdArgs) -> Result<Self, ProcessError> {
        let mut cmd = Command::new(binary);
        cmd.args(args.to_args());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;

        let (ready_tx, ready_rx) = watch::channel(false);

        if let Some(stdout) = child.stdout.take() {
            spawn_scanner(stdout, ready_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_scanner(stderr, ready_tx);
        }

        Ok(Self { child, ready_rx })
    }

    /// Resolves once the child's log stream has emitted the readiness marker.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_rx.clone();
        if *rx.borrow() {
            return;
        }
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Sends SIGTERM, waits up to `TERMINATE_GRACE`, then lets the kernel
    /// SIGKILL if the process hasn't exited by then.
    pub async fn terminate(&mut self) -> Result<(), ProcessError> {
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        match timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(target: "chaperone::process", %status, "varnishd exited after SIGTERM");
                Ok(())
            }
            Ok(Err(err)) => Err(ProcessError::Wait(err)),
            Err(_) => {
                warn!(target: "chaperone::process", "varnishd did not exit within grace period, sending SIGKILL");
                if let Some(pid) = self.child.id() {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGKILL);
                    }
                }
                self.child.wait().await.map_err(ProcessError::Wait)?;
                Ok(())
            }
        }
    }

    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, ProcessError> {
        self.child.wait().await.map_err(ProcessError::Wait)
    }
}

fn spawn_scanner<R>(reader: R, ready_tx: watch::Sender<bool>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    info!(target: "chaperone::process", "{line}");
                    if line.starts_with(READY_PREFIX) && line.contains(READY_MARKER) {
                        let _ = ready_tx.send(true);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!(target: "chaperone::process", %err, "log scanner read error");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mandated_args_come_first_and_include_extras() {
        let args = VarnishdArgs {
            secret_path: PathBuf::from("/run/chaperone/secret"),
            admin_port: 6082,
            listen: vec!["0.0.0.0:80".to_string()],
            storage: vec!["malloc,1G".to_string()],
            extra: vec!["-p".to_string(), "thread_pools=2".to_string()],
        }
        .to_args();

        assert_eq!(args[0], "-S");
        assert_eq!(args[1], "/run/chaperone/secret");
        assert_eq!(args[2], "-M");
        assert_eq!(args[3], "localhost:6082");
        assert_eq!(args[4], "-F");
        assert_eq!(args[5], "-f");
        assert_eq!(args[6], "");
        assert!(args.windows(2).any(|w| w == ["-a", "0.0.0.0:80"]));
        assert!(args.windows(2).any(|w| w == ["-s", "malloc,1G"]));
        assert_eq!(args.last(), Some(&"thread_pools=2".to_string()));
    }

    #[test]
    fn secret_file_has_correct_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        let secret = write_secret_file(&path).unwrap();
        // 32 random bytes, hex-encoded.
        assert_eq!(secret.len(), SECRET_LEN * 2);
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk, secret);
    }

    #[tokio::test]
    async fn readiness_fires_on_marker_line() {
        use tokio::io::AsyncWriteExt;
        let (ready_tx, ready_rx) = watch::channel(false);
        let (mut writer, reader) = tokio::io::duplex(1024);
        spawn_scanner(reader, ready_tx);
        writer
            .write_all(b"Info: Child starting\nInfo: Child (12345) said Child starts\n")
            .await
            .unwrap();
        drop(writer);

        let mut rx = ready_rx;
        tokio::time::timeout(Duration::from_secs(1), async {
            while !*rx.borrow() {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn readiness_does_not_fire_on_unrelated_lines() {
        use tokio::io::AsyncWriteExt;
        let (ready_tx, ready_rx) = watch::channel(false);
        let (mut writer, reader) = tokio::io::duplex(1024);
        spawn_scanner(reader, ready_tx);
        writer.write_all(b"Info: something else entirely\n").await.unwrap();
        drop(writer);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!*ready_rx.borrow());
    }
}
