//! TLS reloader: watches a certificate directory and runs the
//! list → discard → load → commit transaction on every change, with
//! rollback if any staging step fails.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::admin::commands;
use crate::admin::parsers::parse_tls_cert_list;
use crate::admin::{AdminError, AdminHandle};
use crate::reload::{fatal_channel, report_fatal, watch, FatalError};

const DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum TlsError {
    #[error(transparent)]
    Admin(#[from] AdminError),
    #[error("tls.cert.load failed for {id}: {message}")]
    LoadFailed { id: String, message: String },
    #[error("tls.cert.commit failed: {0}")]
    CommitFailed(String),
}

pub struct TlsReloader {
    admin: AdminHandle,
    cert_dir: PathBuf,
    fatal_tx: mpsc::Sender<FatalError>,
    /// Serializes the whole list→discard→load→commit cycle so reloads never overlap.
    lock: Mutex<()>,
}

impl TlsReloader {
    pub fn new(admin: AdminHandle, cert_dir: PathBuf) -> (Self, mpsc::Receiver<FatalError>) {
        let (fatal_tx, fatal_rx) = fatal_channel();
        (
            Self {
                admin,
                cert_dir,
                fatal_tx,
                lock: Mutex::new(()),
            },
            fatal_rx,
        )
    }

    /// First-run behavior: load all on-disk certs and commit, skipping the
    /// discard step since no prior state exists yet.
    pub async fn initial_load(&self) -> Result<(), TlsError> {
        let _guard = self.lock.lock().await;
        let basenames = self.pem_basenames()?;
        self.stage_loads(&basenames).await?;
        self.commit_or_rollback().await
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let dir = self.cert_dir.clone();
        let (_watcher, mut changes) =
            watch::spawn_debounced_watch(dir, |p| watch::has_extension(p, "pem"), DEBOUNCE);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = changes.recv() => {
                    if changed.is_none() {
                        return;
                    }
                    if let Err(err) = self.reload_once().await {
                        error!(target: "chaperone::reload::tls", %err, "tls reload failed");
                        report_fatal(&self.fatal_tx, "tls", err.to_string());
                    }
                }
            }
        }
    }

    fn pem_basenames(&self) -> Result<Vec<(String, PathBuf)>, TlsError> {
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&self.cert_dir).map_err(|e| TlsError::CommitFailed(e.to_string()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if watch::has_extension(&path, "pem") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    out.push((stem.to_string(), path));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn reload_once(&self) -> Result<(), TlsError> {
        let _guard = self.lock.lock().await;

        let list_resp = self.admin.exec(commands::tls_cert_list()).await?;
        let current = parse_tls_cert_list(&list_resp.payload);

        for record in &current {
            let resp = self.admin.exec(commands::tls_cert_discard(&record.id)).await?;
            if !resp.is_ok() {
                warn!(target: "chaperone::reload::tls", id = %record.id, payload = %resp.payload, "tls.cert.discard failed, continuing");
            }
        }

        let basenames = self.pem_basenames()?;
        if let Err(err) = self.stage_loads(&basenames).await {
            let _ = self.admin.exec(commands::tls_cert_rollback()).await;
            return Err(err);
        }

        self.commit_or_rollback().await?;

        info!(
            target: "chaperone::reload::tls",
            committed = ?basenames.iter().map(|(id, _)| id.clone()).collect::<HashSet<_>>(),
            "tls reload cycle complete"
        );
        Ok(())
    }

    async fn stage_loads(&self, basenames: &[(String, PathBuf)]) -> Result<(), TlsError> {
        for (id, path) in basenames {
            let resp = self
                .admin
                .exec(commands::tls_cert_load(id, &path.display().to_string()))
                .await?;
            if !resp.is_ok() {
                return Err(TlsError::LoadFailed {
                    id: id.clone(),
                    message: resp.payload,
                });
            }
        }
        Ok(())
    }

    async fn commit_or_rollback(&self) -> Result<(), TlsError> {
        let commit_resp = self.admin.exec(commands::tls_cert_commit()).await?;
        if !commit_resp.is_ok() {
            let _ = self.admin.exec(commands::tls_cert_rollback()).await;
            return Err(TlsError::CommitFailed(commit_resp.payload));
        }
        Ok(())
    }
}

#[allow(dead_code)]
fn basename_set(dir: &Path) -> HashSet<String> {
    std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .filter(|e| watch::has_extension(&e.path(), "pem"))
        .filter_map(|e| e.path().file_stem().and_then(|s| s.to_str()).map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_basenames_ignores_non_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.pem"), "").unwrap();
        std::fs::write(dir.path().join("b.pem"), "").unwrap();
        std::fs::write(dir.path().join("readme.txt"), "").unwrap();

        let names = basename_set(dir.path());
        assert_eq!(names.len(), 2);
        assert!(names.contains("a"));
        assert!(names.contains("b"));
    }
}
