//! VCL reloader: directory watch over the VCL file, debounced reload
//! transaction (load → use → garbage-collect superseded revisions).

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::admin::commands;
use crate::admin::parsers::{parse_vcl_list, ManagedVclRevision};
use crate::admin::{AdminError, AdminHandle};
use crate::reload::{fatal_channel, report_fatal, watch, FatalError};

const DEBOUNCE: Duration = Duration::from_millis(100);
const MANAGED_PREFIX: &str = "vcl_";
pub const DEFAULT_KEEP_COUNT: usize = 3;

#[derive(Debug, Error)]
pub enum VclError {
    #[error(transparent)]
    Admin(#[from] AdminError),
    #[error("vcl.load failed: {0}")]
    LoadFailed(String),
    #[error("vcl.use failed: {0}")]
    UseFailed(String),
}

pub struct VclReloader {
    admin: AdminHandle,
    vcl_path: PathBuf,
    keep_count: usize,
    fatal_tx: mpsc::Sender<FatalError>,
}

impl VclReloader {
    pub fn new(admin: AdminHandle, vcl_path: PathBuf, keep_count: usize) -> (Self, mpsc::Receiver<FatalError>) {
        let (fatal_tx, fatal_rx) = fatal_channel();
        (
            Self {
                admin,
                vcl_path,
                keep_count,
                fatal_tx,
            },
            fatal_rx,
        )
    }

    fn basename(&self) -> String {
        self.vcl_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string()
    }

    /// Performs the initial load at startup (no prior watch event). Errors
    /// here are fatal to startup per the orchestrator's sequencing.
    pub async fn initial_load(&self) -> Result<(), VclError> {
        self.reload_once().await
    }

    /// Runs the debounced watch loop until `shutdown` fires. Compilation
    /// errors are reported on the fatal-error channel rather than returned,
    /// since this loop runs for the life of the process.
    pub async fn run(&self, shutdown: CancellationToken) {
        let dir = self
            .vcl_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let basename = self.basename();
        let (_watcher, mut changes) = watch::spawn_debounced_watch(
            dir,
            move |p| watch::basename_matches(p, &basename),
            DEBOUNCE,
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = changes.recv() => {
                    if changed.is_none() {
                        return;
                    }
                    if let Err(err) = self.reload_once().await {
                        match &err {
                            VclError::LoadFailed(_) => {
                                report_fatal(&self.fatal_tx, "vcl", err.to_string());
                            }
                            _ => {
                                error!(target: "chaperone::reload::vcl", %err, "vcl reload failed");
                            }
                        }
                    }
                }
            }
        }
    }

    async fn reload_once(&self) -> Result<(), VclError> {
        let name = format!("vcl_{}", Utc::now().format("%Y%m%d_%H%M%S_%3f"));
        let path = self.vcl_path.display().to_string();

        let load_resp = self.admin.exec(commands::vcl_load(&name, &path)).await?;
        if !load_resp.is_ok() {
            return Err(VclError::LoadFailed(load_resp.payload));
        }

        let use_resp = self.admin.exec(commands::vcl_use(&name)).await?;
        if !use_resp.is_ok() {
            return Err(VclError::UseFailed(use_resp.payload));
        }

        info!(target: "chaperone::reload::vcl", %name, "vcl reload transaction complete");

        if let Err(err) = self.garbage_collect().await {
            warn!(target: "chaperone::reload::vcl", %err, "vcl garbage collection failed");
        }

        Ok(())
    }

    async fn garbage_collect(&self) -> Result<(), VclError> {
        let resp = self.admin.exec(commands::vcl_list()).await?;
        let mut revisions = parse_vcl_list(&resp.payload);
        revisions.retain(|r| is_gc_candidate(r));
        revisions.sort_by(|a, b| a.name.cmp(&b.name));

        while revisions.len() > self.keep_count {
            let oldest = revisions.remove(0);
            let discard_resp = self.admin.exec(commands::vcl_discard(&oldest.name)).await?;
            if !discard_resp.is_ok() {
                warn!(target: "chaperone::reload::vcl", name = %oldest.name, payload = %discard_resp.payload, "vcl.discard failed");
            }
        }
        Ok(())
    }
}

fn is_gc_candidate(r: &ManagedVclRevision) -> bool {
    r.name.starts_with(MANAGED_PREFIX) && !r.is_active() && !r.is_label()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(name: &str, active: bool, label: bool) -> ManagedVclRevision {
        ManagedVclRevision {
            name: name.to_string(),
            status: if active { "active".into() } else { "available".into() },
            temperature: "auto".into(),
            label_target: if label { Some("target".into()) } else { None },
            label_count: 0,
            return_count: 0,
        }
    }

    #[test]
    fn gc_candidate_excludes_active_and_labels_and_unmanaged_names() {
        assert!(is_gc_candidate(&rev("vcl_20240101_000000_000", false, false)));
        assert!(!is_gc_candidate(&rev("vcl_20240101_000000_000", true, false)));
        assert!(!is_gc_candidate(&rev("vcl_20240101_000000_001", false, true)));
        assert!(!is_gc_candidate(&rev("operator_managed", false, false)));
    }

    #[test]
    fn gc_sorts_lexicographically_which_is_chronological() {
        let mut revs = vec![
            rev("vcl_20240103_000000_000", false, false),
            rev("vcl_20240101_000000_000", false, false),
            rev("vcl_20240102_000000_000", false, false),
        ];
        revs.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(revs[0].name, "vcl_20240101_000000_000");
        assert_eq!(revs[2].name, "vcl_20240103_000000_000");
    }

    #[test]
    fn keep_count_default_is_three() {
        assert_eq!(DEFAULT_KEEP_COUNT, 3);
    }
}
