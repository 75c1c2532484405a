//! Endpoints reloader: merges a routing-config file watch with the
//! EndpointSlice informer, rewrites `routing.json`/the backends file, and
//! triggers Varnish's ghost-reload HTTP endpoint.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::reload::routing::{write_routing_config, RoutingConfig, ServiceEntry};
use crate::reload::watch as fswatch;

const DEBOUNCE: Duration = Duration::from_millis(100);
const GHOST_RELOAD_PATH: &str = "/.varnish-ghost/reload";
const GHOST_ERROR_HEADER: &str = "x-ghost-error";

#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
    pub ready: bool,
}

/// service name -> endpoints sourced from EndpointSlices.
pub type EndpointSet = HashMap<String, Vec<Endpoint>>;

#[derive(Debug, Error)]
pub enum EndpointsError {
    #[error("failed to read routing config file: {0}")]
    ReadRoutingFile(std::io::Error),
    #[error("failed to parse routing config file: {0}")]
    ParseRoutingFile(serde_json::Error),
    #[error("failed to write routing.json: {0}")]
    WriteRoutingFile(std::io::Error),
    #[error("ghost reload trigger failed: {0}")]
    ReloadTrigger(String),
}

pub struct EndpointsReloader {
    routing_source_path: PathBuf,
    routing_output_path: PathBuf,
    varnish_http_addr: String,
    http: reqwest::Client,
    endpoints: Arc<Mutex<EndpointSet>>,
    ready_tx: watch::Sender<bool>,
}

pub struct EndpointsHandle {
    ready_rx: watch::Receiver<bool>,
}

impl EndpointsHandle {
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
}

impl EndpointsReloader {
    pub fn new(routing_source_path: PathBuf, routing_output_path: PathBuf, varnish_http_addr: String) -> (Self, EndpointsHandle) {
        let (ready_tx, ready_rx) = watch::channel(false);
        (
            Self {
                routing_source_path,
                routing_output_path,
                varnish_http_addr,
                http: reqwest::Client::new(),
                endpoints: Arc::new(Mutex::new(HashMap::new())),
                ready_tx,
            },
            EndpointsHandle { ready_rx },
        )
    }

    pub fn endpoint_sink(&self) -> Arc<Mutex<EndpointSet>> {
        self.endpoints.clone()
    }

    /// Replaces the known endpoint set for `service` (called by the
    /// EndpointSlice informer) and triggers a rebuild.
    pub async fn update_endpoints(&self, service: String, endpoints: Vec<Endpoint>) {
        let mut guard = self.endpoints.lock().await;
        guard.insert(service, endpoints);
        drop(guard);
        if let Err(err) = self.reload_once().await {
            warn!(target: "chaperone::reload::endpoints", %err, "endpoints reload failed");
        }
    }

    /// Performs the first reload synchronously at startup, so a pre-existing
    /// routing-source file is picked up even when no fswatch event or
    /// informer update ever fires (e.g. the sidecar variant with no
    /// Kubernetes namespace configured).
    pub async fn initial_load(&self) -> Result<(), EndpointsError> {
        self.reload_once().await
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let dir = self
            .routing_source_path
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let basename = self
            .routing_source_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let (_watcher, mut changes) =
            fswatch::spawn_debounced_watch(dir, move |p| fswatch::basename_matches(p, &basename), DEBOUNCE);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = changes.recv() => {
                    if changed.is_none() {
                        return;
                    }
                    if let Err(err) = self.reload_once().await {
                        warn!(target: "chaperone::reload::endpoints", %err, "endpoints reload failed");
                    }
                }
            }
        }
    }

    async fn reload_once(&self) -> Result<(), EndpointsError> {
        let services = self.read_service_list()?;
        let endpoints = self.endpoints.lock().await.clone();

        self.write_routing_file(&services)?;
        self.write_backends_file(&services, &endpoints)?;
        self.trigger_reload().await?;

        info!(target: "chaperone::reload::endpoints", "endpoints reload complete");
        let _ = self.ready_tx.send(true);
        Ok(())
    }

    fn read_service_list(&self) -> Result<Vec<ServiceEntry>, EndpointsError> {
        if !self.routing_source_path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.routing_source_path).map_err(EndpointsError::ReadRoutingFile)?;
        let config: RoutingConfig = serde_json::from_str(&contents).map_err(EndpointsError::ParseRoutingFile)?;
        match config {
            RoutingConfig::Simple { services } => Ok(services),
            RoutingConfig::Routes(_) => Ok(Vec::new()),
        }
    }

    fn write_routing_file(&self, services: &[ServiceEntry]) -> Result<(), EndpointsError> {
        let config = RoutingConfig::Simple {
            services: services.to_vec(),
        };
        write_routing_config(&self.routing_output_path, &config).map_err(EndpointsError::WriteRoutingFile)
    }

    fn write_backends_file(&self, services: &[ServiceEntry], endpoints: &EndpointSet) -> Result<(), EndpointsError> {
        let backends_path = self.routing_output_path.with_file_name("backends.ini");
        let rendered = render_backends_ini(services, endpoints);
        crate::reload::fsutil::atomic_write(&backends_path, rendered.as_bytes())
            .map_err(EndpointsError::WriteRoutingFile)
    }

    async fn trigger_reload(&self) -> Result<(), EndpointsError> {
        let url = format!("http://{}{}", self.varnish_http_addr, GHOST_RELOAD_PATH);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EndpointsError::ReloadTrigger(e.to_string()))?;

        if resp.status().as_u16() == 200 {
            return Ok(());
        }
        let message = resp
            .headers()
            .get(GHOST_ERROR_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown ghost reload error")
            .to_string();
        Err(EndpointsError::ReloadTrigger(message))
    }
}

/// Only `ready == true` endpoints are emitted downstream; the `Ready`
/// condition's absence is treated as ready at the informer layer, so by the
/// time endpoints reach here `ready` is already resolved.
fn render_backends_ini(services: &[ServiceEntry], endpoints: &EndpointSet) -> String {
    let mut out = String::new();
    for service in services {
        out.push_str(&format!("[{}]\n", service.name));
        if let Some(eps) = endpoints.get(&service.name) {
            for ep in eps.iter().filter(|e| e.ready) {
                out.push_str(&format!("{}:{}\n", ep.ip, ep.port));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_ini_with_only_ready_endpoints() {
        let services = vec![ServiceEntry { name: "svc".to_string(), port: 80 }];
        let mut endpoints = EndpointSet::new();
        endpoints.insert(
            "svc".to_string(),
            vec![
                Endpoint { ip: "10.0.0.1".to_string(), port: 8080, ready: true },
                Endpoint { ip: "10.0.0.2".to_string(), port: 8080, ready: false },
            ],
        );
        let rendered = render_backends_ini(&services, &endpoints);
        assert!(rendered.contains("[svc]"));
        assert!(rendered.contains("10.0.0.1:8080"));
        assert!(!rendered.contains("10.0.0.2:8080"));
    }

    #[test]
    fn renders_empty_section_for_service_with_no_endpoints() {
        let services = vec![ServiceEntry { name: "lonely".to_string(), port: 80 }];
        let endpoints = EndpointSet::new();
        let rendered = render_backends_ini(&services, &endpoints);
        assert_eq!(rendered, "[lonely]\n");
    }
}
