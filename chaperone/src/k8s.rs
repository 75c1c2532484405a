//! Kubernetes informers: the EndpointSlice watch that feeds the endpoints
//! reloader, and the optional VCL ConfigMap watch that feeds the VCL
//! reloader's file-based pipeline via content-hash deduplication.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use futures_util::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::reload::endpoints::{Endpoint, EndpointsReloader};

const RESYNC_INTERVAL: Duration = Duration::from_secs(30);
const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

#[derive(Debug, Error)]
pub enum K8sError {
    #[error("failed to construct kube client: {0}")]
    ClientInit(#[from] kube::Error),
}

pub async fn client() -> Result<Client, K8sError> {
    Ok(Client::try_default().await?)
}

/// Watches EndpointSlices in `namespace`, joins them to `reloader`'s known
/// service set via the `kubernetes.io/service-name` label, and feeds ready
/// endpoints into the endpoints reloader.
pub async fn run_endpointslice_informer(
    client: Client,
    namespace: String,
    reloader: std::sync::Arc<EndpointsReloader>,
    shutdown: CancellationToken,
) {
    let api: Api<EndpointSlice> = Api::namespaced(client, &namespace);
    let cfg = watcher::Config::default().timeout(RESYNC_INTERVAL.as_secs() as u32);
    let mut stream = Box::pin(watcher::watcher(api, cfg).default_backoff());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            next = stream.next() => {
                match next {
                    Some(Ok(Event::Apply(slice))) | Some(Ok(Event::InitApply(slice))) => {
                        handle_slice(&reloader, slice).await;
                    }
                    Some(Ok(Event::Delete(slice))) => {
                        if let Some(service) = service_name(&slice) {
                            reloader.update_endpoints(service, Vec::new()).await;
                        }
                    }
                    Some(Ok(Event::Init)) | Some(Ok(Event::InitDone)) => {}
                    Some(Err(err)) => {
                        warn!(target: "chaperone::k8s", %err, "endpointslice watch error, will retry");
                    }
                    None => return,
                }
            }
        }
    }
}

async fn handle_slice(reloader: &EndpointsReloader, slice: EndpointSlice) {
    let Some(service) = service_name(&slice) else {
        return;
    };

    let mut endpoints = Vec::new();
    for ep in &slice.endpoints {
        let ready = ep
            .conditions
            .as_ref()
            .and_then(|c| c.ready)
            .unwrap_or(true); // absent Ready condition is treated as ready.
        if !ready {
            continue;
        }
        for port in slice.ports.iter().flatten() {
            let Some(port_num) = port.port else { continue };
            for addr in &ep.addresses {
                endpoints.push(Endpoint {
                    ip: addr.clone(),
                    port: port_num as u16,
                    ready: true,
                });
            }
        }
    }

    info!(target: "chaperone::k8s", %service, count = endpoints.len(), "endpointslice update");
    reloader.update_endpoints(service, endpoints).await;
}

fn service_name(slice: &EndpointSlice) -> Option<String> {
    slice
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(SERVICE_NAME_LABEL))
        .cloned()
}

/// Watches a VCL-bearing ConfigMap and writes its content to `vcl_path`
/// whenever the content hash changes, deduplicating spurious
/// resource-version-only updates.
pub async fn run_configmap_informer(
    client: Client,
    namespace: String,
    configmap_name: String,
    vcl_path: PathBuf,
    vcl_key: String,
    shutdown: CancellationToken,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    let cfg = watcher::Config::default()
        .fields(&format!("metadata.name={configmap_name}"))
        .timeout(RESYNC_INTERVAL.as_secs() as u32);
    let mut stream = Box::pin(watcher::watcher(api, cfg).default_backoff());
    let mut last_hash: Option<u64> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            next = stream.next() => {
                match next {
                    Some(Ok(Event::Apply(cm))) | Some(Ok(Event::InitApply(cm))) => {
                        let Some(data) = cm.data.as_ref().and_then(|d| d.get(&vcl_key)) else {
                            continue;
                        };
                        let hash = content_hash(data);
                        if last_hash == Some(hash) {
                            continue;
                        }
                        if let Err(err) = std::fs::write(&vcl_path, data) {
                            error!(target: "chaperone::k8s", %err, "failed writing vcl from configmap");
                            continue;
                        }
                        last_hash = Some(hash);
                        info!(target: "chaperone::k8s", configmap = %configmap_name, "vcl content updated from configmap");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(target: "chaperone::k8s", %err, "configmap watch error, will retry");
                    }
                    None => return,
                }
            }
        }
    }
}

fn content_hash(data: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_distinguishes_payloads() {
        assert_eq!(content_hash("vcl 4.1;"), content_hash("vcl 4.1;"));
        assert_ne!(content_hash("vcl 4.1;"), content_hash("vcl 4.0;"));
    }
}
