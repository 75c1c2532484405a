//! Startup/shutdown orchestrator: the deterministic bootstrap sequence and
//! the signal-driven drain-then-cancel teardown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::admin::{commands, AdminServer};
use crate::config::Config;
use crate::health::{self, HealthState};
use crate::k8s;
use crate::process::{ProcessManager, VarnishdArgs};
use crate::reload::endpoints::EndpointsReloader;
use crate::reload::tls::TlsReloader;
use crate::reload::vcl::VclReloader;

const DRAIN_WINDOW: Duration = Duration::from_secs(10);

pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    std::fs::create_dir_all(&config.work_dir)?;
    let secret_path = PathBuf::from(&config.work_dir).join("_secret");
    let secret = crate::process::write_secret_file(&secret_path)?;

    let admin_addr = format!("0.0.0.0:{}", config.varnish_admin_port);
    let (admin_server, admin) = AdminServer::bind(&admin_addr, secret).await?;

    let root_token = CancellationToken::new();
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(admin_server.run(root_token.child_token())));

    let mut listen = config.varnish_listen.clone();
    if let Some(tls_listen) = config.varnish_tls_listen.clone() {
        listen.push(tls_listen);
    }
    let varnishd_args = VarnishdArgs {
        secret_path,
        admin_port: config.varnish_admin_port,
        listen,
        storage: config.varnish_storage.clone(),
        extra: config.varnishd_extra_args.clone(),
    };
    let mut process = ProcessManager::spawn("varnishd", &varnishd_args)?;

    info!(target: "chaperone::orchestrator", "waiting for varnishd to connect to the admin channel");
    admin.wait_connected().await;

    let (vcl_reloader, mut vcl_fatal_rx) =
        VclReloader::new(admin.clone(), PathBuf::from(&config.vcl_path), crate::reload::vcl::DEFAULT_KEEP_COUNT);
    vcl_reloader.initial_load().await.map_err(|e| anyhow::anyhow!("initial vcl load failed: {e}"))?;

    let start_resp = admin.exec(commands::start()).await?;
    if !start_resp.is_ok() {
        anyhow::bail!("admin 'start' command failed: {}", start_resp.payload);
    }

    info!(target: "chaperone::orchestrator", "waiting for varnishd readiness marker");
    process.wait_ready().await;

    let vcl_reloader = Arc::new(vcl_reloader);
    {
        let vcl_reloader = vcl_reloader.clone();
        let token = root_token.child_token();
        tasks.push(tokio::spawn(async move { vcl_reloader.run(token).await }));
    }

    let (_tls_reloader, mut tls_fatal_rx) = if config.tls_enabled() {
        let (reloader, fatal_rx) = TlsReloader::new(admin.clone(), PathBuf::from(config.tls_cert_dir.clone().unwrap()));
        reloader
            .initial_load()
            .await
            .map_err(|e| anyhow::anyhow!("initial tls load failed: {e}"))?;
        let reloader = Arc::new(reloader);
        {
            let reloader = reloader.clone();
            let token = root_token.child_token();
            tasks.push(tokio::spawn(async move { reloader.run(token).await }));
        }
        (Some(reloader), Some(fatal_rx))
    } else {
        (None, None)
    };

    let routing_source = PathBuf::from(&config.ghost_config_path).with_file_name("routing-source.json");
    let (endpoints_reloader, endpoints_handle) = EndpointsReloader::new(
        routing_source,
        PathBuf::from(&config.ghost_config_path),
        config.varnish_http_addr.clone(),
    );
    let endpoints_reloader = Arc::new(endpoints_reloader);
    endpoints_reloader
        .initial_load()
        .await
        .map_err(|e| anyhow::anyhow!("initial endpoints reload failed: {e}"))?;
    {
        let endpoints_reloader = endpoints_reloader.clone();
        let token = root_token.child_token();
        tasks.push(tokio::spawn(async move { endpoints_reloader.run(token).await }));
    }

    if let Some(namespace) = config.namespace.clone() {
        match k8s::client().await {
            Ok(client) => {
                let reloader = endpoints_reloader.clone();
                let token = root_token.child_token();
                let ns = namespace.clone();
                tasks.push(tokio::spawn(async move {
                    k8s::run_endpointslice_informer(client, ns, reloader, token).await
                }));

                if let Some(configmap_name) = config.configmap_name.clone() {
                    match k8s::client().await {
                        Ok(cm_client) => {
                            let token = root_token.child_token();
                            let vcl_path = PathBuf::from(&config.vcl_path);
                            tasks.push(tokio::spawn(async move {
                                k8s::run_configmap_informer(
                                    cm_client,
                                    namespace,
                                    configmap_name,
                                    vcl_path,
                                    "default.vcl".to_string(),
                                    token,
                                )
                                .await
                            }));
                        }
                        Err(err) => warn!(target: "chaperone::orchestrator", %err, "failed to start configmap informer"),
                    }
                }
            }
            Err(err) => {
                warn!(target: "chaperone::orchestrator", %err, "failed to construct kube client, endpoint informer disabled");
            }
        }
    }

    info!(target: "chaperone::orchestrator", "waiting for first endpoints reload");
    endpoints_handle.wait_ready().await;

    let health = HealthState::new();
    health.set_ready().await;

    let health_router = health::router(health.clone(), admin.clone());
    let health_listener = tokio::net::TcpListener::bind(&config.health_addr).await?;
    {
        let token = root_token.child_token();
        tasks.push(tokio::spawn(async move {
            let _ = axum::serve(health_listener, health_router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
        }));
    }

    info!(target: "chaperone::orchestrator", "startup sequence complete, chaperone is ready");

    let exit_code = wait_for_shutdown(health.clone(), &mut vcl_fatal_rx, &mut tls_fatal_rx).await;

    root_token.cancel();
    if let Err(err) = process.terminate().await {
        warn!(target: "chaperone::orchestrator", %err, "error terminating varnishd");
    }
    for task in tasks {
        let _ = task.await;
    }

    if exit_code != 0 {
        anyhow::bail!("chaperone exiting with code {exit_code}");
    }
    Ok(())
}

/// Waits for a terminal signal or a fatal reload error, drains, then
/// returns the exit code the process should use. A fatal VCL or TLS reload
/// error terminates the process the same way (spec §4.6: "fatal-error
/// channel semantics match the VCL reloader").
async fn wait_for_shutdown(
    health: HealthState,
    vcl_fatal_rx: &mut tokio::sync::mpsc::Receiver<crate::reload::FatalError>,
    tls_fatal_rx: &mut Option<tokio::sync::mpsc::Receiver<crate::reload::FatalError>>,
) -> i32 {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    let exit_code = tokio::select! {
        _ = sigterm.recv() => {
            info!(target: "chaperone::orchestrator", "received SIGTERM");
            0
        }
        _ = sigint.recv() => {
            info!(target: "chaperone::orchestrator", "received SIGINT");
            0
        }
        fatal = vcl_fatal_rx.recv() => {
            if let Some(err) = fatal {
                error!(target: "chaperone::orchestrator", %err, "fatal vcl error, shutting down");
            }
            1
        }
        fatal = recv_optional(tls_fatal_rx) => {
            if let Some(err) = fatal {
                error!(target: "chaperone::orchestrator", %err, "fatal tls error, shutting down");
            }
            1
        }
    };

    health.set_draining().await;
    tokio::time::sleep(DRAIN_WINDOW).await;
    exit_code
}

/// Awaits `rx` if present; never resolves when `rx` is `None`, so a
/// disabled channel can still sit in a `select!` branch without firing.
async fn recv_optional(
    rx: &mut Option<tokio::sync::mpsc::Receiver<crate::reload::FatalError>>,
) -> Option<crate::reload::FatalError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
