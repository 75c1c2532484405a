//! Startup configuration, parsed from CLI flags with environment fallbacks.

use clap::Parser;

const FORBIDDEN_EXTRA_ARG_PREFIXES: &[&str] = &["-M", "-S", "-F", "-f", "-n"];

#[derive(Debug, Clone, Parser)]
#[command(name = "chaperone", about = "Kubernetes sidecar supervisor for Varnish")]
pub struct Config {
    /// Port the admin server listens on for the inbound varnishd management connection.
    #[clap(long, env = "VARNISH_ADMIN_PORT", default_value_t = 6082)]
    pub varnish_admin_port: u16,

    /// Scratch directory for the secret file and other runtime state.
    #[clap(long, env = "WORK_DIR", default_value = "/var/run/chaperone")]
    pub work_dir: String,

    /// Directory containing the VCL file (watched, not the file itself).
    #[clap(long, env = "VARNISH_DIR", default_value = "/etc/varnish")]
    pub varnish_dir: String,

    /// Address Varnish's HTTP listener binds, used for the ghost reload trigger.
    #[clap(long, env = "VARNISH_HTTP_ADDR", default_value = "127.0.0.1:8080")]
    pub varnish_http_addr: String,

    /// `-a` argument(s) passed to varnishd, semicolon-separated.
    #[clap(long, env = "VARNISH_LISTEN", value_delimiter = ';')]
    pub varnish_listen: Vec<String>,

    /// `-s` storage argument(s) passed to varnishd, semicolon-separated.
    #[clap(long, env = "VARNISH_STORAGE", value_delimiter = ';')]
    pub varnish_storage: Vec<String>,

    /// Additional varnishd arguments, semicolon-separated. Must not override
    /// chaperone-mandated flags.
    #[clap(long, env = "VARNISHD_EXTRA_ARGS", value_delimiter = ';')]
    pub varnishd_extra_args: Vec<String>,

    /// Path to the ghost routing config consumed by the Varnish-side module.
    #[clap(long, env = "GHOST_CONFIG_PATH", default_value = "/etc/varnish/routing.json")]
    pub ghost_config_path: String,

    /// Path to the VCL file, fed by the file watcher and/or the ConfigMap informer.
    #[clap(long, env = "VCL_PATH", default_value = "/etc/varnish/default.vcl")]
    pub vcl_path: String,

    /// Kubernetes namespace to watch for EndpointSlices and the VCL ConfigMap.
    #[clap(long, env = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Name of the ConfigMap carrying VCL source, if the ConfigMap-sourced path is used.
    #[clap(long, env = "CONFIGMAP_NAME")]
    pub configmap_name: Option<String>,

    /// Directory of `.pem` files watched by the TLS reloader.
    #[clap(long, env = "TLS_CERT_DIR")]
    pub tls_cert_dir: Option<String>,

    /// `-a` TLS listen argument, when TLS is configured.
    #[clap(long, env = "VARNISH_TLS_LISTEN")]
    pub varnish_tls_listen: Option<String>,

    /// Bind address for the health HTTP surface.
    #[clap(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:9090")]
    pub health_addr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("VARNISHD_EXTRA_ARGS entry {0:?} overrides a chaperone-mandated flag")]
    ForbiddenExtraArg(String),
}

impl Config {
    /// Validate cross-field invariants that clap's derive can't express, notably
    /// that operator-supplied extra args can't clobber the mandated varnishd flags.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for arg in &self.varnishd_extra_args {
            if FORBIDDEN_EXTRA_ARG_PREFIXES
                .iter()
                .any(|prefix| arg.starts_with(prefix))
            {
                return Err(ConfigError::ForbiddenExtraArg(arg.clone()));
            }
        }
        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_dir.is_some()
    }

    pub fn configmap_source_enabled(&self) -> bool {
        self.namespace.is_some() && self.configmap_name.is_some()
    }
}
