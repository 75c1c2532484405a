//! Command-string builders for the varnishadm RPC surface.

use std::fmt;
use std::time::Duration;

/// A typed `param.set` value, formatted per varnishd's parameter grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Bool(bool),
    Float(f64),
    Str(String),
    Duration(Duration),
    /// Size in bytes, formatted with the given unit suffix (e.g. "MB").
    Size(u64, &'static str),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(n) => write!(f, "{n}"),
            ParamValue::Bool(b) => write!(f, "{}", if *b { "on" } else { "off" }),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Str(s) => write!(f, "{s}"),
            ParamValue::Duration(d) => write!(f, "{}s", d.as_secs()),
            ParamValue::Size(n, unit) => write!(f, "{n}{unit}"),
        }
    }
}

pub fn ping() -> String {
    "ping".to_string()
}

pub fn status() -> String {
    "status".to_string()
}

pub fn start() -> String {
    "start".to_string()
}

pub fn stop() -> String {
    "stop".to_string()
}

pub fn vcl_load(name: &str, path: &str) -> String {
    format!("vcl.load {name} {path}")
}

pub fn vcl_use(name: &str) -> String {
    format!("vcl.use {name}")
}

pub fn vcl_label(label: &str, name: &str) -> String {
    format!("vcl.label {label} {name}")
}

pub fn vcl_discard(name: &str) -> String {
    format!("vcl.discard {name}")
}

pub fn vcl_list() -> String {
    "vcl.list".to_string()
}

pub fn param_show(name: &str) -> String {
    format!("param.show {name}")
}

pub fn param_set(name: &str, value: &ParamValue) -> String {
    format!("param.set {name} {value}")
}

pub fn tls_cert_list() -> String {
    "tls.cert.list".to_string()
}

pub fn tls_cert_load(id: &str, path: &str) -> String {
    format!("tls.cert.load {id} {path}")
}

pub fn tls_cert_discard(id: &str) -> String {
    format!("tls.cert.discard {id}")
}

pub fn tls_cert_commit() -> String {
    "tls.cert.commit".to_string()
}

pub fn tls_cert_rollback() -> String {
    "tls.cert.rollback".to_string()
}

pub fn tls_cert_reload(id: &str) -> String {
    format!("tls.cert.reload {id}")
}

pub fn backend_list() -> String {
    "backend.list".to_string()
}
