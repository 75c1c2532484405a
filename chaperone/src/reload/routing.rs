//! The `routing.json` data model: HTTPRoute flattening, priority computation
//! and atomic serialization — the external contract consumed by the
//! Varnish-side routing module.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

const HEADER_CAP: usize = 16;
const QUERY_CAP: usize = 16;

const PRIORITY_EXACT: i64 = 100_000;
const PRIORITY_PREFIX_BASE: i64 = 10_000;
const PRIORITY_PREFIX_PER_CHAR: i64 = 100;
const PRIORITY_REGEX: i64 = 5_000;
const PRIORITY_METHOD: i64 = 5_000;
const PRIORITY_PER_HEADER: i64 = 200;
const PRIORITY_PER_QUERY: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathMatchType {
    Exact,
    Prefix,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMatch {
    #[serde(rename = "type")]
    pub match_type: PathMatchType,
    pub value: String,
}

/// One flattened HTTPRoute rule, ready to be sorted and serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub hostname: String,
    #[serde(rename = "pathMatch", skip_serializing_if = "Option::is_none")]
    pub path_match: Option<PathMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(rename = "queryParams", default)]
    pub query_params: Vec<(String, String)>,
    pub service: String,
    pub namespace: String,
    pub port: u16,
    pub weight: u32,
    pub priority: i64,
    #[serde(rename = "ruleIndex")]
    pub rule_index: u32,
}

/// `PathPrefix /` is the Gateway API default and is treated as "no path
/// match" so it doesn't inflate specificity over genuinely unmatched rules.
fn path_priority(path_match: &Option<PathMatch>) -> i64 {
    match path_match {
        Some(PathMatch { match_type: PathMatchType::Exact, .. }) => PRIORITY_EXACT,
        Some(PathMatch { match_type: PathMatchType::Prefix, value }) if value == "/" => 0,
        Some(PathMatch { match_type: PathMatchType::Prefix, value }) => {
            PRIORITY_PREFIX_BASE + PRIORITY_PREFIX_PER_CHAR * value.len() as i64
        }
        Some(PathMatch { match_type: PathMatchType::Regex, .. }) => PRIORITY_REGEX,
        None => 0,
    }
}

pub fn compute_priority(
    path_match: &Option<PathMatch>,
    method: &Option<String>,
    header_count: usize,
    query_count: usize,
) -> i64 {
    let mut priority = path_priority(path_match);
    if method.is_some() {
        priority += PRIORITY_METHOD;
    }
    priority += PRIORITY_PER_HEADER * header_count.min(HEADER_CAP) as i64;
    priority += PRIORITY_PER_QUERY * query_count.min(QUERY_CAP) as i64;
    priority
}

/// Assigns `priority` on every entry and sorts descending by priority, then
/// ascending by rule index, then hostname, service, port.
pub fn flatten_and_sort(mut routes: Vec<RouteEntry>) -> Vec<RouteEntry> {
    for route in &mut routes {
        route.priority = compute_priority(&route.path_match, &route.method, route.headers.len(), route.query_params.len());
    }
    routes.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.rule_index.cmp(&b.rule_index))
            .then(a.hostname.cmp(&b.hostname))
            .then(a.service.cmp(&b.service))
            .then(a.port.cmp(&b.port))
    });
    routes
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub port: u16,
}

/// The routing configuration written to disk; either the simple sidecar
/// service list or the flattened Gateway API route list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoutingConfig {
    Simple { services: Vec<ServiceEntry> },
    Routes(Vec<RouteEntry>),
}

/// Atomically rewrites `path` with `config` as JSON via write-to-temp +
/// rename, permissions 0644.
pub fn write_routing_config(path: &Path, config: &RoutingConfig) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(config)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&json)?;
    tmp.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))?;
    }

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(value: &str) -> Option<PathMatch> {
        Some(PathMatch { match_type: PathMatchType::Exact, value: value.to_string() })
    }

    fn prefix(value: &str) -> Option<PathMatch> {
        Some(PathMatch { match_type: PathMatchType::Prefix, value: value.to_string() })
    }

    fn regex(value: &str) -> Option<PathMatch> {
        Some(PathMatch { match_type: PathMatchType::Regex, value: value.to_string() })
    }

    #[test]
    fn priority_is_monotone_exact_over_prefix_over_regex_over_none() {
        let exact_p = compute_priority(&exact("/x"), &None, 0, 0);
        let prefix_p = compute_priority(&prefix("/x"), &None, 0, 0);
        let regex_p = compute_priority(&regex(".*"), &None, 0, 0);
        let none_p = compute_priority(&None, &None, 0, 0);
        assert!(exact_p > prefix_p);
        assert!(prefix_p > regex_p);
        assert!(regex_p > none_p);
    }

    #[test]
    fn path_prefix_root_counts_as_no_path_match() {
        assert_eq!(path_priority(&prefix("/")), 0);
    }

    #[test]
    fn exact_vs_prefix_matches_scenario_five() {
        let exact_priority = compute_priority(&exact("/x"), &None, 0, 0);
        let prefix_priority = compute_priority(&prefix("/x"), &None, 0, 0);
        assert_eq!(exact_priority, 100_000);
        assert_eq!(prefix_priority, 10_000 + 100 * 2);
        assert!(exact_priority > prefix_priority);
    }

    #[test]
    fn header_and_query_counts_are_capped() {
        let uncapped = compute_priority(&None, &None, 10, 10);
        let capped = compute_priority(&None, &None, 100, 100);
        assert_eq!(uncapped, 200 * 10 + 100 * 10);
        assert_eq!(capped, 200 * 16 + 100 * 16);
    }

    fn entry(hostname: &str, service: &str, rule_index: u32, path_match: Option<PathMatch>) -> RouteEntry {
        RouteEntry {
            hostname: hostname.to_string(),
            path_match,
            method: None,
            headers: vec![],
            query_params: vec![],
            service: service.to_string(),
            namespace: "default".to_string(),
            port: 80,
            weight: 1,
            priority: 0,
            rule_index,
        }
    }

    #[test]
    fn flatten_and_sort_puts_exact_before_prefix() {
        let routes = vec![
            entry("example.com", "svc-a", 0, prefix("/x")),
            entry("example.com", "svc-b", 1, exact("/x")),
        ];
        let sorted = flatten_and_sort(routes);
        assert_eq!(sorted[0].service, "svc-b");
        assert_eq!(sorted[1].service, "svc-a");
    }

    #[test]
    fn ties_break_by_rule_index_then_hostname() {
        let routes = vec![
            entry("b.example.com", "svc", 1, None),
            entry("a.example.com", "svc", 0, None),
        ];
        let sorted = flatten_and_sort(routes);
        assert_eq!(sorted[0].hostname, "a.example.com");
        assert_eq!(sorted[1].hostname, "b.example.com");
    }

    #[test]
    fn write_routing_config_is_atomic_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing.json");
        let config = RoutingConfig::Simple {
            services: vec![ServiceEntry { name: "svc".to_string(), port: 8080 }],
        };
        write_routing_config(&path, &config).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("svc"));
        assert!(contents.contains("8080"));
    }
}
