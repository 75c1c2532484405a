//! Parsers for the tabular payloads returned by `vcl.list` and `tls.cert.list`.

use chrono::{NaiveDateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedVclRevision {
    pub name: String,
    pub status: String,
    pub temperature: String,
    pub label_target: Option<String>,
    pub label_count: u32,
    pub return_count: u32,
}

impl ManagedVclRevision {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    pub fn is_label(&self) -> bool {
        self.label_target.is_some()
    }
}

/// Parse one line of `vcl.list` output:
/// `<status> <temperature> - <name> [(<n> label)] [-> <target> (<n> return(vcl))]`
pub fn parse_vcl_list_line(line: &str) -> Option<ManagedVclRevision> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 4 {
        return None;
    }
    let status = tokens[0].to_string();
    let temperature = tokens[1].to_string();
    // tokens[2] is the literal "-" separator.
    let name = tokens[3].to_string();

    let mut label_target = None;
    let mut label_count = 0;
    let mut return_count = 0;

    // Scan from the first token containing '(' to pull out counts.
    if let Some(paren_idx) = tokens.iter().position(|t| t.contains('(')) {
        if let Some(n) = extract_count(tokens[paren_idx]) {
            label_count = n;
        }
        // `-> <target> (<n> return(vcl))` — the arrow precedes the target.
        if let Some(arrow_idx) = tokens.iter().position(|t| *t == "->") {
            if let Some(target) = tokens.get(arrow_idx + 1) {
                label_target = Some((*target).to_string());
            }
            if let Some(ret_idx) = tokens[arrow_idx..].iter().position(|t| t.contains('(')) {
                if let Some(n) = extract_count(tokens[arrow_idx + ret_idx]) {
                    return_count = n;
                }
            }
        }
    }

    Some(ManagedVclRevision {
        name,
        status,
        temperature,
        label_target,
        label_count,
        return_count,
    })
}

fn extract_count(token: &str) -> Option<u32> {
    let start = token.find('(')? + 1;
    let digits: String = token[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

pub fn parse_vcl_list(payload: &str) -> Vec<ManagedVclRevision> {
    payload.lines().filter_map(parse_vcl_list_line).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsCertRecord {
    pub id: String,
    pub frontend: String,
    pub state: String,
    pub hostname: String,
    pub expiration: chrono::NaiveDateTime,
    pub ocsp_stapling: bool,
}

pub fn parse_tls_cert_list(payload: &str) -> Vec<TlsCertRecord> {
    payload
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter(|l| !l.contains("Frontend"))
        .filter_map(parse_tls_cert_line)
        .collect()
}

fn parse_tls_cert_line(line: &str) -> Option<TlsCertRecord> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 10 {
        return None;
    }
    let id = tokens[0].to_string();
    let frontend = tokens[1].to_string();
    let state = tokens[2].to_string();
    let hostname = tokens[3].to_string();

    // Five tokens: "Jan 02 15:04:05 2006 MST"
    let ts_str = tokens[4..9].join(" ");
    let expiration = parse_timestamp(&ts_str).unwrap_or_else(zero_timestamp);

    let ocsp_stapling = tokens[9..]
        .iter()
        .any(|t| t.eq_ignore_ascii_case("enabled") || t.eq_ignore_ascii_case("true"));

    Some(TlsCertRecord {
        id,
        frontend,
        state,
        hostname,
        expiration,
        ocsp_stapling,
    })
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    // Strip the trailing zone abbreviation before parsing; chrono's "%Z" can't
    // round-trip arbitrary abbreviations like "MST" reliably, so parse the
    // numeric fields and ignore the zone name itself (timestamps are
    // advisory/display only, per spec: parse failures leave the zero value).
    let without_zone = s.rsplitn(2, ' ').nth(1)?;
    NaiveDateTime::parse_from_str(&format!("{without_zone} +0000"), "%b %d %H:%M:%S %Y %z").ok()
}

/// The zero value substituted when a timestamp fails to parse; other fields
/// on the record still populate around it.
fn zero_timestamp() -> chrono::NaiveDateTime {
    chrono::DateTime::<Utc>::from_timestamp(0, 0).unwrap().naive_utc()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_active_entry_without_label() {
        let line = "active   auto  -  vcl_20240101_000000_000";
        let rec = parse_vcl_list_line(line).unwrap();
        assert_eq!(rec.name, "vcl_20240101_000000_000");
        assert_eq!(rec.status, "active");
        assert_eq!(rec.label_count, 0);
        assert!(rec.label_target.is_none());
    }

    #[test]
    fn parses_entry_with_label_count() {
        let line = "available auto - vcl_20240101_000000_001 (1 label)";
        let rec = parse_vcl_list_line(line).unwrap();
        assert_eq!(rec.label_count, 1);
        assert!(!rec.is_active());
    }

    #[test]
    fn parses_entry_with_label_target_and_return_count() {
        let line = "available auto - vcl_20240101_000000_002 -> vcl_20240101_000000_000 (3 return(vcl))";
        let rec = parse_vcl_list_line(line).unwrap();
        assert_eq!(rec.label_target.as_deref(), Some("vcl_20240101_000000_000"));
        assert_eq!(rec.return_count, 3);
        assert!(rec.is_label());
    }

    #[test]
    fn missing_parens_mean_zero_counts() {
        let line = "active auto - mybootstrap";
        let rec = parse_vcl_list_line(line).unwrap();
        assert_eq!(rec.label_count, 0);
        assert_eq!(rec.return_count, 0);
    }

    #[test]
    fn parses_multiline_payload() {
        let payload = "active auto - vcl_a\navailable auto - vcl_b (1 label)\n";
        let list = parse_vcl_list(payload);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn tls_cert_list_skips_header_line() {
        let payload = "PEM          Frontend State  Hostname    Not After\n\
                        id1 127.0.0.1:443 active  example.com Jan 02 15:04:05 2026 UTC  enabled\n";
        let recs = parse_tls_cert_list(payload);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].id, "id1");
        assert!(recs[0].ocsp_stapling);
        assert_ne!(recs[0].expiration, zero_timestamp());
    }

    #[test]
    fn tls_cert_list_handles_missing_header() {
        let payload = "id2 127.0.0.1:443 staged example.org Jan 02 15:04:05 2026 UTC  disabled\n";
        let recs = parse_tls_cert_list(payload);
        assert_eq!(recs.len(), 1);
        assert!(!recs[0].ocsp_stapling);
    }

    #[test]
    fn malformed_timestamp_leaves_other_fields_populated() {
        let payload = "id3 127.0.0.1:443 active example.net Xyz 99 99:99:99 9999 UTC enabled\n";
        let recs = parse_tls_cert_list(payload);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].id, "id3");
        assert_eq!(recs[0].expiration, zero_timestamp());
    }
}
