//! Project-list response filter
//!
//! Rewrites the body of `GET …/projects` responses so a user only sees the
//! projects their filter pattern allows. Anything that does not look like
//! the expected JSON array passes through untouched; the filter fails open
//! to stay compatible with future backend schema changes.

use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use crate::http::HttpParser;

/// Rewrite a fully-buffered project-list response for the given user
/// filter. Returns the complete replacement response (head and body), or
/// `None` when the response must pass through untouched.
pub fn filter_project_list(
    response: &HttpParser,
    project: &Regex,
    username: &str,
) -> Option<Vec<u8>> {
    if response.status() != 200 {
        return None;
    }
    let is_json = response
        .header("content-type")
        .map(|v| String::from_utf8_lossy(v).to_ascii_lowercase().contains("json"))
        .unwrap_or(false);
    if !is_json {
        return None;
    }

    let projects: Value = match serde_json::from_slice(response.body()) {
        Ok(value) => value,
        Err(e) => {
            warn!(user = %username, error = %e, "project list is not decodable JSON, passing through");
            return None;
        }
    };
    let Value::Array(entries) = projects else {
        warn!(user = %username, "project list is not a JSON array, passing through");
        return None;
    };
    if entries
        .iter()
        .any(|entry| !matches!(entry.get("name"), Some(Value::String(_))))
    {
        warn!(user = %username, "project entries without a name field, passing through");
        return None;
    }

    let total = entries.len();
    let filtered: Vec<Value> = entries
        .into_iter()
        .filter(|entry| match entry.get("name") {
            Some(Value::String(name)) => project.is_match(name),
            _ => false,
        })
        .collect();
    info!(
        user = %username,
        total,
        allowed = filtered.len(),
        "filtered project library"
    );

    let body = serde_json::to_vec(&Value::Array(filtered)).ok()?;
    let length = body.len().to_string();
    let mut out = response.build_head(
        &["content-length", "transfer-encoding"],
        &[("Content-Length", length.as_bytes())],
    );
    out.extend_from_slice(&body);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    fn response(raw: &[u8]) -> HttpParser {
        let mut parser = HttpParser::new_response(1024 * 1024);
        parser.feed(raw).unwrap();
        parser
    }

    fn pattern(pat: &str) -> Regex {
        let content = format!("[project-filter]\nf1 = \"alice\":\"{}\"\n", pat);
        let config = ProxyConfig::from_ini_str(&content).unwrap();
        config.project_filters[0].project.clone()
    }

    #[test]
    fn keeps_only_matching_projects() {
        let body = br#"[{"name":"ProjectGroup1A"},{"name":"ProjectGroup2B"}]"#;
        let raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut raw = raw.into_bytes();
        raw.extend_from_slice(body);

        let parser = response(&raw);
        assert!(parser.complete());
        let out = filter_project_list(&parser, &pattern("(.*)Group1(.*)"), "alice").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("ProjectGroup1A"));
        assert!(!text.contains("ProjectGroup2B"));

        // The rewritten Content-Length matches the new body.
        let (head, new_body) = text.split_once("\r\n\r\n").unwrap();
        let declared: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared, new_body.len());
    }

    #[test]
    fn preserves_order_of_surviving_entries() {
        let body = br#"[{"name":"B-Group1"},{"name":"skip"},{"name":"A-Group1"}]"#;
        let raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut raw = raw.into_bytes();
        raw.extend_from_slice(body);
        let parser = response(&raw);
        let out = filter_project_list(&parser, &pattern("(.*)Group1"), "alice").unwrap();
        let text = String::from_utf8(out).unwrap();
        let b_pos = text.find("B-Group1").unwrap();
        let a_pos = text.find("A-Group1").unwrap();
        assert!(b_pos < a_pos);
    }

    #[test]
    fn non_200_passes_through() {
        let parser = response(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        assert!(filter_project_list(&parser, &pattern(".*"), "alice").is_none());
    }

    #[test]
    fn non_json_content_type_passes_through() {
        let parser =
            response(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 2\r\n\r\nhi");
        assert!(filter_project_list(&parser, &pattern(".*"), "alice").is_none());
    }

    #[test]
    fn unexpected_json_shape_passes_through() {
        let body = br#"{"not":"an array"}"#;
        let raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut raw = raw.into_bytes();
        raw.extend_from_slice(body);
        let parser = response(&raw);
        assert!(filter_project_list(&parser, &pattern(".*"), "alice").is_none());

        let body = br#"[{"title":"no name field"}]"#;
        let raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut raw = raw.into_bytes();
        raw.extend_from_slice(body);
        let parser = response(&raw);
        assert!(filter_project_list(&parser, &pattern(".*"), "alice").is_none());
    }

    #[test]
    fn chunked_response_is_reframed_with_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n\
                    1b\r\n[{\"name\":\"ProjectGroup1A\"}]\r\n0\r\n\r\n";
        let parser = response(raw);
        assert!(parser.complete());
        let out = filter_project_list(&parser, &pattern("(.*)Group1(.*)"), "alice").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("Transfer-Encoding"));
        assert!(text.contains("Content-Length: "));
        assert!(text.contains("ProjectGroup1A"));
    }
}
