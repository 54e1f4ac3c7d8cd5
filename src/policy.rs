//! Policy engine: authentication, backend mapping, deny rules
//!
//! All patterns are compiled once at configuration load; the engine only
//! evaluates. Rules keep their file order and the first match wins, both
//! for mappings and for project filters. Deny rules fire when every one of
//! their five patterns matches.

use std::net::IpAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

use crate::config::{DenyRule, ProjectFilterRule, ProxyConfig};
use crate::http::HttpParser;

/// Authentication failures, all answered with 401.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("request carried no Authorization header")]
    Missing,
    #[error("Authorization header is not decodable Basic credentials")]
    BadFormat,
    #[error("unknown user or wrong password")]
    BadCredentials,
}

/// Compiled policy view over the configuration snapshot.
pub struct PolicyEngine {
    config: Arc<ProxyConfig>,
    /// `Basic base64(backend_user:backend_password)`, rendered once.
    backend_auth: Vec<u8>,
}

impl PolicyEngine {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        let credentials = format!("{}:{}", config.backend_user, config.backend_password);
        let backend_auth = format!("Basic {}", BASE64.encode(credentials)).into_bytes();
        Self {
            config,
            backend_auth,
        }
    }

    /// The Authorization value every forwarded request carries.
    pub fn backend_auth_value(&self) -> &[u8] {
        &self.backend_auth
    }

    /// Whether the peer may use the trusted username and real-IP headers.
    pub fn peer_is_trusted(&self, peer: IpAddr) -> bool {
        self.config
            .auth_whitelist
            .iter()
            .any(|net| net.contains(&peer))
    }

    /// Resolve the effective username for a request.
    ///
    /// A whitelisted peer may assert the username through the configured
    /// header; everyone else presents HTTP Basic credentials.
    pub fn authenticate(&self, request: &HttpParser, peer: IpAddr) -> Result<String, AuthError> {
        if self.peer_is_trusted(peer) {
            if let Some(value) = request.header(&self.config.auth_header_name) {
                let username = std::str::from_utf8(value)
                    .map_err(|_| AuthError::BadFormat)?
                    .trim()
                    .to_string();
                if !username.is_empty() {
                    debug!(user = %username, %peer, "accepted trusted header auth");
                    return Ok(username);
                }
            }
        }

        let value = request.header("authorization").ok_or(AuthError::Missing)?;
        let (username, password) = decode_basic(value)?;

        match self.config.users.get(&username) {
            Some(stored) => {
                // Constant-time comparison of the supplied password.
                if password.as_bytes().ct_eq(stored.as_bytes()).into() {
                    Ok(username)
                } else {
                    debug!(user = %username, "wrong password");
                    Err(AuthError::BadCredentials)
                }
            }
            None if self.config.allow_any_user => {
                debug!(user = %username, "accepted unlisted user (allow_any_user)");
                Ok(username)
            }
            None => {
                debug!(user = %username, "user not found in config");
                Err(AuthError::BadCredentials)
            }
        }
    }

    /// Select the backend for an authenticated user: first matching mapping,
    /// then the default server. `None` means no backend is reachable.
    pub fn select_backend(&self, username: &str) -> Option<(String, IpAddr)> {
        for mapping in &self.config.mappings {
            if mapping.user.is_match(username) {
                let entry = self
                    .config
                    .servers
                    .get(&mapping.server)
                    .expect("validated at config load");
                debug!(user = %username, rule = %mapping.id, server = %mapping.server,
                       "mapping matched");
                return Some((mapping.server.clone(), entry.addr));
            }
        }
        self.config.default_server()
    }

    /// Evaluate deny rules in order; returns the first rule that matches on
    /// all five fields. The body is matched best-effort against the
    /// buffered prefix.
    pub fn check_deny(&self, username: &str, request: &HttpParser) -> Option<&DenyRule> {
        if self.config.deny_rules.is_empty() {
            return None;
        }
        let header_block = header_block(request.head_bytes());
        let header_text = String::from_utf8_lossy(header_block);
        let body_text = String::from_utf8_lossy(request.body());

        self.config.deny_rules.iter().find(|rule| {
            rule.user.is_match(username)
                && rule.method.is_match(request.method())
                && rule.url.is_match(request.target_path())
                && rule.header.is_match(&header_text)
                && rule.body.is_match(&body_text)
        })
    }

    /// First project filter whose user pattern matches.
    pub fn project_filter(&self, username: &str) -> Option<&ProjectFilterRule> {
        self.config
            .project_filters
            .iter()
            .find(|filter| filter.user.is_match(username))
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

/// Decode `Basic base64(user:password)` credentials. An empty password is
/// tolerated; the GNS3 GUI sends `user:` during server discovery.
fn decode_basic(value: &[u8]) -> Result<(String, String), AuthError> {
    let text = std::str::from_utf8(value).map_err(|_| AuthError::BadFormat)?;
    let encoded = text
        .trim()
        .strip_prefix("Basic ")
        .or_else(|| text.trim().strip_prefix("basic "))
        .ok_or(AuthError::BadFormat)?;
    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|_| AuthError::BadFormat)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::BadFormat)?;
    let (username, password) = decoded.split_once(':').ok_or(AuthError::BadFormat)?;
    if username.is_empty() {
        return Err(AuthError::BadFormat);
    }
    Ok((username.to_string(), password.to_string()))
}

/// The header block of a raw head section: everything after the start line,
/// without the terminating blank line.
fn header_block(head: &[u8]) -> &[u8] {
    let start = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|pos| pos + 2)
        .unwrap_or(0);
    let end = head.len().saturating_sub(2).max(start);
    &head[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    fn engine(extra: &str) -> PolicyEngine {
        let content = format!(
            r#"
[proxy]
backend_user = admin
backend_password = password
auth_whitelist = 10.0.0.0/24

[servers]
gns3-1 = 127.0.0.1
gns3-2 = 127.0.0.2

[users]
alice = wonder
bob = builder

[mapping]
m1 = "alice":"gns3-1"
m2 = "bob(.*)":"gns3-2"
{extra}
"#
        );
        let config = ProxyConfig::from_ini_str(&content).unwrap();
        PolicyEngine::new(Arc::new(config))
    }

    fn request(raw: &[u8]) -> HttpParser {
        let mut parser = HttpParser::new_request(1024 * 1024);
        parser.feed(raw).unwrap();
        assert!(parser.complete());
        parser
    }

    const PEER: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(192, 0, 2, 1));
    const TRUSTED_PEER: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 7));

    #[test]
    fn backend_auth_is_precomputed() {
        let engine = engine("");
        assert_eq!(engine.backend_auth_value(), b"Basic YWRtaW46cGFzc3dvcmQ=");
    }

    #[test]
    fn basic_auth_accepts_valid_credentials() {
        let engine = engine("");
        // alice:wonder
        let req = request(
            b"GET /v2/version HTTP/1.1\r\nAuthorization: Basic YWxpY2U6d29uZGVy\r\n\r\n",
        );
        assert_eq!(engine.authenticate(&req, PEER).unwrap(), "alice");
    }

    #[test]
    fn basic_auth_rejects_wrong_password() {
        let engine = engine("");
        // alice:nope
        let req =
            request(b"GET / HTTP/1.1\r\nAuthorization: Basic YWxpY2U6bm9wZQ==\r\n\r\n");
        assert_eq!(
            engine.authenticate(&req, PEER).unwrap_err(),
            AuthError::BadCredentials
        );
    }

    #[test]
    fn missing_authorization_is_distinct() {
        let engine = engine("");
        let req = request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(engine.authenticate(&req, PEER).unwrap_err(), AuthError::Missing);
    }

    #[test]
    fn undecodable_authorization_is_bad_format() {
        let engine = engine("");
        let req = request(b"GET / HTTP/1.1\r\nAuthorization: Basic !!!\r\n\r\n");
        assert_eq!(
            engine.authenticate(&req, PEER).unwrap_err(),
            AuthError::BadFormat
        );
    }

    #[test]
    fn unknown_user_rejected_without_allow_any_user() {
        let engine = engine("");
        // mallory:x
        let req = request(b"GET / HTTP/1.1\r\nAuthorization: Basic bWFsbG9yeTp4\r\n\r\n");
        assert_eq!(
            engine.authenticate(&req, PEER).unwrap_err(),
            AuthError::BadCredentials
        );
    }

    #[test]
    fn trusted_header_only_from_whitelisted_peer() {
        let engine = engine("");
        let req = request(b"GET / HTTP/1.1\r\nX-Auth-Username: alice\r\n\r\n");
        assert_eq!(engine.authenticate(&req, TRUSTED_PEER).unwrap(), "alice");
        // Same header from an untrusted peer falls through to Basic auth.
        assert_eq!(engine.authenticate(&req, PEER).unwrap_err(), AuthError::Missing);
    }

    #[test]
    fn mapping_first_match_wins_then_default() {
        let engine = engine("");
        let (name, addr) = engine.select_backend("alice").unwrap();
        assert_eq!(name, "gns3-1");
        assert_eq!(addr, "127.0.0.1".parse::<IpAddr>().unwrap());
        let (name, _) = engine.select_backend("bobby").unwrap();
        assert_eq!(name, "gns3-2");
        assert!(engine.select_backend("carol").is_none());
    }

    #[test]
    fn deny_rule_matches_all_five_fields() {
        let engine = engine("\n[deny]\nr1 = \"alice\":\"DELETE\":\"\":\"\":\"\"\n");
        let req = request(b"DELETE /v2/projects/X HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(engine.check_deny("alice", &req).unwrap().id, "r1");
        // Different method, same rule: no match.
        let req = request(b"GET /v2/projects/X HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(engine.check_deny("alice", &req).is_none());
        // Different user: no match.
        let req = request(b"DELETE /v2/projects/X HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(engine.check_deny("bob", &req).is_none());
    }

    #[test]
    fn deny_rule_can_match_headers_and_body() {
        let engine = engine(
            "\n[deny]\nr2 = \"(.*)\":\"POST\":\"\":\"(?s:.*)X-Danger: yes(?s:.*)\":\"(?s:.*)drop(?s:.*)\"\n",
        );
        let req = request(
            b"POST /v2/x HTTP/1.1\r\nX-Danger: yes\r\nContent-Length: 9\r\n\r\nplz drop!",
        );
        assert_eq!(engine.check_deny("alice", &req).unwrap().id, "r2");
        let req = request(b"POST /v2/x HTTP/1.1\r\nContent-Length: 9\r\n\r\nplz drop!");
        assert!(engine.check_deny("alice", &req).is_none());
    }

    #[test]
    fn project_filter_lookup_by_user() {
        let engine = engine("\n[project-filter]\nf1 = \"ali(.*)\":\"(.*)Group1(.*)\"\n");
        assert!(engine.project_filter("alice").is_some());
        assert!(engine.project_filter("bob").is_none());
    }
}
