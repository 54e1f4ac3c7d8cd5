//! gns3-proxy - Authenticating, filtering reverse proxy for GNS3 backends
//!
//! A proxy that:
//! - Accepts HTTP/1.1 connections (including WebSocket upgrades) from GNS3
//!   clients that believe they talk to a single server
//! - Authenticates users via HTTP Basic credentials or a trusted
//!   downstream-proxy header
//! - Selects one of several backend servers per user through ordered regex
//!   mappings and rewrites credentials for the backend
//! - Enforces deny rules over user, method, URL, headers and body
//! - Filters the project-list response down to each user's allowed projects

pub mod access_log;
pub mod config;
pub mod filter;
pub mod http;
pub mod listener;
pub mod policy;
pub mod worker;

// Re-export commonly used types
pub use access_log::{AccessLogEntry, AccessLogger, Disposition};
pub use config::ProxyConfig;
pub use filter::filter_project_list;
pub use http::{BodyFraming, HttpParseError, HttpParser};
pub use policy::{AuthError, PolicyEngine};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
