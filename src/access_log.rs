//! Access logger
//!
//! Writes one line per completed request, independent of the debug logs:
//! timestamp, peer, effective user, request, backend, status, response
//! bytes, duration, and a disposition tag describing how the exchange
//! ended.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Local;
use tracing::{error, info};

/// How a request or connection was concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Exchange completed normally.
    Ok,
    /// A deny rule fired.
    Deny(String),
    /// Authentication failed.
    AuthFail,
    /// No mapping matched and no default server is configured.
    NoBackend,
    /// The backend could not be dialed.
    BackendUnreachable,
    /// The client went away mid-exchange.
    ClientAbort,
    /// The inactivity timer fired.
    IdleTimeout,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Deny(rule) => write!(f, "DENY {}", rule),
            Self::AuthFail => write!(f, "AUTH-FAIL"),
            Self::NoBackend => write!(f, "NO-BACKEND"),
            Self::BackendUnreachable => write!(f, "BACKEND-UNREACHABLE"),
            Self::ClientAbort => write!(f, "CLIENT-ABORT"),
            Self::IdleTimeout => write!(f, "IDLE-TIMEOUT"),
        }
    }
}

/// One completed request.
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub peer: IpAddr,
    pub username: Option<String>,
    pub method: String,
    pub target: String,
    pub backend: Option<String>,
    pub status: Option<u16>,
    pub response_bytes: u64,
    pub duration_ms: u64,
    pub disposition: Disposition,
}

/// Serialized sink for access log lines: an optional append-only file plus
/// a mirrored tracing event.
pub struct AccessLogger {
    file: Mutex<Option<File>>,
}

impl AccessLogger {
    /// Open the logger, appending to `path` when given.
    pub fn open(path: Option<PathBuf>) -> Arc<Self> {
        let file = path.as_ref().and_then(|p| {
            match OpenOptions::new().create(true).append(true).open(p) {
                Ok(f) => {
                    info!("Access log enabled: {:?}", p);
                    Some(f)
                }
                Err(e) => {
                    error!("Failed to open access log file {:?}: {}", p, e);
                    None
                }
            }
        });
        Arc::new(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one line for a completed request.
    pub fn log(&self, entry: &AccessLogEntry) {
        let timestamp = Local::now().format("%d/%b/%Y:%H:%M:%S %z");
        let username = entry.username.as_deref().unwrap_or("-");
        let backend = entry.backend.as_deref().unwrap_or("-");
        let status = match entry.status {
            Some(code) => code.to_string(),
            None => "-".to_string(),
        };

        let line = format!(
            "[{}] {} {} \"{} {}\" {} {} {} {}ms {}\n",
            timestamp,
            entry.peer,
            username,
            entry.method,
            entry.target,
            backend,
            status,
            entry.response_bytes,
            entry.duration_ms,
            entry.disposition,
        );

        if let Ok(mut guard) = self.file.lock() {
            if let Some(ref mut file) = *guard {
                if let Err(e) = file.write_all(line.as_bytes()) {
                    error!("Failed to write access log: {}", e);
                }
            }
        }

        info!(
            target: "access",
            peer = %entry.peer,
            user = username,
            method = %entry.method,
            path = %entry.target,
            backend = backend,
            status = %status,
            bytes = entry.response_bytes,
            duration_ms = entry.duration_ms,
            disposition = %entry.disposition,
            "request"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_tags_render_as_log_tokens() {
        assert_eq!(Disposition::Ok.to_string(), "OK");
        assert_eq!(Disposition::Deny("r1".into()).to_string(), "DENY r1");
        assert_eq!(Disposition::AuthFail.to_string(), "AUTH-FAIL");
        assert_eq!(Disposition::NoBackend.to_string(), "NO-BACKEND");
        assert_eq!(
            Disposition::BackendUnreachable.to_string(),
            "BACKEND-UNREACHABLE"
        );
        assert_eq!(Disposition::ClientAbort.to_string(), "CLIENT-ABORT");
        assert_eq!(Disposition::IdleTimeout.to_string(), "IDLE-TIMEOUT");
    }

    #[test]
    fn logging_without_file_sink_is_a_no_op() {
        let logger = AccessLogger::open(None);
        logger.log(&AccessLogEntry {
            peer: "127.0.0.1".parse().unwrap(),
            username: Some("alice".into()),
            method: "GET".into(),
            target: "/v2/version".into(),
            backend: Some("gns3-1".into()),
            status: Some(200),
            response_bytes: 42,
            duration_ms: 3,
            disposition: Disposition::Ok,
        });
    }
}
