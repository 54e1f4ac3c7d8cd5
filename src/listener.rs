//! Listening socket setup and accept loop
//!
//! Binding is separated from serving so startup can report a bind failure
//! with its own exit code. Each accepted client is handed to a fresh worker
//! task; accept errors never stop the loop, but running out of file
//! descriptors backs off briefly instead of spinning.

use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::access_log::AccessLogger;
use crate::config::ProxyConfig;
use crate::policy::PolicyEngine;
use crate::worker;

/// Backoff after an out-of-descriptors accept failure.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Raise the soft RLIMIT_NOFILE toward the configured target. Best effort:
/// refusal is logged and startup continues.
#[cfg(unix)]
pub fn set_open_file_limit(limit: u64) {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: plain struct out-parameter, no aliasing.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        warn!("getrlimit(RLIMIT_NOFILE) failed, keeping current limit");
        return;
    }
    if rlim.rlim_cur >= limit {
        return;
    }
    let target = limit.min(rlim.rlim_max);
    let new_rlim = libc::rlimit {
        rlim_cur: target,
        rlim_max: rlim.rlim_max,
    };
    // SAFETY: passing a valid rlimit struct.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &new_rlim) } == 0 {
        info!("Open file descriptor soft limit set to {}", target);
    } else {
        warn!(
            "Failed to raise open file descriptor limit to {}, continuing with {}",
            target, rlim.rlim_cur
        );
    }
}

#[cfg(not(unix))]
pub fn set_open_file_limit(_limit: u64) {}

/// Bind the listening socket with the configured backlog.
pub fn bind(config: &ProxyConfig) -> std::io::Result<TcpListener> {
    let addr = config.socket_addr();
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog as i32)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Accept loop: one worker task per client, forever.
pub async fn run(
    listener: TcpListener,
    config: Arc<ProxyConfig>,
    policy: Arc<PolicyEngine>,
    access_log: Arc<AccessLogger>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted client connection");
                let config = config.clone();
                let policy = policy.clone();
                let access_log = access_log.clone();
                tokio::spawn(async move {
                    worker::handle_connection(stream, peer, config, policy, access_log).await;
                });
            }
            Err(e) if out_of_descriptors(&e) => {
                warn!("accept failed ({}), backing off {:?}", e, ACCEPT_BACKOFF);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
            Err(e) => {
                warn!("accept failed: {}", e);
            }
        }
    }
}

#[cfg(unix)]
fn out_of_descriptors(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

#[cfg(not(unix))]
fn out_of_descriptors(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(24)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_uses_configured_address() {
        let config = ProxyConfig {
            bind_addr: "127.0.0.1".parse().unwrap(),
            bind_port: 0,
            ..ProxyConfig::default()
        };
        let listener = bind(&config).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert!(addr.port() > 0);
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let config = ProxyConfig {
            bind_addr: "127.0.0.1".parse().unwrap(),
            bind_port: 0,
            ..ProxyConfig::default()
        };
        let first = bind(&config).unwrap();
        let taken = first.local_addr().unwrap();
        // SO_REUSEADDR does not allow two live listeners on the same port.
        let config = ProxyConfig {
            bind_addr: taken.ip(),
            bind_port: taken.port(),
            ..ProxyConfig::default()
        };
        assert!(bind(&config).is_err());
    }
}
