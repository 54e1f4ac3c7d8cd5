//! Per-connection proxy worker
//!
//! Each accepted client gets one worker task running a single-flight state
//! machine: read the request head, authenticate and authorize, dial (or
//! reuse) the user's backend, forward the rewritten request, then relay the
//! response. Upgraded connections (101) drop into an opaque byte splice.
//! After a clean exchange the worker loops back for the next request on the
//! same sockets.
//!
//! All failures are handled here: each one turns into at most one HTTP
//! error response plus exactly one access log line. Nothing escapes to the
//! process level.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::access_log::{AccessLogEntry, AccessLogger, Disposition};
use crate::config::ProxyConfig;
use crate::filter::filter_project_list;
use crate::http::{BodyFraming, HttpParseError, HttpParser};
use crate::policy::{AuthError, PolicyEngine};

/// Timeout for receiving a complete request head.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for establishing the backend connection.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const BAD_REQUEST_RESPONSE: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 11\r\nConnection: close\r\n\r\nBad Request";
const UNAUTHORIZED_RESPONSE: &[u8] = b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"GNS3\"\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const FORBIDDEN_RESPONSE: &[u8] =
    b"HTTP/1.1 403 Forbidden\r\nContent-Length: 9\r\nConnection: close\r\n\r\nForbidden";
const BAD_GATEWAY_RESPONSE: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 11\r\nConnection: close\r\n\r\nBad Gateway";
const GATEWAY_TIMEOUT_RESPONSE: &[u8] = b"HTTP/1.1 504 Gateway Timeout\r\nContent-Length: 15\r\nConnection: close\r\n\r\nGateway Timeout";

/// Connection-local failures.
#[derive(Debug, Error)]
enum WorkerError {
    #[error("client closed the connection")]
    ClientAbort,
    #[error("malformed request: {0}")]
    ClientProtocol(HttpParseError),
    #[error("malformed response from backend: {0}")]
    BackendProtocol(HttpParseError),
    #[error("{0}")]
    Auth(AuthError),
    #[error("deny rule {0} matched")]
    Deny(String),
    #[error("no mapping matched and no default server is configured")]
    NoBackend,
    #[error("backend dial failed: {0}")]
    Dial(std::io::Error),
    #[error("backend dial timed out")]
    DialTimeout,
    #[error("timed out reading request head")]
    HeadTimeout,
    #[error("inactivity timeout")]
    IdleTimeout,
    #[error("backend closed mid-exchange")]
    BackendClosed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Canned response, status and log tag for this failure.
    fn reply(&self) -> (Option<&'static [u8]>, Option<u16>, Disposition) {
        match self {
            Self::ClientAbort | Self::Io(_) => (None, None, Disposition::ClientAbort),
            Self::ClientProtocol(_) => {
                (Some(BAD_REQUEST_RESPONSE), Some(400), Disposition::ClientAbort)
            }
            Self::BackendProtocol(_) | Self::BackendClosed => (
                Some(BAD_GATEWAY_RESPONSE),
                Some(502),
                Disposition::BackendUnreachable,
            ),
            Self::Auth(_) => (Some(UNAUTHORIZED_RESPONSE), Some(401), Disposition::AuthFail),
            Self::Deny(rule) => (
                Some(FORBIDDEN_RESPONSE),
                Some(403),
                Disposition::Deny(rule.clone()),
            ),
            Self::NoBackend => (Some(BAD_GATEWAY_RESPONSE), Some(502), Disposition::NoBackend),
            Self::Dial(_) => (
                Some(BAD_GATEWAY_RESPONSE),
                Some(502),
                Disposition::BackendUnreachable,
            ),
            Self::DialTimeout => (
                Some(GATEWAY_TIMEOUT_RESPONSE),
                Some(504),
                Disposition::BackendUnreachable,
            ),
            Self::HeadTimeout => (
                Some(GATEWAY_TIMEOUT_RESPONSE),
                Some(504),
                Disposition::IdleTimeout,
            ),
            Self::IdleTimeout => (
                Some(GATEWAY_TIMEOUT_RESPONSE),
                Some(504),
                Disposition::IdleTimeout,
            ),
        }
    }
}

/// How a finished exchange leaves the connection.
enum Outcome {
    /// Both sides allow reuse; serve the next request.
    KeepAlive,
    /// The exchange completed but the connection must close.
    Close,
    /// The client closed between requests without starting a new one.
    CleanIdle,
}

/// Per-request bookkeeping for the access log.
struct Exchange {
    started: Instant,
    username: Option<String>,
    method: String,
    target: String,
    backend: Option<String>,
    status: Option<u16>,
    bytes_to_client: u64,
    /// Response bytes already flushed to the client; suppresses error
    /// responses once set.
    response_started: bool,
}

impl Exchange {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            username: None,
            method: String::new(),
            target: String::new(),
            backend: None,
            status: None,
            bytes_to_client: 0,
            response_started: false,
        }
    }
}

/// Established backend connection, kept across keep-alive requests.
struct Backend {
    stream: TcpStream,
    addr: IpAddr,
}

struct Worker {
    client: TcpStream,
    peer: SocketAddr,
    config: Arc<ProxyConfig>,
    policy: Arc<PolicyEngine>,
    backend: Option<Backend>,
    request: HttpParser,
    response: HttpParser,
}

/// Entry point: own the accepted client for its whole lifetime.
pub async fn handle_connection(
    client: TcpStream,
    peer: SocketAddr,
    config: Arc<ProxyConfig>,
    policy: Arc<PolicyEngine>,
    access_log: Arc<AccessLogger>,
) {
    let request = HttpParser::new_request(config.deny_body_limit);
    let response = HttpParser::new_response(0);
    let mut worker = Worker {
        client,
        peer,
        config,
        policy,
        backend: None,
        request,
        response,
    };

    loop {
        let mut exchange = Exchange::new();
        match worker.serve_one(&mut exchange).await {
            Ok(Outcome::KeepAlive) => {
                worker.log(&access_log, exchange, Disposition::Ok);
                worker.request.reset();
                worker.response.reset();
                continue;
            }
            Ok(Outcome::Close) => {
                worker.log(&access_log, exchange, Disposition::Ok);
            }
            Ok(Outcome::CleanIdle) => {}
            Err(e) => {
                debug!(peer = %worker.peer, error = %e, "closing connection");
                let (response, status, disposition) = e.reply();
                if let Some(body) = response {
                    if !exchange.response_started {
                        exchange.status = status;
                        exchange.bytes_to_client += body.len() as u64;
                        let _ = worker.client.write_all(body).await;
                    }
                }
                worker.log(&access_log, exchange, disposition);
            }
        }
        break;
    }

    let _ = worker.client.shutdown().await;
}

impl Worker {
    async fn serve_one(&mut self, exchange: &mut Exchange) -> Result<Outcome, WorkerError> {
        // READ_REQUEST_HEAD
        match self.read_request_head().await? {
            false => return Ok(Outcome::CleanIdle),
            true => {}
        }
        exchange.started = Instant::now();
        exchange.method = self.request.method().to_string();
        exchange.target = self.request.target().to_string();

        // Deny rules may need the body; buffer its prefix before deciding.
        if !self.config.deny_rules.is_empty() {
            self.prefetch_request_body().await?;
        }

        // AUTHORIZE
        let username = self
            .policy
            .authenticate(&self.request, self.peer.ip())
            .map_err(WorkerError::Auth)?;
        exchange.username = Some(username.clone());

        if let Some(rule) = self.policy.check_deny(&username, &self.request) {
            warn!(user = %username, rule = %rule.id, method = %self.request.method(),
                  target = %self.request.target(), "request denied");
            return Err(WorkerError::Deny(rule.id.clone()));
        }

        let (backend_name, backend_addr) = self
            .policy
            .select_backend(&username)
            .ok_or(WorkerError::NoBackend)?;
        exchange.backend = Some(backend_name.clone());

        // DIAL_BACKEND
        self.ensure_backend(&backend_name, backend_addr).await?;

        // FORWARD_REQUEST
        self.forward_request().await?;

        // TUNNEL_OR_FILTER
        let filter = if self.request.method() == "GET"
            && self.request.target_path().ends_with("/projects")
        {
            self.policy.project_filter(&username).cloned()
        } else {
            None
        };
        self.relay_response(exchange, filter, &username).await
    }

    /// Read until the request head is complete. Returns `false` when the
    /// client closed cleanly before sending anything.
    async fn read_request_head(&mut self) -> Result<bool, WorkerError> {
        // A pipelined request may already be sitting in the buffer.
        self.request.advance().map_err(WorkerError::ClientProtocol)?;

        let mut buf = vec![0u8; self.config.client_recvbuf];
        while !self.request.head_complete() {
            let had_bytes = self.request.has_buffered();
            let n = timeout(HEAD_READ_TIMEOUT, self.client.read(&mut buf))
                .await
                .map_err(|_| WorkerError::HeadTimeout)??;
            if n == 0 {
                if had_bytes {
                    return Err(WorkerError::ClientAbort);
                }
                return Ok(false);
            }
            self.request
                .feed(&buf[..n])
                .map_err(WorkerError::ClientProtocol)?;
        }
        Ok(true)
    }

    /// Buffer the request body prefix (up to the deny ceiling) so deny body
    /// patterns see it. Larger bodies are matched best-effort against what
    /// fits.
    async fn prefetch_request_body(&mut self) -> Result<(), WorkerError> {
        let mut buf = vec![0u8; self.config.client_recvbuf];
        while !self.request.complete() && self.request.body().len() < self.config.deny_body_limit {
            let n = timeout(HEAD_READ_TIMEOUT, self.client.read(&mut buf))
                .await
                .map_err(|_| WorkerError::HeadTimeout)??;
            if n == 0 {
                return Err(WorkerError::ClientAbort);
            }
            self.request
                .feed(&buf[..n])
                .map_err(WorkerError::ClientProtocol)?;
        }
        Ok(())
    }

    /// Connect the backend, or keep the one dialed for the previous request
    /// on this connection (same user, same mapping, same backend).
    async fn ensure_backend(&mut self, name: &str, addr: IpAddr) -> Result<(), WorkerError> {
        if let Some(ref backend) = self.backend {
            if backend.addr == addr {
                return Ok(());
            }
            self.backend = None;
        }
        let target = SocketAddr::new(addr, self.config.backend_port);
        debug!(backend = %name, %target, "dialing backend");
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(target))
            .await
            .map_err(|_| WorkerError::DialTimeout)?
            .map_err(WorkerError::Dial)?;
        self.backend = Some(Backend { stream, addr });
        Ok(())
    }

    /// Send the rewritten head and stream the body until the request is
    /// complete on the wire.
    async fn forward_request(&mut self) -> Result<(), WorkerError> {
        let backend_addr = {
            let backend = self.backend.as_ref().expect("dialed above");
            format!("{}:{}", backend.addr, self.config.backend_port)
        };

        // Authorization and Host are rewritten; Expect is stripped because
        // the head is forwarded before any body and the backend answers the
        // 100 itself. Content-Length goes when chunked wins.
        let mut del_headers = vec!["authorization", "host", "expect"];
        if self.request.is_chunked() && self.request.header("content-length").is_some() {
            del_headers.push("content-length");
        }
        let head = self.request.build_head(
            &del_headers,
            &[
                ("Host", backend_addr.as_bytes()),
                ("Authorization", self.policy.backend_auth_value()),
            ],
        );

        let idle = Duration::from_secs(self.config.inactivity_timeout_secs);
        let backend = self.backend.as_mut().expect("dialed above");
        backend
            .stream
            .write_all(&head)
            .await
            .map_err(|_| WorkerError::BackendClosed)?;

        let buffered = self.request.take_wire();
        if !buffered.is_empty() {
            backend
                .stream
                .write_all(&buffered)
                .await
                .map_err(|_| WorkerError::BackendClosed)?;
        }

        let mut buf = vec![0u8; self.config.client_recvbuf];
        while !self.request.complete() {
            let n = timeout(idle, self.client.read(&mut buf))
                .await
                .map_err(|_| WorkerError::IdleTimeout)??;
            if n == 0 {
                return Err(WorkerError::ClientAbort);
            }
            self.request
                .feed(&buf[..n])
                .map_err(WorkerError::ClientProtocol)?;
            let wire = self.request.take_wire();
            if !wire.is_empty() {
                backend
                    .stream
                    .write_all(&wire)
                    .await
                    .map_err(|_| WorkerError::BackendClosed)?;
            }
        }
        Ok(())
    }

    /// Relay the response, either spliced through verbatim or buffered for
    /// the project-list filter. Handles upgrade handshakes and keep-alive
    /// accounting.
    async fn relay_response(
        &mut self,
        exchange: &mut Exchange,
        filter: Option<crate::config::ProjectFilterRule>,
        username: &str,
    ) -> Result<Outcome, WorkerError> {
        let idle = Duration::from_secs(self.config.inactivity_timeout_secs);
        let filter_body_limit = self.config.server_recvbuf.saturating_mul(64);
        self.response.set_body_limit(if filter.is_some() {
            filter_body_limit
        } else {
            0
        });

        let mut buf = vec![0u8; self.config.server_recvbuf];
        let mut head_forwarded = false;
        let mut buffering = filter.is_some();
        let mut buffered_wire: Vec<u8> = Vec::new();
        let mut backend_eof = false;

        loop {
            // Drain whatever the parser has ready before reading more.
            if self.response.head_complete() {
                if self.response.status() == 101 {
                    return self.tunnel_upgraded(exchange, idle).await;
                }
                if self.response.status() < 200 {
                    // Interim response; relay it and wait for the real one.
                    let head = self.response.head_bytes().to_vec();
                    self.write_client(exchange, &head).await?;
                    self.response.reset();
                    self.response
                        .advance()
                        .map_err(WorkerError::BackendProtocol)?;
                    continue;
                }
                if !head_forwarded {
                    if self.request.method() == "HEAD" {
                        self.response.expect_no_body();
                    }
                    exchange.status = Some(self.response.status());
                    if !buffering {
                        let head = self.response.head_bytes().to_vec();
                        self.write_client(exchange, &head).await?;
                        head_forwarded = true;
                    } else {
                        head_forwarded = true;
                    }
                }
                let wire = self.response.take_wire();
                if buffering {
                    buffered_wire.extend_from_slice(&wire);
                    if buffered_wire.len() > filter_body_limit {
                        // Too large to buffer; give up on filtering and
                        // fall back to verbatim forwarding.
                        warn!(user = %username, "project list exceeds filter ceiling, passing through");
                        let head = self.response.head_bytes().to_vec();
                        self.write_client(exchange, &head).await?;
                        let pending = std::mem::take(&mut buffered_wire);
                        self.write_client(exchange, &pending).await?;
                        buffering = false;
                    }
                } else if !wire.is_empty() {
                    self.write_client(exchange, &wire).await?;
                }

                let complete = self.response.complete()
                    || (backend_eof && self.response.framing() == BodyFraming::UntilClose);
                if complete {
                    return self.finish_response(exchange, filter, username, buffering, buffered_wire).await;
                }
            }
            if backend_eof {
                return Err(WorkerError::BackendClosed);
            }

            let backend = self.backend.as_mut().expect("dialed above");
            let n = timeout(idle, backend.stream.read(&mut buf))
                .await
                .map_err(|_| WorkerError::IdleTimeout)?
                .map_err(|_| WorkerError::BackendClosed)?;
            if n == 0 {
                backend_eof = true;
                if !self.response.head_complete() {
                    return Err(WorkerError::BackendClosed);
                }
                continue;
            }
            self.response
                .feed(&buf[..n])
                .map_err(WorkerError::BackendProtocol)?;
        }
    }

    /// Conclude a complete (non-upgrade) response: apply the filter when
    /// armed, then decide connection reuse.
    async fn finish_response(
        &mut self,
        exchange: &mut Exchange,
        filter: Option<crate::config::ProjectFilterRule>,
        username: &str,
        buffering: bool,
        buffered_wire: Vec<u8>,
    ) -> Result<Outcome, WorkerError> {
        if buffering {
            let rule = filter.expect("buffering implies a filter");
            match filter_project_list(&self.response, &rule.project, username) {
                Some(rewritten) => {
                    self.write_client(exchange, &rewritten).await?;
                }
                None => {
                    let head = self.response.head_bytes().to_vec();
                    self.write_client(exchange, &head).await?;
                    self.write_client(exchange, &buffered_wire).await?;
                }
            }
        }

        let backend_closing = self.response.wants_close();
        if backend_closing {
            self.backend = None;
        }
        if self.request.wants_close() || backend_closing {
            Ok(Outcome::Close)
        } else {
            Ok(Outcome::KeepAlive)
        }
    }

    /// Opaque bidirectional splice after a 101 handshake. Runs until either
    /// side closes or nothing moves for the inactivity timeout.
    async fn tunnel_upgraded(
        &mut self,
        exchange: &mut Exchange,
        idle: Duration,
    ) -> Result<Outcome, WorkerError> {
        exchange.status = Some(101);
        let head = self.response.head_bytes().to_vec();
        self.write_client(exchange, &head).await?;

        let backend = self.backend.as_mut().expect("dialed above");

        // Bytes that arrived glued to either head belong to the tunnel.
        let early_backend = self.response.take_buffered();
        if !early_backend.is_empty() {
            exchange.bytes_to_client += early_backend.len() as u64;
            self.client.write_all(&early_backend).await?;
        }
        let early_client = self.request.take_buffered();
        if !early_client.is_empty() {
            backend.stream.write_all(&early_client).await?;
        }

        let (mut client_rd, mut client_wr) = self.client.split();
        let (mut backend_rd, mut backend_wr) = backend.stream.split();
        let mut client_buf = vec![0u8; self.config.client_recvbuf];
        let mut backend_buf = vec![0u8; self.config.server_recvbuf];

        loop {
            tokio::select! {
                read = client_rd.read(&mut client_buf) => {
                    let n = read?;
                    if n == 0 {
                        break;
                    }
                    backend_wr.write_all(&client_buf[..n]).await?;
                }
                read = backend_rd.read(&mut backend_buf) => {
                    let n = read?;
                    if n == 0 {
                        break;
                    }
                    exchange.bytes_to_client += n as u64;
                    client_wr.write_all(&backend_buf[..n]).await?;
                }
                // Re-armed every iteration, so it only fires after a full
                // idle period with no bytes in either direction.
                _ = tokio::time::sleep(idle) => {
                    return Err(WorkerError::IdleTimeout);
                }
            }
        }

        self.backend = None;
        Ok(Outcome::Close)
    }

    async fn write_client(
        &mut self,
        exchange: &mut Exchange,
        data: &[u8],
    ) -> Result<(), WorkerError> {
        if data.is_empty() {
            return Ok(());
        }
        exchange.response_started = true;
        exchange.bytes_to_client += data.len() as u64;
        self.client.write_all(data).await?;
        Ok(())
    }

    /// Peer address for the access log. A trusted downstream proxy may
    /// report the original client through the real-IP header.
    fn log_peer(&self) -> IpAddr {
        if self.policy.peer_is_trusted(self.peer.ip()) {
            if let Some(value) = self.request.header(&self.config.real_ip_header_name) {
                let text = String::from_utf8_lossy(value);
                if let Some(first) = text.split(',').next() {
                    if let Ok(ip) = first.trim().parse() {
                        return ip;
                    }
                }
            }
        }
        self.peer.ip()
    }

    fn log(&self, access_log: &AccessLogger, exchange: Exchange, disposition: Disposition) {
        access_log.log(&AccessLogEntry {
            peer: self.log_peer(),
            username: exchange.username,
            method: exchange.method,
            target: exchange.target,
            backend: exchange.backend,
            status: exchange.status,
            response_bytes: exchange.bytes_to_client,
            duration_ms: exchange.started.elapsed().as_millis() as u64,
            disposition,
        });
    }
}
