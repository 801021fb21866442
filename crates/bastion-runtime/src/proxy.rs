//! Egress proxy for networked payloads.
//!
//! The proxy listens on a Unix socket inside the execution's workspace; the
//! payload reaches it through a forwarder inside its network namespace,
//! which is the only route out. Each CONNECT tunnel or absolute-form HTTP
//! request is authorized through the execution's
//! [`NetworkAccessController`] before any upstream connection is made;
//! refused targets get a 403 carrying the denial. Responses are cut off at
//! the policy's `max_response_size_bytes`.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bastion_access::{AccessError, NetworkAccessController, Target};
use bastion_types::AuditOperation;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeError;

/// Largest request head accepted from a payload.
const MAX_HEAD_BYTES: usize = 16 * 1024;
/// Time a payload gets to send its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
/// Relay buffer size.
const RELAY_CHUNK: usize = 16 * 1024;
/// Request headers meant for the proxy, never forwarded.
const HOP_HEADERS: &[&str] = &[
    "proxy-connection",
    "proxy-authorization",
    "connection",
    "keep-alive",
];

/// A running egress proxy. Stops when shut down or dropped.
#[derive(Debug)]
pub struct EgressProxy {
    path: PathBuf,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EgressProxy {
    /// Binds a Unix socket at `path` and starts serving. A stale socket
    /// left at `path` is replaced.
    pub async fn start(
        path: impl AsRef<Path>,
        controller: NetworkAccessController,
    ) -> Result<Self, RuntimeError> {
        let path = path.as_ref().to_path_buf();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(RuntimeError::io("clear egress proxy socket", e)),
        }
        let listener = UnixListener::bind(&path).map_err(|e| RuntimeError::io("bind egress proxy", e))?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(listener, Arc::new(controller), shutdown.clone()));
        tracing::debug!(path = %path.display(), "egress proxy listening");
        Ok(Self {
            path,
            shutdown,
            task: Some(task),
        })
    }

    /// Socket path clients connect to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting and closes every open tunnel.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for EgressProxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Source of client connections.
#[async_trait]
trait Incoming: Send + 'static {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn next(&mut self) -> io::Result<Self::Conn>;
}

#[async_trait]
impl Incoming for UnixListener {
    type Conn = UnixStream;

    async fn next(&mut self) -> io::Result<UnixStream> {
        self.accept().await.map(|(stream, _)| stream)
    }
}

async fn serve<L: Incoming>(
    mut listener: L,
    controller: Arc<NetworkAccessController>,
    shutdown: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            accepted = listener.next() => match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    // EMFILE and friends persist until a connection closes.
                    tracing::warn!(error = %e, "egress proxy accept failed");
                    tokio::select! {
                        () = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                        () = shutdown.cancelled() => break,
                    }
                }
            },
            () = shutdown.cancelled() => break,
        };
        let controller = Arc::clone(&controller);
        let stop = shutdown.child_token();
        tokio::spawn(async move {
            tokio::select! {
                () = handle(stream, &controller) => {}
                () = stop.cancelled() => {}
            }
            tracing::trace!("proxy connection closed");
        });
    }
}

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

/// Parses the bytes before the blank line ending a request head.
pub fn parse_head(raw: &[u8]) -> Result<RequestHead, String> {
    let text = std::str::from_utf8(raw).map_err(|_| "request head is not UTF-8".to_string())?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("malformed request line: {request_line:?}"));
    };
    let mut headers = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("malformed header: {line:?}"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Splits a CONNECT authority (`host:port`, `[v6]:port`).
pub fn split_authority(authority: &str) -> Option<(String, u16)> {
    let (host, port) = authority.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

/// Rewrites an absolute-form request head to origin form for the upstream.
pub fn origin_form(head: &RequestHead, target: &Target) -> Vec<u8> {
    let mut path = target.url.path().to_string();
    if let Some(query) = target.url.query() {
        path.push('?');
        path.push_str(query);
    }
    let mut out = format!("{} {} {}\r\n", head.method, path, head.version);
    let mut has_host = false;
    for (name, value) in &head.headers {
        let lower = name.to_ascii_lowercase();
        if HOP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        has_host |= lower == "host";
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    if !has_host {
        out.push_str(&format!("Host: {}\r\n", target.url.authority()));
    }
    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}

/// Reads up to the end of the request head. Returns the head and any bytes
/// read past it.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>), String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| format!("read failed: {e}"))?;
        if n == 0 {
            return Err("connection closed before request head".into());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            buf.truncate(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err("request head too large".into());
        }
    }
}

async fn respond<S: AsyncWrite + Unpin>(stream: &mut S, status: u16, reason: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn respond_error<S: AsyncWrite + Unpin>(stream: &mut S, err: &AccessError) {
    match err {
        AccessError::PolicyViolation(denial) => {
            respond(stream, 403, "Forbidden", &format!("{denial}\n")).await;
        }
        AccessError::Network { .. } => respond(stream, 502, "Bad Gateway", &format!("{err}\n")).await,
        _ => respond(stream, 400, "Bad Request", &format!("{err}\n")).await,
    }
}

async fn connect_any(addrs: &[SocketAddr], timeout: Duration) -> Result<TcpStream, String> {
    let mut last = "no addresses".to_string();
    for addr in addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last = format!("{addr}: {e}"),
            Err(_) => last = format!("{addr}: connect timed out"),
        }
    }
    Err(last)
}

/// Copies `reader` into `writer` until EOF or until more than `limit`
/// bytes would pass. Returns the bytes written and whether the limit hit.
async fn copy_capped<R, W>(reader: &mut R, writer: &mut W, limit: u64) -> (u64, bool)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if total.saturating_add(n as u64) > limit {
            return (total, true);
        }
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    (total, false)
}

/// Bytes moved by one relayed connection.
#[derive(Debug, Default, Clone, Copy)]
struct Relayed {
    up: u64,
    down: u64,
    capped: bool,
}

/// Relays both directions until both finish, or until the download passes
/// `limit`, which drops the connection.
async fn relay<C>(client: C, upstream: TcpStream, limit: u64) -> Relayed
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut up_rd, mut up_wr) = upstream.into_split();
    let upload = async {
        let n = tokio::io::copy(&mut client_rd, &mut up_wr).await.unwrap_or(0);
        let _ = up_wr.shutdown().await;
        n
    };
    let download = copy_capped(&mut up_rd, &mut client_wr, limit);
    tokio::pin!(upload, download);

    let mut relayed = Relayed::default();
    let (mut up_done, mut down_done) = (false, false);
    while !(up_done && down_done) {
        tokio::select! {
            n = &mut upload, if !up_done => {
                relayed.up = n;
                up_done = true;
            }
            (n, capped) = &mut download, if !down_done => {
                relayed.down = n;
                relayed.capped = capped;
                down_done = true;
                if capped {
                    break;
                }
            }
        }
    }
    relayed
}

async fn handle<S>(mut client: S, controller: &NetworkAccessController)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (raw, leftover) = match tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut client)).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(reason)) => return respond(&mut client, 400, "Bad Request", &reason).await,
        Err(_) => return respond(&mut client, 408, "Request Timeout", "").await,
    };
    let head = match parse_head(&raw) {
        Ok(head) => head,
        Err(reason) => return respond(&mut client, 400, "Bad Request", &reason).await,
    };

    let tunnel = head.method.eq_ignore_ascii_case("CONNECT");
    let (host, port, scheme, target) = if tunnel {
        let Some((host, port)) = split_authority(&head.target) else {
            return respond(&mut client, 400, "Bad Request", "malformed CONNECT authority").await;
        };
        (host, port, "https".to_string(), None)
    } else {
        let target = match Target::parse(&head.target) {
            Ok(t) if t.scheme == "http" => t,
            Ok(t) => {
                let msg = format!("absolute-form {} is not supported; use CONNECT", t.scheme);
                return respond(&mut client, 400, "Bad Request", &msg).await;
            }
            Err(reason) => return respond(&mut client, 400, "Bad Request", &reason).await,
        };
        (target.host.clone(), target.port, target.scheme.clone(), Some(target))
    };

    let started = Instant::now();
    let addrs = match controller.authorize(&host, port, &scheme).await {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::info!(host, port, error = %e, "egress refused");
            return respond_error(&mut client, &e).await;
        }
    };
    let mut upstream = match connect_any(&addrs, controller.policy().request_timeout()).await {
        Ok(stream) => stream,
        Err(reason) => {
            tracing::warn!(host, port, reason, "egress connect failed");
            return respond(&mut client, 502, "Bad Gateway", &reason).await;
        }
    };

    let forwarded = match &target {
        None => {
            if client
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .is_err()
            {
                return;
            }
            leftover
        }
        Some(target) => {
            let mut bytes = origin_form(&head, target);
            bytes.extend_from_slice(&leftover);
            bytes
        }
    };
    if upstream.write_all(&forwarded).await.is_err() {
        return;
    }
    let limit = controller.policy().max_response_size_bytes;
    let relayed = relay(client, upstream, limit).await;
    controller.add_transferred(relayed.up + relayed.down + forwarded.len() as u64);
    if relayed.capped {
        let audited = audit_target(&scheme, &host, port);
        let _ = controller.response_too_large(AuditOperation::ProxyConnect, &audited, limit, started);
    }
}

/// Audit target for a brokered connection, as `authorize` records it.
fn audit_target(scheme: &str, host: &str, port: u16) -> String {
    format!("{scheme}://{}:{port}", bastion_access::normalize_host(host))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bastion_access::AuditLog;
    use bastion_types::NetworkPolicy;

    use super::*;

    /// Listener whose every accept fails like a process out of descriptors.
    #[derive(Debug)]
    struct ExhaustedListener {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Incoming for ExhaustedListener {
        type Conn = UnixStream;

        async fn next(&mut self) -> io::Result<UnixStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::from_raw_os_error(24))
        }
    }

    #[tokio::test]
    async fn failed_accepts_back_off() {
        let calls = Arc::new(AtomicUsize::new(0));
        let listener = ExhaustedListener {
            calls: Arc::clone(&calls),
        };
        let controller =
            NetworkAccessController::new(Arc::new(NetworkPolicy::default()), AuditLog::new_shared());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(listener, Arc::new(controller), shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(350)).await;
        shutdown.cancel();
        task.await.expect("serve");
        let attempts = calls.load(Ordering::SeqCst);
        assert!((1..=6).contains(&attempts), "accept attempts: {attempts}");
    }

    #[tokio::test]
    async fn capped_copy_stops_before_the_limit() {
        let (mut upstream, mut reader) = tokio::io::duplex(64);
        let mut sink = Vec::new();
        let writer = tokio::spawn(async move {
            let _ = upstream.write_all(&[7u8; 40]).await;
            let _ = upstream.write_all(&[7u8; 40]).await;
        });
        let (written, capped) = copy_capped(&mut reader, &mut sink, 50).await;
        drop(reader);
        writer.await.expect("writer");
        assert!(capped);
        assert!(written <= 50);
        assert_eq!(sink.len() as u64, written);
    }

    #[tokio::test]
    async fn copy_under_the_limit_reaches_eof() {
        let mut reader: &[u8] = b"hello";
        let mut sink = Vec::new();
        assert_eq!(copy_capped(&mut reader, &mut sink, 5).await, (5, false));
        assert_eq!(sink, b"hello");
    }

    #[test]
    fn parses_connect_head() {
        let head = parse_head(b"CONNECT api.github.com:443 HTTP/1.1\r\nHost: api.github.com:443")
            .expect("head");
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "api.github.com:443");
        assert_eq!(head.headers.len(), 1);
    }

    #[test]
    fn rejects_malformed_request_line() {
        assert!(parse_head(b"GET\r\n").is_err());
        assert!(parse_head(b"GET / HTTP/1.1 extra\r\n").is_err());
        assert!(parse_head(b"GET / HTTP/1.1\r\nno-colon").is_err());
    }

    #[test]
    fn splits_authorities() {
        assert_eq!(split_authority("example.com:443"), Some(("example.com".into(), 443)));
        assert_eq!(split_authority("[::1]:8080"), Some(("::1".into(), 8080)));
        assert_eq!(split_authority("example.com"), None);
        assert_eq!(split_authority(":443"), None);
    }

    #[test]
    fn origin_form_strips_proxy_headers() {
        let head = parse_head(
            b"GET http://example.com/a?b=1 HTTP/1.1\r\nHost: example.com\r\nProxy-Authorization: x\r\nConnection: keep-alive\r\nAccept: */*",
        )
        .expect("head");
        let target = Target::parse(&head.target).expect("target");
        let out = String::from_utf8(origin_form(&head, &target)).expect("utf8");
        assert!(out.starts_with("GET /a?b=1 HTTP/1.1\r\n"));
        assert!(out.contains("Host: example.com\r\n"));
        assert!(out.contains("Accept: */*\r\n"));
        assert!(!out.to_ascii_lowercase().contains("proxy-authorization"));
        assert!(out.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn origin_form_adds_missing_host() {
        let head = parse_head(b"GET http://example.com:8080/ HTTP/1.0").expect("head");
        let target = Target::parse(&head.target).expect("target");
        let out = String::from_utf8(origin_form(&head, &target)).expect("utf8");
        assert!(out.contains("Host: example.com:8080\r\n"));
    }
}
