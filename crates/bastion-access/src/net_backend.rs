//! Network transport seam.
//!
//! The controller decides; a [`NetworkBackend`] only moves bytes. Requests
//! reach the backend with the addresses that passed policy already resolved,
//! and the backend must connect to exactly those.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use url::Url;

use bastion_types::AuditOperation;

/// HTTP methods the controller mediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    /// Uppercase method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    /// Audit operation recorded for this method.
    pub fn audit_operation(&self) -> AuditOperation {
        match self {
            Self::Get => AuditOperation::HttpGet,
            Self::Post => AuditOperation::HttpPost,
            Self::Put => AuditOperation::HttpPut,
            Self::Delete => AuditOperation::HttpDelete,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hop of an authorized HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Addresses that passed policy. The connection must use one of them.
    pub resolved: Vec<SocketAddr>,
    pub timeout: Duration,
    pub max_response_bytes: u64,
    pub verify_ssl: bool,
    pub user_agent: String,
}

/// Response returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Final URL after redirects.
    pub url: String,
    /// Body size in bytes.
    pub size: u64,
}

impl HttpResponse {
    /// First header value with `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body as lossy UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Whether the status is a redirect the controller follows.
    pub fn is_redirect(&self) -> bool {
        matches!(self.status_code, 301 | 302 | 303 | 307 | 308)
    }
}

/// Transport failures.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Connect, TLS, timeout or protocol failure.
    #[error("{0}")]
    Transport(String),
    /// The body passed the size cap; the transfer was cut off.
    #[error("response exceeded {limit} bytes")]
    TooLarge { limit: u64 },
}

/// Moves bytes for the network controller.
#[async_trait]
pub trait NetworkBackend: Send + Sync + fmt::Debug {
    /// Resolves `host` to socket addresses.
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;

    /// Sends one request without following redirects.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, BackendError>;

    /// Opens a TCP connection to the first reachable address.
    async fn connect(&self, addrs: &[SocketAddr], timeout: Duration) -> io::Result<TcpStream>;
}

/// Production backend: `reqwest` over rustls, Tokio DNS and TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReqwestBackend;

impl ReqwestBackend {
    fn client(request: &HttpRequest) -> Result<reqwest::Client, BackendError> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(request.timeout)
            .connect_timeout(request.timeout)
            .user_agent(request.user_agent.clone())
            .danger_accept_invalid_certs(!request.verify_ssl)
            .no_proxy();
        if let Some(host) = request.url.host_str() {
            if host.parse::<std::net::IpAddr>().is_err() && !request.resolved.is_empty() {
                builder = builder.resolve_to_addrs(host, &request.resolved);
            }
        }
        builder
            .build()
            .map_err(|e| BackendError::Transport(format!("client build failed: {e}")))
    }
}

#[async_trait]
impl NetworkBackend for ReqwestBackend {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {host}"),
            ));
        }
        Ok(addrs)
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, BackendError> {
        let client = Self::client(&request)?;
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let mut builder = client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let mut response = builder
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let limit = request.max_response_bytes;
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(BackendError::TooLarge { limit });
        }
        let status_code = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let url = response.url().to_string();

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?
        {
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(BackendError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }
        let size = body.len() as u64;
        Ok(HttpResponse {
            status_code,
            headers,
            body,
            url,
            size,
        })
    }

    async fn connect(&self, addrs: &[SocketAddr], timeout: Duration) -> io::Result<TcpStream> {
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses to connect to");
        for addr in addrs {
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => last_err = e,
                Err(_) => {
                    last_err = io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {addr} timed out"),
                    )
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_maps_to_audit_operation() {
        assert_eq!(HttpMethod::Post.audit_operation(), AuditOperation::HttpPost);
        assert_eq!(HttpMethod::Delete.to_string(), "DELETE");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let response = HttpResponse {
            status_code: 302,
            headers: vec![("location".into(), "/next".into())],
            body: Vec::new(),
            url: "https://a.com/".into(),
            size: 0,
        };
        assert_eq!(response.header("Location"), Some("/next"));
        assert!(response.is_redirect());
    }

    #[tokio::test]
    async fn connect_with_no_addresses_fails() {
        let err = ReqwestBackend
            .connect(&[], Duration::from_millis(10))
            .await
            .expect_err("nothing to connect to");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
