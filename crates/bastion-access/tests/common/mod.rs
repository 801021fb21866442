//! Shared test doubles for bastion-access integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bastion_access::{BackendError, FileMeta, FileSystem, HttpRequest, HttpResponse, NetworkBackend, OpenMode};
use tokio::net::TcpStream;

// ---------------------------------------------------------------------------
// Filesystem double
// ---------------------------------------------------------------------------

/// Filesystem that touches nothing and records every path it is asked about.
#[derive(Debug, Default)]
pub struct RecordingFs {
    calls: Mutex<Vec<(&'static str, PathBuf)>>,
}

impl RecordingFs {
    pub fn calls(&self) -> Vec<(&'static str, PathBuf)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Calls that would read or modify data (everything but path resolution).
    pub fn io_calls(&self) -> Vec<(&'static str, PathBuf)> {
        self.calls()
            .into_iter()
            .filter(|(op, _)| !matches!(*op, "canonicalize" | "is_symlink"))
            .collect()
    }

    fn log(&self, op: &'static str, path: &Path) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((op, path.to_path_buf()));
    }
}

fn not_found() -> io::Error {
    io::Error::from(io::ErrorKind::NotFound)
}

impl FileSystem for RecordingFs {
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        self.log("canonicalize", path);
        Err(not_found())
    }

    fn metadata(&self, path: &Path) -> io::Result<FileMeta> {
        self.log("metadata", path);
        Err(not_found())
    }

    fn is_symlink(&self, path: &Path) -> bool {
        self.log("is_symlink", path);
        false
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.log("read", path);
        Ok(Vec::new())
    }

    fn write(&self, path: &Path, _data: &[u8], _append: bool) -> io::Result<()> {
        self.log("write", path);
        Ok(())
    }

    fn copy(&self, from: &Path, _to: &Path) -> io::Result<u64> {
        self.log("copy", from);
        Ok(0)
    }

    fn rename(&self, from: &Path, _to: &Path) -> io::Result<()> {
        self.log("rename", from);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.log("remove_file", path);
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        self.log("remove_dir_all", path);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.log("create_dir_all", path);
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.log("read_dir", path);
        Ok(Vec::new())
    }

    fn walk_files(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.log("walk_files", path);
        Ok(Vec::new())
    }

    fn open(&self, path: &Path, _mode: OpenMode) -> io::Result<File> {
        self.log("open", path);
        Err(not_found())
    }

    fn create_temp_dir(&self, prefix: &str) -> io::Result<PathBuf> {
        self.log("create_temp_dir", Path::new(prefix));
        Err(not_found())
    }
}

// ---------------------------------------------------------------------------
// Network double
// ---------------------------------------------------------------------------

/// Transport that answers from a script and counts every call.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    /// Addresses every hostname resolves to.
    pub addrs: Vec<SocketAddr>,
    /// Fail DNS resolution.
    pub dns_fails: bool,
    pub(crate) responses: Mutex<VecDeque<Result<HttpResponse, BackendError>>>,
    pub(crate) resolves: AtomicUsize,
    pub(crate) sent: Mutex<Vec<HttpRequest>>,
    pub(crate) connects: AtomicUsize,
}

impl ScriptedBackend {
    /// Backend resolving every name to a public documentation address.
    pub fn public() -> Self {
        Self {
            addrs: vec!["93.184.216.34:443".parse().expect("addr")],
            ..Self::default()
        }
    }

    pub fn push_response(&self, response: Result<HttpResponse, BackendError>) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<HttpRequest> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// A plain 200 response.
pub fn ok(body: &str) -> HttpResponse {
    response(200, Vec::new(), body)
}

/// A redirect to `location`.
pub fn redirect(status: u16, location: &str) -> HttpResponse {
    response(status, vec![("location".into(), location.into())], "")
}

pub fn response(status: u16, headers: Vec<(String, String)>, body: &str) -> HttpResponse {
    HttpResponse {
        status_code: status,
        headers,
        body: body.as_bytes().to_vec(),
        url: String::new(),
        size: body.len() as u64,
    }
}

#[async_trait]
impl NetworkBackend for ScriptedBackend {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if self.dns_fails {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("{host}: no such host")));
        }
        Ok(self
            .addrs
            .iter()
            .map(|a| SocketAddr::new(a.ip(), port))
            .collect())
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, BackendError> {
        let url = request.url.to_string();
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        let next = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(Ok(mut r)) => {
                r.url = url;
                Ok(r)
            }
            Some(Err(e)) => Err(e),
            None => Ok(HttpResponse { url, ..ok("") }),
        }
    }

    async fn connect(&self, _addrs: &[SocketAddr], _timeout: Duration) -> io::Result<TcpStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "scripted"))
    }
}
