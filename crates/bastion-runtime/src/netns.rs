//! Network namespaces for process-isolated payloads.
//!
//! An offline payload gets a fresh user and network namespace holding
//! nothing but a loopback interface. A networked payload also gets a
//! forwarder process inside that namespace: it listens on
//! `127.0.0.1:FORWARD_PORT` and relays each connection to the egress
//! proxy's Unix socket, which stays reachable through the filesystem. The
//! proxy is then the payload's only way out.
//!
//! [`confine`] and everything it calls run in a forked child before `exec`:
//! raw syscalls only, no allocation.

use std::io;
#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

#[cfg(unix)]
use nix::libc;
use tokio::sync::OnceCell;

#[cfg(not(unix))]
type RawFd = i32;

/// Port the in-namespace forwarder listens on.
pub const FORWARD_PORT: u16 = 3128;

/// Longest socket path a `sockaddr_un` holds, NUL excluded.
const SUN_PATH_MAX: usize = 107;

/// Network setup applied to a child before `exec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkConfinement {
    /// Keep the host network.
    Host,
    /// Fresh namespace with only a loopback interface.
    Offline,
    /// Fresh namespace whose loopback `FORWARD_PORT` reaches the egress proxy.
    Brokered(ProxyBridge),
}

/// Egress proxy socket, laid out for use after `fork`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyBridge {
    path: [u8; SUN_PATH_MAX],
    len: usize,
    report_fd: RawFd,
}

impl ProxyBridge {
    /// Fails for paths that do not fit a `sockaddr_un` or contain NUL.
    pub fn new(socket: &Path) -> io::Result<Self> {
        #[cfg(unix)]
        let bytes = std::os::unix::ffi::OsStrExt::as_bytes(socket.as_os_str());
        #[cfg(not(unix))]
        let bytes = socket.to_str().unwrap_or_default().as_bytes();
        if bytes.is_empty() || bytes.len() > SUN_PATH_MAX || bytes.contains(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("socket path unusable: {}", socket.display()),
            ));
        }
        let mut path = [0u8; SUN_PATH_MAX];
        path[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            path,
            len: bytes.len(),
            report_fd: -1,
        })
    }

    /// Reports the forwarder's pid on `fd`.
    pub(crate) fn reporting_to(mut self, fd: RawFd) -> Self {
        self.report_fd = fd;
        self
    }

    #[cfg(target_os = "linux")]
    fn sockaddr(&self) -> (libc::sockaddr_un, libc::socklen_t) {
        // SAFETY: sockaddr_un is plain data; all-zero is a valid value.
        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (slot, byte) in addr.sun_path.iter_mut().zip(&self.path[..self.len]) {
            *slot = *byte as libc::c_char;
        }
        let len = std::mem::size_of::<libc::sa_family_t>() + self.len + 1;
        (addr, len as libc::socklen_t)
    }
}

/// Pipe on which the pre-exec child reports the forwarder's pid.
#[cfg(unix)]
#[derive(Debug)]
pub(crate) struct PidReport {
    read: OwnedFd,
    write: OwnedFd,
}

#[cfg(unix)]
impl PidReport {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [-1; 2];
        // SAFETY: pipe fills both slots on success.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both descriptors were just created and nothing else owns them.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        for fd in [&read, &write] {
            // SAFETY: sets a descriptor flag on a descriptor owned here.
            if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(Self { read, write })
    }

    pub(crate) fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Reads the reported pid. Call after the child has been spawned.
    pub(crate) fn receive(self) -> io::Result<u32> {
        use std::io::Read;

        drop(self.write);
        let mut buf = [0u8; 4];
        std::fs::File::from(self.read).read_exact(&mut buf)?;
        u32::try_from(i32::from_ne_bytes(buf)).map_err(|_| io::Error::other("bad forwarder pid"))
    }
}

/// Whether this host lets an unprivileged process create a user and
/// network namespace and raise loopback in it. Checked once per process.
pub async fn namespaces_available() -> bool {
    static AVAILABLE: OnceCell<bool> = OnceCell::const_new();
    *AVAILABLE.get_or_init(check_namespaces).await
}

#[cfg(target_os = "linux")]
async fn check_namespaces() -> bool {
    use std::process::Stdio;

    let Ok(sh) = which::which("sh") else {
        return false;
    };
    let mut cmd = tokio::process::Command::new(sh);
    cmd.args(["-c", ":"])
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    // SAFETY: the hook only makes raw syscalls and allocates nothing.
    unsafe {
        cmd.pre_exec(|| confine(&NetworkConfinement::Offline));
    }
    match cmd.status().await {
        Ok(status) if status.success() => true,
        Ok(status) => {
            tracing::warn!(%status, "network namespaces unavailable");
            false
        }
        Err(e) => {
            tracing::warn!(error = %e, "network namespaces unavailable");
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn check_namespaces() -> bool {
    false
}

/// Applies `confinement` to the calling process. Runs between `fork` and
/// `exec`.
#[cfg(target_os = "linux")]
pub(crate) fn confine(confinement: &NetworkConfinement) -> io::Result<()> {
    match confinement {
        NetworkConfinement::Host => Ok(()),
        NetworkConfinement::Offline => enter_namespace(),
        NetworkConfinement::Brokered(bridge) => {
            enter_namespace()?;
            start_forwarder(bridge)
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn confine(confinement: &NetworkConfinement) -> io::Result<()> {
    match confinement {
        NetworkConfinement::Host => Ok(()),
        _ => Err(io::Error::from(io::ErrorKind::Unsupported)),
    }
}

#[cfg(target_os = "linux")]
fn enter_namespace() -> io::Result<()> {
    use nix::sched::{unshare, CloneFlags};

    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)?;
    loopback_up()
}

/// Sets `IFF_UP` on `lo` in the current network namespace.
#[cfg(target_os = "linux")]
fn loopback_up() -> io::Result<()> {
    // SAFETY: plain syscalls on a socket owned here and a zeroed ifreq.
    unsafe {
        let sock = libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0);
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut ifr: libc::ifreq = std::mem::zeroed();
        for (slot, byte) in ifr.ifr_name.iter_mut().zip(b"lo\0") {
            *slot = *byte as libc::c_char;
        }
        let mut rc = libc::ioctl(sock, libc::SIOCGIFFLAGS as _, &mut ifr);
        if rc == 0 {
            ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
            rc = libc::ioctl(sock, libc::SIOCSIFFLAGS as _, &ifr);
        }
        let err = io::Error::last_os_error();
        libc::close(sock);
        if rc != 0 {
            return Err(err);
        }
    }
    Ok(())
}

/// Binds the loopback listener, then forks the forwarder that serves it.
#[cfg(target_os = "linux")]
fn start_forwarder(bridge: &ProxyBridge) -> io::Result<()> {
    let listener = listen_loopback(FORWARD_PORT)?;
    // SAFETY: the caller is a single-threaded pre-exec child; the forked
    // forwarder never returns into Rust code that could allocate.
    unsafe {
        let payload = libc::getpid();
        match libc::fork() {
            -1 => {
                let err = io::Error::last_os_error();
                libc::close(listener);
                Err(err)
            }
            0 => forward(listener, payload, bridge),
            child => {
                libc::close(listener);
                if bridge.report_fd >= 0 {
                    let pid = child.to_ne_bytes();
                    let n = libc::write(bridge.report_fd, pid.as_ptr().cast(), pid.len());
                    if n != pid.len() as isize {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn listen_loopback(port: u16) -> io::Result<RawFd> {
    // SAFETY: plain socket syscalls on a descriptor owned here.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&one as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::LOCALHOST).to_be();
        let bound = libc::bind(
            fd,
            (&addr as *const libc::sockaddr_in).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if bound != 0 || libc::listen(fd, 64) != 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        Ok(fd)
    }
}

/// Forwarder main loop. Dies with the payload.
#[cfg(target_os = "linux")]
unsafe fn forward(listener: RawFd, payload: libc::pid_t, bridge: &ProxyBridge) -> ! {
    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
    if libc::getppid() != payload {
        libc::_exit(0);
    }
    if libc::dup2(listener, 0) < 0 {
        libc::_exit(1);
    }
    close_from(1);
    // Relay children are reaped by the kernel.
    libc::signal(libc::SIGCHLD, libc::SIG_IGN);
    loop {
        let conn = libc::accept(0, std::ptr::null_mut(), std::ptr::null_mut());
        if conn < 0 {
            if !interrupted() {
                libc::poll(std::ptr::null_mut(), 0, 100);
            }
            continue;
        }
        match libc::fork() {
            0 => {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
                libc::close(0);
                relay(conn, bridge);
                libc::_exit(0);
            }
            _ => {
                libc::close(conn);
            }
        }
    }
}

/// Closes every descriptor from `first` up.
#[cfg(target_os = "linux")]
unsafe fn close_from(first: RawFd) {
    let done = libc::syscall(
        libc::SYS_close_range,
        first as libc::c_uint,
        libc::c_uint::MAX,
        0 as libc::c_uint,
    );
    if done != 0 {
        for fd in first..65_536 {
            libc::close(fd);
        }
    }
}

#[cfg(target_os = "linux")]
fn interrupted() -> bool {
    matches!(
        nix::errno::Errno::last(),
        nix::errno::Errno::EINTR | nix::errno::Errno::ECONNABORTED
    )
}

/// Connects `client` to the proxy socket and pumps bytes both ways.
#[cfg(target_os = "linux")]
unsafe fn relay(client: RawFd, bridge: &ProxyBridge) {
    let upstream = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
    if upstream < 0 {
        return;
    }
    let (addr, len) = bridge.sockaddr();
    if libc::connect(upstream, (&addr as *const libc::sockaddr_un).cast(), len) != 0 {
        return;
    }
    pump(client, upstream);
}

#[cfg(target_os = "linux")]
unsafe fn pump(a: RawFd, b: RawFd) {
    let mut buf = [0u8; 16 * 1024];
    let routes = [(a, b), (b, a)];
    let mut open = [true, true];
    while open[0] || open[1] {
        let mut fds = [
            libc::pollfd {
                fd: if open[0] { a } else { -1 },
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: if open[1] { b } else { -1 },
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        if libc::poll(fds.as_mut_ptr(), 2, -1) < 0 {
            if interrupted() {
                continue;
            }
            return;
        }
        for (i, (src, dst)) in routes.iter().enumerate() {
            if !open[i] || fds[i].revents == 0 {
                continue;
            }
            let n = libc::read(*src, buf.as_mut_ptr().cast(), buf.len());
            if n < 0 && interrupted() {
                continue;
            }
            if n <= 0 {
                open[i] = false;
                libc::shutdown(*dst, libc::SHUT_WR);
                continue;
            }
            if !send_all(*dst, &buf[..n as usize]) {
                return;
            }
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn send_all(fd: RawFd, mut data: &[u8]) -> bool {
    while !data.is_empty() {
        let n = libc::send(fd, data.as_ptr().cast(), data.len(), libc::MSG_NOSIGNAL);
        if n < 0 {
            if interrupted() {
                continue;
            }
            return false;
        }
        data = &data[n as usize..];
    }
    true
}
