//! ASCII-gateway connection transport.
//!
//! Feeds the external command parser from one of three interfaces: standard
//! input, a unix-domain socket, or a TCP socket. In the socket modes a
//! one-shot epoll watch on the listener admits a single connection at a
//! time; an optional idle timeout tears a silent connection down and re-arms
//! the listener. The runtime only routes bytes; command syntax is the
//! parser's business.

use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use log::{debug, error, info};
use nix::sys::epoll::EpollFlags;

use ferrocan_common::CoError;

use crate::can::setsockopt_int;
use crate::event_loop::{EventLoop, FdRegistry};
use crate::stack::GatewayParser;

/// Pending-connection queue depth for the socket modes.
const LISTEN_BACKLOG: libc::c_int = 50;

/// The command-prefix shorthand injected on stdio (see
/// [`stdio_needs_prefix`]).
const STDIO_PREFIX: &[u8] = b"[0] ";

/// How the gateway is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayConfig {
    /// No gateway.
    Disabled,
    /// Standard input/output of the process.
    Stdio,
    /// Unix-domain stream socket bound to a filesystem path.
    Local(PathBuf),
    /// TCP socket on 0.0.0.0:port.
    Tcp(u16),
}

enum Conn {
    Stdio,
    Socket(OwnedFd),
}

impl Conn {
    fn raw(&self) -> RawFd {
        match self {
            Conn::Stdio => libc::STDIN_FILENO,
            Conn::Socket(fd) => fd.as_raw_fd(),
        }
    }
}

/// Gateway server state, serviced once per mainline iteration.
pub struct Gateway {
    config: GatewayConfig,
    registry: FdRegistry,
    listener: Option<OwnedFd>,
    conn: Option<Conn>,
    timeout_us: u64,
    idle_us: u64,
    fresh_command: bool,
    closed: bool,
}

impl Gateway {
    /// Set up the configured interface and register its descriptors with the
    /// event loop. Socket modes suppress SIGPIPE process-wide.
    pub fn new(
        registry: FdRegistry,
        config: GatewayConfig,
        timeout_ms: u32,
    ) -> Result<Self, CoError> {
        let mut gw = Gateway {
            config: config.clone(),
            registry,
            listener: None,
            conn: None,
            timeout_us: timeout_ms as u64 * 1000,
            idle_us: 0,
            fresh_command: true,
            closed: false,
        };

        match &config {
            GatewayConfig::Disabled => {}
            GatewayConfig::Stdio => {
                let stdin = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) };
                gw.registry.add(stdin)?;
                gw.conn = Some(Conn::Stdio);
                info!("gateway: command interface on stdio");
            }
            GatewayConfig::Local(path) => {
                let fd = bind_unix_listener(path)
                    .map_err(|e| CoError::syscall("socket(local)", e))?;
                ignore_sigpipe()?;
                gw.registry.add_oneshot(unsafe { BorrowedFd::borrow_raw(fd.as_raw_fd()) })?;
                gw.listener = Some(fd);
                info!("gateway: command interface on local socket {}", path.display());
            }
            GatewayConfig::Tcp(port) => {
                let fd = bind_tcp_listener(*port)
                    .map_err(|e| CoError::syscall("socket(tcp)", e))?;
                ignore_sigpipe()?;
                gw.registry.add_oneshot(unsafe { BorrowedFd::borrow_raw(fd.as_raw_fd()) })?;
                gw.listener = Some(fd);
                info!("gateway: command interface on tcp port {port}");
            }
        }
        Ok(gw)
    }

    /// True unless constructed with [`GatewayConfig::Disabled`].
    pub fn is_enabled(&self) -> bool {
        self.config != GatewayConfig::Disabled
    }

    /// True while a client is attached (always true in stdio mode).
    pub fn has_connection(&self) -> bool {
        self.conn.is_some()
    }

    fn listener_raw(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|fd| fd.as_raw_fd())
    }

    fn conn_raw(&self) -> Option<RawFd> {
        self.conn.as_ref().map(Conn::raw)
    }

    /// Service the gateway for this iteration: accept, read, or advance the
    /// idle timeout.
    pub fn process(&mut self, ep: &mut EventLoop, parser: &mut dyn GatewayParser) {
        if !self.is_enabled() {
            return;
        }

        if let Some(ev) = ep.pending_event() {
            let (fd, flags) = (ev.data() as RawFd, ev.events());
            let mut consumed = false;

            if Some(fd) == self.listener_raw() {
                if flags.contains(EpollFlags::EPOLLIN) {
                    self.accept_connection();
                }
                consumed = true;
            } else if Some(fd) == self.conn_raw() {
                if flags.contains(EpollFlags::EPOLLIN) {
                    self.read_input(parser);
                    self.idle_us = 0;
                } else if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
                    debug!("gateway: connection error or hangup, events={flags:?}");
                    self.drop_connection();
                }
                consumed = true;
            }

            if consumed {
                ep.consume_event();
            }
        }

        // idle-timeout bookkeeping for an established socket connection
        if self.timeout_us > 0 && self.listener.is_some() && self.conn.is_some() {
            if self.idle_us > self.timeout_us {
                info!("gateway: connection idle timeout, closing");
                self.drop_connection();
            } else {
                self.idle_us += ep.time_difference_us() as u64;
            }
        }
    }

    fn accept_connection(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        let fd = unsafe {
            libc::accept4(
                listener.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            let e = std::io::Error::last_os_error();
            if e.raw_os_error() != Some(libc::EAGAIN) {
                error!("gateway: accept failed: {e}");
            }
            self.rearm_listener();
            return;
        }

        let conn = unsafe { OwnedFd::from_raw_fd(fd) };
        match self
            .registry
            .add(unsafe { BorrowedFd::borrow_raw(conn.as_raw_fd()) })
        {
            Ok(()) => {
                self.conn = Some(Conn::Socket(conn));
                self.idle_us = 0;
                self.fresh_command = true;
            }
            Err(e) => {
                error!("gateway: connection registration failed: {e}");
                self.rearm_listener();
            }
        }
    }

    fn read_input(&mut self, parser: &mut dyn GatewayParser) {
        let Some(conn) = &self.conn else {
            return;
        };
        let fd = conn.raw();

        let space = parser.free_space();
        if space == 0 {
            // parser back-pressure; the level-triggered watch will refire
            return;
        }

        let mut buf = [0u8; 1024];
        let want = space.min(buf.len());
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), want) };
        if n < 0 {
            let e = std::io::Error::last_os_error();
            if e.raw_os_error() != Some(libc::EAGAIN) {
                debug!("gateway: read: {e}");
            }
            return;
        }
        let chunk = &buf[..n as usize];

        if self.config == GatewayConfig::Stdio {
            if !chunk.is_empty() {
                // make the hard-to-type addressing sequence optional on a
                // terminal: prepend "[0] " to a plain completed command
                if stdio_needs_prefix(chunk, want, self.fresh_command) {
                    parser.feed(STDIO_PREFIX);
                }
                self.fresh_command = chunk.ends_with(b"\n");
                parser.feed(chunk);
            }
        } else if chunk.is_empty() {
            // EOF: client closed; admit the next connection
            self.drop_connection();
        } else {
            parser.feed(chunk);
        }
    }

    /// Write response bytes to the attached client, non-blockingly.
    ///
    /// Returns the number of bytes taken: 0 on back-pressure (the parser
    /// retries later), `buf.len()` when no client is attached (the data is
    /// purged).
    pub fn write_response(&mut self, buf: &[u8]) -> usize {
        let Some(fd) = self.conn_raw() else {
            return buf.len();
        };
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n >= 0 {
            n as usize
        } else {
            // probably EAGAIN; retried by the parser
            debug!(
                "gateway: response write: {}",
                std::io::Error::last_os_error()
            );
            0
        }
    }

    fn rearm_listener(&mut self) {
        if let Some(listener) = &self.listener {
            let fd = unsafe { BorrowedFd::borrow_raw(listener.as_raw_fd()) };
            if let Err(e) = self.registry.rearm_oneshot(fd) {
                error!("gateway: listener re-arm failed: {e}");
            }
        }
    }

    fn drop_connection(&mut self) {
        // stdio never goes away
        if matches!(self.conn, Some(Conn::Socket(_))) {
            if let Some(Conn::Socket(fd)) = self.conn.take() {
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd.as_raw_fd()) };
                let _ = self.registry.delete(borrowed);
                drop(fd);
            }
            self.rearm_listener();
        }
        self.idle_us = 0;
    }

    /// Tear everything down: connection, listener, and for the local-socket
    /// mode the socket path on the filesystem.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(conn) = self.conn.take() {
            let borrowed = unsafe { BorrowedFd::borrow_raw(conn.raw()) };
            let _ = self.registry.delete(borrowed);
        }
        if let Some(listener) = self.listener.take() {
            let borrowed = unsafe { BorrowedFd::borrow_raw(listener.as_raw_fd()) };
            let _ = self.registry.delete(borrowed);
        }
        if let GatewayConfig::Local(path) = &self.config {
            if let Err(e) = std::fs::remove_file(path) {
                error!("gateway: removing {} failed: {e}", path.display());
            }
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.close();
    }
}

/// Decide whether a stdio input chunk gets the `"[0] "` prefix: a completed
/// (newline-terminated) command starting with a printable byte other than
/// `[` or `#`, arriving while the fresh-command flag is set and with enough
/// parser space left for the prefix.
fn stdio_needs_prefix(chunk: &[u8], space: usize, fresh_command: bool) -> bool {
    !chunk.is_empty()
        && chunk[0] != b'['
        && chunk[0] != b'#'
        && chunk[0].is_ascii_graphic()
        && chunk.ends_with(b"\n")
        && fresh_command
        && space - chunk.len() >= STDIO_PREFIX.len()
}

fn ignore_sigpipe() -> Result<(), CoError> {
    // a remote client breaking the connection must not kill the process
    // through a write() in the response path
    let prev = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    if prev == libc::SIG_ERR {
        return Err(CoError::last_os_error("signal(SIGPIPE)"));
    }
    Ok(())
}

fn bind_unix_listener(path: &Path) -> std::io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "socket path too long",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            (&addr as *const libc::sockaddr_un).cast(),
            mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

fn bind_tcp_listener(port: u16) -> std::io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    setsockopt_int(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;

    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = libc::INADDR_ANY;

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            (&addr as *const libc::sockaddr_in).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}
