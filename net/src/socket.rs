//! Non-blocking TCP socket wrapper.
//!
//! Listening and connected sockets are built with `socket2` (close-on-exec,
//! non-blocking) and expose only the option toggles the reactor needs.
//! The fd is closed when the wrapper drops.

use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Type};
use tracing::warn;

pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Create a non-blocking TCP stream socket for the given address family.
    pub fn new_stream(addr: &SocketAddr) -> io::Result<Socket> {
        let domain = Domain::for_address(*addr);
        let inner = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        inner.set_nonblocking(true)?;
        Ok(Socket { inner })
    }

    pub(crate) fn from_accepted(inner: socket2::Socket) -> io::Result<Socket> {
        inner.set_nonblocking(true)?;
        Ok(Socket { inner })
    }

    /// Adopt an already-connected std stream, e.g. to host an outbound
    /// connection on a loop. Switches it to non-blocking.
    pub fn from_std(stream: std::net::TcpStream) -> io::Result<Socket> {
        let inner = socket2::Socket::from(stream);
        inner.set_nonblocking(true)?;
        Ok(Socket { inner })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        self.inner.bind(&(*addr).into())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.inner.listen(backlog)
    }

    /// Accept one pending connection, returning the non-blocking socket and
    /// the peer address. `WouldBlock` means the queue is drained.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let (sock, addr) = self.inner.accept()?;
        let peer = addr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "non-inet peer address"))?;
        Ok((Socket::from_accepted(sock)?, peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "non-inet local address"))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .peer_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "non-inet peer address"))
    }

    /// Half-close the write side. The read side stays open so buffered
    /// inbound data can still be drained.
    pub fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(std::net::Shutdown::Write)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    pub fn set_reuse_address(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_address(on)
    }

    /// Best effort: some platforms reject SO_REUSEPORT, which only matters
    /// when the caller asked for it.
    pub fn set_reuse_port(&self, on: bool) {
        if let Err(e) = self.inner.set_reuse_port(on) {
            if on {
                warn!(error = %e, "SO_REUSEPORT failed");
            }
        }
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.inner.set_keepalive(on)
    }

    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    /// Snapshot of the kernel's per-connection TCP state.
    pub fn tcp_info(&self) -> io::Result<libc::tcp_info> {
        let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd(),
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(info)
    }

    /// Human-readable subset of [`Socket::tcp_info`] for diagnostics.
    pub fn tcp_info_string(&self) -> io::Result<String> {
        let info = self.tcp_info()?;
        let mut out = String::with_capacity(128);
        let _ = write!(
            out,
            "unrecovered={} rto={} ato={} snd_mss={} rcv_mss={} lost={} retrans={} \
             rtt={} rttvar={} ssthresh={} cwnd={} total_retrans={}",
            info.tcpi_retransmits,
            info.tcpi_rto,
            info.tcpi_ato,
            info.tcpi_snd_mss,
            info.tcpi_rcv_mss,
            info.tcpi_lost,
            info.tcpi_retrans,
            info.tcpi_rtt,
            info.tcpi_rttvar,
            info.tcpi_snd_ssthresh,
            info.tcpi_snd_cwnd,
            info.tcpi_total_retrans,
        );
        Ok(out)
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("fd", &self.fd()).finish()
    }
}
