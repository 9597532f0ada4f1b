//! Buffer I/O helpers for the reactor.
//!
//! Connections stage bytes in [`bytes::BytesMut`]. Reads go through
//! [`read_fd`], a scatter read that pairs the buffer's spare capacity with a
//! 64 KiB stack segment so a single syscall can absorb a burst larger than
//! the buffer currently has room for.

use std::io;
use std::os::unix::io::RawFd;

use bytes::{BufMut, BytesMut};

/// Size of the stack-allocated overflow segment used by [`read_fd`].
const EXTRA_BUF_LEN: usize = 65536;

/// Minimum spare capacity to expose to the kernel per read.
const MIN_WRITABLE: usize = 1024;

/// Append whatever the kernel has pending on `fd` to `buf`.
///
/// Returns the number of bytes read; 0 means the peer closed its write side.
/// `WouldBlock` and `Interrupted` are returned to the caller untouched.
pub fn read_fd(buf: &mut BytesMut, fd: RawFd) -> io::Result<usize> {
    if buf.capacity() - buf.len() < MIN_WRITABLE {
        buf.reserve(MIN_WRITABLE * 4);
    }

    let mut extra = [0u8; EXTRA_BUF_LEN];
    let chunk = buf.chunk_mut();
    let writable = chunk.len();

    let mut iov = [
        libc::iovec {
            iov_base: chunk.as_mut_ptr() as *mut libc::c_void,
            iov_len: writable,
        },
        libc::iovec {
            iov_base: extra.as_mut_ptr() as *mut libc::c_void,
            iov_len: EXTRA_BUF_LEN,
        },
    ];

    let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), 2) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    let n = n as usize;

    if n <= writable {
        unsafe { buf.advance_mut(n) };
    } else {
        unsafe { buf.advance_mut(writable) };
        buf.extend_from_slice(&extra[..n - writable]);
    }

    Ok(n)
}

/// Write as much of `data` to `fd` as the kernel will take.
pub(crate) fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::{AsRawFd, FromRawFd};
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_read_fd_small() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"hello").unwrap();

        let mut buf = BytesMut::new();
        let n = read_fd(&mut buf, rx.as_raw_fd()).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn test_read_fd_appends() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let mut buf = BytesMut::new();

        tx.write_all(b"first ").unwrap();
        read_fd(&mut buf, rx.as_raw_fd()).unwrap();
        tx.write_all(b"second").unwrap();
        read_fd(&mut buf, rx.as_raw_fd()).unwrap();

        assert_eq!(&buf[..], b"first second");
    }

    #[test]
    fn test_read_fd_burst_overflows_into_stack_segment() {
        let (mut tx_fd, rx) = {
            let mut fds = [0i32; 2];
            let ret = unsafe {
                libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
            };
            assert_eq!(ret, 0);
            // Large kernel buffers so a single write lands entirely.
            for fd in fds {
                let sz: libc::c_int = 1 << 20;
                unsafe {
                    libc::setsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_SNDBUF,
                        &sz as *const _ as *const libc::c_void,
                        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                    );
                    libc::setsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_RCVBUF,
                        &sz as *const _ as *const libc::c_void,
                        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                    );
                }
            }
            let tx = unsafe { UnixStream::from_raw_fd(fds[0]) };
            let rx = unsafe { UnixStream::from_raw_fd(fds[1]) };
            (tx, rx)
        };

        let payload: Vec<u8> = (0..48 * 1024).map(|i| (i % 251) as u8).collect();
        tx_fd.write_all(&payload).unwrap();

        let mut buf = BytesMut::new();
        let mut total = 0;
        while total < payload.len() {
            total += read_fd(&mut buf, rx.as_raw_fd()).unwrap();
        }
        assert_eq!(&buf[..], &payload[..]);
    }

    #[test]
    fn test_read_fd_would_block() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        let mut buf = BytesMut::new();
        let err = read_fd(&mut buf, rx.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_read_fd_eof() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);

        let mut buf = BytesMut::new();
        let n = read_fd(&mut buf, rx.as_raw_fd()).unwrap();
        assert_eq!(n, 0);
    }
}
