//! Safe hooked TCP sockets and a hooked `sleep`, layered on [`crate::hook`]
//! the way `tarantool::coio::{CoIOListener, CoIOStream}` layer on top of
//! Tarantool's own `coio_wait`: callers who just want a `TcpStream`/
//! `TcpListener` that suspends the calling fiber instead of blocking don't
//! need to touch the raw `hook::*` syscall surface themselves.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use crate::hook;

/// A hooked, non-blocking-under-the-hood TCP connection.
pub struct TcpStream {
    fd: RawFd,
}

impl TcpStream {
    /// Connect to `addr`, waiting up to
    /// [`crate::config::tcp_connect_timeout_ms`] for the connection to
    /// complete.
    pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
        let fd = hook::socket(addr_domain(&addr), libc::SOCK_STREAM, 0)?;
        match hook::connect(fd, &addr) {
            Ok(()) => Ok(TcpStream { fd }),
            Err(e) => {
                let _ = hook::close(fd);
                Err(e)
            }
        }
    }

    /// Connect to `addr` with an explicit timeout (`None` waits
    /// indefinitely).
    pub fn connect_timeout(addr: SocketAddr, timeout: Option<Duration>) -> io::Result<TcpStream> {
        let fd = hook::socket(addr_domain(&addr), libc::SOCK_STREAM, 0)?;
        match hook::connect_with_timeout(fd, &addr, timeout) {
            Ok(()) => Ok(TcpStream { fd }),
            Err(e) => {
                let _ = hook::close(fd);
                Err(e)
            }
        }
    }

    /// Wrap an already-connected raw fd. Takes ownership: `close` happens on
    /// drop, as with [`std::net::TcpStream`].
    ///
    /// # Safety
    /// `fd` must be an open, connected `SOCK_STREAM` fd not owned elsewhere.
    pub unsafe fn from_raw_fd_owned(fd: RawFd) -> TcpStream {
        TcpStream { fd }
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        hook::setsockopt_timeout(self.fd, crate::fdtable::TimeoutKind::Recv, timeout)
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        hook::setsockopt_timeout(self.fd, crate::fdtable::TimeoutKind::Send, timeout)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        sockname(self.fd, libc::getpeername)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sockname(self.fd, libc::getsockname)
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        hook::read(self.fd, buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        hook::write(self.fd, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for TcpStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl FromRawFd for TcpStream {
    unsafe fn from_raw_fd(fd: RawFd) -> TcpStream {
        TcpStream { fd }
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        let _ = hook::close(self.fd);
    }
}

/// A hooked TCP listening socket.
pub struct TcpListener {
    fd: RawFd,
}

impl TcpListener {
    /// Bind and start listening on `addr`. `backlog` mirrors the second
    /// argument to `listen(2)`.
    pub fn bind(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
        let fd = hook::socket(addr_domain(&addr), libc::SOCK_STREAM, 0)?;
        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            let _ = hook::close(fd);
            return Err(err);
        }

        let (storage, len) = hook::socket_addr_to_raw(&addr);
        let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            let _ = hook::close(fd);
            return Err(err);
        }

        let rc = unsafe { libc::listen(fd, backlog) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            let _ = hook::close(fd);
            return Err(err);
        }

        Ok(TcpListener { fd })
    }

    /// Suspends the calling fiber until a connection arrives.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (fd, addr) = hook::accept_addr(self.fd)?;
        Ok((TcpStream { fd }, addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sockname(self.fd, libc::getsockname)
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let _ = hook::close(self.fd);
    }
}

fn addr_domain(addr: &SocketAddr) -> i32 {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

unsafe fn getsockname_like(
    f: unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
    fd: RawFd,
) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = std::mem::zeroed();
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = f(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len);
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    hook::raw_to_socket_addr(&storage)
}

fn sockname(
    fd: RawFd,
    f: unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
) -> io::Result<SocketAddr> {
    unsafe { getsockname_like(f, fd) }
}

/// Suspend the calling fiber for `duration`, rescheduling it once the timer
/// manager's next drain observes the deadline has passed.
pub fn sleep(duration: Duration) {
    hook::sleep(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crate::iomanager::IoManager;
    use std::sync::Arc;

    #[test]
    fn accept_connect_echo_round_trip() {
        let io = IoManager::new(2, false, "test-net-echo");
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Fiber::new(
            move || {
                let (mut stream, _peer) = listener.accept().unwrap();
                let mut buf = [0u8; 5];
                let n = stream.read(&mut buf).unwrap();
                assert_eq!(&buf[..n], b"hello");
                stream.write_all(b"world").unwrap();
            },
            0,
            true,
        );
        io.scheduler().schedule(server, None);

        std::thread::sleep(Duration::from_millis(20));

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"hello").unwrap();
        let mut resp = [0u8; 5];
        client.read_exact(&mut resp).unwrap();
        assert_eq!(&resp, b"world");

        io.scheduler().clone().stop();
    }

    #[test]
    fn sleeping_fiber_is_woken_by_its_timer() {
        let io = IoManager::new(1, false, "test-net-sleep");
        let done = Arc::new(std::sync::Mutex::new(false));
        let done2 = done.clone();

        let fiber = Fiber::new(
            move || {
                sleep(Duration::from_millis(10));
                *done2.lock().unwrap() = true;
            },
            0,
            true,
        );
        io.scheduler().schedule(fiber, None);

        std::thread::sleep(Duration::from_millis(150));
        assert!(*done.lock().unwrap());

        io.scheduler().clone().stop();
    }
}
