//! Process-wide table of per-file-descriptor hooking state.
//!
//! [`crate::hook`] needs to know, for every fd it touches, whether it is a
//! socket, whether the *user* asked for non-blocking behavior (`O_NONBLOCK`
//! set through `fcntl`/`ioctl`), and the recv/send timeouts the user
//! configured through `SO_RCVTIMEO`/`SO_SNDTIMEO`. This table is where that
//! state lives, keyed by raw fd, grown lazily as fds are observed.
//!
//! A socket is forced into `O_NONBLOCK` the first time it is seen here —
//! that's the "system" non-blocking flag, kept separate from the "user"
//! flag so `hook::fcntl_getfl` can report back exactly the flags the user
//! set, while the scheduler still gets the non-blocking behavior it needs
//! to suspend a fiber instead of blocking a whole OS thread.

use std::os::unix::io::RawFd;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// Timeout direction, mirroring `SO_RCVTIMEO`/`SO_SNDTIMEO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Per-fd hooking state.
#[derive(Debug)]
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: bool,
    user_nonblock: bool,
    is_closed: bool,
    recv_timeout_ms: i64,
    send_timeout_ms: i64,
}

impl FdCtx {
    fn new(fd: RawFd) -> Self {
        let mut ctx = FdCtx {
            fd,
            is_socket: false,
            sys_nonblock: false,
            user_nonblock: false,
            is_closed: false,
            recv_timeout_ms: -1,
            send_timeout_ms: -1,
        };
        ctx.init();
        ctx
    }

    fn init(&mut self) {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = if unsafe { libc::fstat(self.fd, &mut st) } == -1 {
            false
        } else {
            (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK
        };
        self.is_socket = is_socket;

        if is_socket {
            let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
            if flags != -1 && flags & libc::O_NONBLOCK == 0 {
                unsafe {
                    libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            self.sys_nonblock = true;
        } else {
            self.sys_nonblock = false;
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    pub fn set_closed(&mut self, closed: bool) {
        self.is_closed = closed;
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    pub fn set_sys_nonblock(&mut self, v: bool) {
        self.sys_nonblock = v;
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock
    }

    pub fn set_user_nonblock(&mut self, v: bool) {
        self.user_nonblock = v;
    }

    /// -1 means "no timeout", matching the original's unsigned-wraparound
    /// convention but expressed as a normal negative sentinel in Rust.
    pub fn timeout(&self, kind: TimeoutKind) -> i64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms,
            TimeoutKind::Send => self.send_timeout_ms,
        }
    }

    pub fn set_timeout(&mut self, kind: TimeoutKind, timeout_ms: i64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms = timeout_ms,
            TimeoutKind::Send => self.send_timeout_ms = timeout_ms,
        }
    }
}

/// The process-wide fd table, growing `1.5x` as higher fds are observed.
pub struct FdTable {
    fds: RwLock<Vec<Option<Arc<RwLock<FdCtx>>>>>,
}

impl FdTable {
    fn new() -> Self {
        FdTable {
            fds: RwLock::new((0..64).map(|_| None).collect()),
        }
    }

    /// Look up the context for `fd`, creating it on first observation when
    /// `auto_create` is set. Returns `None` for a negative fd, or for an fd
    /// beyond the table that the caller did not ask to auto-create.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<RwLock<FdCtx>>> {
        if fd < 0 {
            return None;
        }
        {
            let fds = self.fds.read().unwrap();
            if (fd as usize) < fds.len() {
                if fds[fd as usize].is_some() || !auto_create {
                    return fds[fd as usize].clone();
                }
            } else if !auto_create {
                return None;
            }
        }

        let mut fds = self.fds.write().unwrap();
        if (fd as usize) >= fds.len() {
            let new_len = ((fd as usize + 1) as f64 * 1.5) as usize;
            fds.resize_with(new_len, || None);
        }
        let slot = &mut fds[fd as usize];
        if slot.is_none() {
            *slot = Some(Arc::new(RwLock::new(FdCtx::new(fd))));
        }
        slot.clone()
    }

    /// Drop the context tracked for `fd`, if any.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut fds = self.fds.write().unwrap();
        if (fd as usize) < fds.len() {
            fds[fd as usize] = None;
        }
    }
}

static TABLE: Lazy<FdTable> = Lazy::new(FdTable::new);

/// The process-wide fd table instance.
pub fn table() -> &'static FdTable {
    &TABLE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn pipe_is_not_a_socket() {
        let (r, _w) = unsafe {
            let mut fds = [0; 2];
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
            (fds[0], fds[1])
        };
        let table = FdTable::new();
        let ctx = table.get(r, true).unwrap();
        assert!(!ctx.read().unwrap().is_socket());
        unsafe {
            libc::close(r);
            libc::close(_w);
        }
    }

    #[test]
    fn socket_is_forced_nonblocking() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();
        let table = FdTable::new();
        let ctx = table.get(fd, true).unwrap();
        assert!(ctx.read().unwrap().is_socket());
        assert!(ctx.read().unwrap().sys_nonblock());
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn del_clears_slot() {
        let table = FdTable::new();
        let fd = 5;
        assert!(table.get(fd, true).is_some());
        table.del(fd);
        assert!(table.get(fd, false).is_none());
    }

    #[test]
    fn grows_past_initial_capacity() {
        let table = FdTable::new();
        assert!(table.get(200, true).is_some());
    }
}
