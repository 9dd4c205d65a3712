//! Process-wide fd context table.
//!
//! The syscall hooks consult this table to decide whether an fd is theirs
//! to manage: only sockets created while hooking was active are tracked.
//! Each entry records the split between what the user asked for
//! (`user_nonblock`) and what the runtime forced onto the kernel
//! (`sys_nonblock`), plus the per-direction timeouts mirrored from
//! `setsockopt`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use crate::config::NO_TIMEOUT;

/// Which per-direction timeout a hook consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`: reads, accepts.
    Recv,
    /// `SO_SNDTIMEO`: writes, sends.
    Send,
}

/// Tracked state of one file descriptor.
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    /// O_NONBLOCK as actually set on the kernel fd.
    sys_nonblock: AtomicBool,
    /// O_NONBLOCK as last requested by the user via fcntl/ioctl.
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> Self {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut stat) } == 0
            && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            // Sockets run non-blocking underneath regardless of what the
            // user asked for; the fcntl hook hides this flag again.
            let fcntl = crate::hook::origin::fcntl_f();
            let flags = unsafe { fcntl(fd, libc::F_GETFL) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        tracing::debug!("fd {} tracked, socket={}", fd, is_socket);
        Self {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Relaxed);
    }

    pub fn timeout_ms(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Relaxed),
        }
    }

    pub fn set_timeout_ms(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Relaxed),
        }
    }
}

/// Singleton table of [`FdCtx`] entries, indexed by fd.
pub struct FdManager {
    fds: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    pub fn instance() -> &'static FdManager {
        static INSTANCE: OnceLock<FdManager> = OnceLock::new();
        INSTANCE.get_or_init(|| FdManager {
            fds: RwLock::new(vec![None; 64]),
        })
    }

    /// Look up the context for `fd`, creating one when `auto_create`.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let table = self.fds.read().unwrap();
            match table.get(idx) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }
        let mut table = self.fds.write().unwrap();
        if table.len() <= idx {
            let new_len = idx + idx / 2 + 1;
            table.resize(new_len, None);
        }
        Some(
            table[idx]
                .get_or_insert_with(|| Arc::new(FdCtx::new(fd)))
                .clone(),
        )
    }

    /// Forget `fd`. Called by the close hook.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut table = self.fds.write().unwrap();
        if let Some(slot) = table.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.closed.store(true, Ordering::Relaxed);
                tracing::debug!("fd {} untracked", fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_fd_is_not_socket() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = FdManager::instance().get(fds[0], true).unwrap();
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());
        FdManager::instance().del(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_socket_forced_nonblocking() {
        let mut pair = [0; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr()) },
            0
        );
        let ctx = FdManager::instance().get(pair[0], true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        let flags = unsafe { libc::fcntl(pair[0], libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0, "kernel flag should be set");

        assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), NO_TIMEOUT);
        ctx.set_timeout_ms(TimeoutKind::Recv, 100);
        assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), 100);

        FdManager::instance().del(pair[0]);
        unsafe {
            libc::close(pair[0]);
            libc::close(pair[1]);
        }
    }

    #[test]
    fn test_get_without_create() {
        // A huge fd nobody tracked.
        assert!(FdManager::instance().get(100_000, false).is_none());
        assert!(FdManager::instance().get(-1, true).is_none());
    }
}
