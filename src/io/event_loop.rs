//! Thin epoll wrapper.
//!
//! Everything is registered edge-triggered; the reactor re-arms interest
//! explicitly after each firing. The token travels in the event's user data
//! and is the registered fd itself.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::RuntimeError;

/// Upper bound on readiness events taken per wait; more ready fds simply
/// surface on the next wait.
pub(crate) const MAX_EVENTS: usize = 256;

pub(crate) struct EventLoop {
    epfd: RawFd,
}

impl EventLoop {
    pub fn new() -> Result<Self, RuntimeError> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RuntimeError::EpollCreate(io::Error::last_os_error()));
        }
        Ok(Self { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: mask | libc::EPOLLET as u32,
            u64: token,
        };
        let event_ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut event
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, event_ptr) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn add(&self, fd: RawFd, mask: u32, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, mask, token)
    }

    pub fn modify(&self, fd: RawFd, mask: u32, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, mask, token)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Wait for readiness, retrying in place on EINTR.
    pub fn wait(&self, events: &mut Vec<libc::epoll_event>, timeout_ms: i32) -> io::Result<usize> {
        events.clear();
        loop {
            let count = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    timeout_ms,
                )
            };
            if count < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            unsafe { events.set_len(count as usize) };
            return Ok(count as usize);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_loop_creation() {
        assert!(EventLoop::new().is_ok());
    }

    #[test]
    fn test_register_and_poll_pipe() {
        let ep = EventLoop::new().unwrap();
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        ep.add(fds[0], libc::EPOLLIN as u32, fds[0] as u64).unwrap();
        let mut events = Vec::with_capacity(MAX_EVENTS);
        assert_eq!(ep.wait(&mut events, 0).unwrap(), 0);

        assert_eq!(
            unsafe { libc::write(fds[1], b"x".as_ptr() as *const libc::c_void, 1) },
            1
        );
        let n = ep.wait(&mut events, 100).unwrap();
        assert_eq!(n, 1);
        let token = events[0].u64;
        assert_eq!(token, fds[0] as u64);

        ep.delete(fds[0]).unwrap();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
