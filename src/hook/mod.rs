//! Cooperative replacements for the blocking Unix I/O calls.
//!
//! Each function here keeps the signature and errno contract of its POSIX
//! namesake but interprets "would block" as a suspension signal: the call
//! registers interest with the reactor, parks the current fiber, and
//! retries once readiness (or a timeout) schedules it again. Code running
//! inside a scheduler worker gets this behavior automatically; on other
//! threads, and whenever the thread-local switch is off, every function
//! falls straight through to the real symbol.
//!
//! The real symbols are resolved once per process through
//! `dlsym(RTLD_NEXT)`, so the same code works whether or not the `preload`
//! feature interposes the public names.

#[cfg(feature = "preload")]
mod preload;

use std::cell::Cell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use libc::{c_int, c_long, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};

use crate::config;
use crate::config::NO_TIMEOUT;
use crate::fd_manager::{FdManager, TimeoutKind};
use crate::fiber::Fiber;
use crate::io::{IoEvent, Reactor};
use crate::scheduler::Scheduler;
use crate::timer::TimerCallback;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread routes hooked syscalls through the runtime.
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Turn hooking on or off for the calling thread. Scheduler workers enable
/// it on entry; every other thread defaults to off.
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|c| c.set(enabled));
}

/// Lazily resolved original symbols.
pub(crate) mod origin {
    use super::*;

    pub type SleepFn = unsafe extern "C" fn(c_uint) -> c_uint;
    pub type UsleepFn = unsafe extern "C" fn(libc::useconds_t) -> c_int;
    pub type NanosleepFn =
        unsafe extern "C" fn(*const libc::timespec, *mut libc::timespec) -> c_int;
    pub type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
    pub type ConnectFn = unsafe extern "C" fn(c_int, *const libc::sockaddr, socklen_t) -> c_int;
    pub type AcceptFn =
        unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut socklen_t) -> c_int;
    pub type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
    pub type ReadvFn = unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> ssize_t;
    pub type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
    pub type RecvfromFn = unsafe extern "C" fn(
        c_int,
        *mut c_void,
        size_t,
        c_int,
        *mut libc::sockaddr,
        *mut socklen_t,
    ) -> ssize_t;
    pub type RecvmsgFn = unsafe extern "C" fn(c_int, *mut libc::msghdr, c_int) -> ssize_t;
    pub type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
    pub type WritevFn = unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> ssize_t;
    pub type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
    pub type SendtoFn = unsafe extern "C" fn(
        c_int,
        *const c_void,
        size_t,
        c_int,
        *const libc::sockaddr,
        socklen_t,
    ) -> ssize_t;
    pub type SendmsgFn = unsafe extern "C" fn(c_int, *const libc::msghdr, c_int) -> ssize_t;
    pub type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
    pub type FcntlFn = unsafe extern "C" fn(c_int, c_int, ...) -> c_int;
    pub type IoctlFn = unsafe extern "C" fn(c_int, c_ulong, ...) -> c_int;
    pub type GetsockoptFn =
        unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int;
    pub type SetsockoptFn =
        unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;

    fn lookup(symbol: &'static [u8]) -> *mut c_void {
        let ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr() as *const libc::c_char) };
        if ptr.is_null() {
            tracing::error!(
                "dlsym(RTLD_NEXT) failed for {:?}",
                std::str::from_utf8(&symbol[..symbol.len() - 1]).unwrap_or("?")
            );
        }
        ptr
    }

    macro_rules! origin_fn {
        ($getter:ident, $cache:ident, $ty:ty, $symbol:literal) => {
            pub fn $getter() -> $ty {
                static $cache: OnceLock<$ty> = OnceLock::new();
                *$cache.get_or_init(|| {
                    // Option<fn> shares the fn pointer's layout; null maps
                    // to None instead of an invalid fn pointer.
                    unsafe { std::mem::transmute::<*mut c_void, Option<$ty>>(lookup($symbol)) }
                        .expect("libc symbol must resolve")
                })
            }
        };
    }

    origin_fn!(sleep_f, SLEEP, SleepFn, b"sleep\0");
    origin_fn!(usleep_f, USLEEP, UsleepFn, b"usleep\0");
    origin_fn!(nanosleep_f, NANOSLEEP, NanosleepFn, b"nanosleep\0");
    origin_fn!(socket_f, SOCKET, SocketFn, b"socket\0");
    origin_fn!(connect_f, CONNECT, ConnectFn, b"connect\0");
    origin_fn!(accept_f, ACCEPT, AcceptFn, b"accept\0");
    origin_fn!(read_f, READ, ReadFn, b"read\0");
    origin_fn!(readv_f, READV, ReadvFn, b"readv\0");
    origin_fn!(recv_f, RECV, RecvFn, b"recv\0");
    origin_fn!(recvfrom_f, RECVFROM, RecvfromFn, b"recvfrom\0");
    origin_fn!(recvmsg_f, RECVMSG, RecvmsgFn, b"recvmsg\0");
    origin_fn!(write_f, WRITE, WriteFn, b"write\0");
    origin_fn!(writev_f, WRITEV, WritevFn, b"writev\0");
    origin_fn!(send_f, SEND, SendFn, b"send\0");
    origin_fn!(sendto_f, SENDTO, SendtoFn, b"sendto\0");
    origin_fn!(sendmsg_f, SENDMSG, SendmsgFn, b"sendmsg\0");
    origin_fn!(close_f, CLOSE, CloseFn, b"close\0");
    origin_fn!(fcntl_f, FCNTL, FcntlFn, b"fcntl\0");
    origin_fn!(ioctl_f, IOCTL, IoctlFn, b"ioctl\0");
    origin_fn!(getsockopt_f, GETSOCKOPT, GetsockoptFn, b"getsockopt\0");
    origin_fn!(setsockopt_f, SETSOCKOPT, SetsockoptFn, b"setsockopt\0");
}

fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

fn set_errno(value: c_int) {
    unsafe { *libc::__errno_location() = value };
}

/// Shared witness between a waiting fiber and its timeout timer. The timer
/// stores the errno to surface; zero means "not cancelled".
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// Common suspend-and-retry template for the read/write style hooks.
///
/// `f` performs the actual (non-blocking) syscall and is re-invoked after
/// each readiness wakeup until it completes or the per-direction timeout
/// from the fd context fires.
fn do_io(
    fd: c_int,
    name: &'static str,
    event: IoEvent,
    timeout_kind: TimeoutKind,
    f: impl Fn() -> ssize_t,
) -> ssize_t {
    if !is_hook_enabled() {
        return f();
    }
    let Some(ctx) = FdManager::instance().get(fd, false) else {
        return f();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return f();
    }

    let timeout = ctx.timeout_ms(timeout_kind);
    let tinfo = Arc::new(TimerInfo::default());

    loop {
        let mut n = f();
        while n == -1 && errno() == libc::EINTR {
            n = f();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        // Not ready: park this fiber until the reactor sees readiness.
        let Some(reactor) = Reactor::current() else {
            tracing::error!("{} hook has no reactor on this thread", name);
            return n;
        };

        let timer = if timeout != NO_TIMEOUT {
            let winfo = Arc::downgrade(&tinfo);
            let wreactor = Arc::downgrade(&reactor);
            let cb: TimerCallback = Arc::new(move || {
                let Some(info) = winfo.upgrade() else {
                    return;
                };
                if info.cancelled.swap(libc::ETIMEDOUT, Ordering::SeqCst) != 0 {
                    return;
                }
                if let Some(reactor) = wreactor.upgrade() {
                    reactor.cancel_event(fd, event);
                }
            });
            Some(reactor.add_condition_timer(timeout, cb, Arc::downgrade(&tinfo), false))
        } else {
            None
        };

        if let Err(e) = reactor.add_event(fd, event, None) {
            tracing::error!("{} add_event({}, {:?}) failed: {}", name, fd, event, e);
            if let Some(timer) = timer {
                timer.cancel();
            }
            return -1;
        }

        Fiber::yield_now();

        if let Some(timer) = timer {
            timer.cancel();
        }
        let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // Readiness was reported; go around and retry the call.
    }
}

/// Park the current fiber for `ms` milliseconds using the reactor's timer
/// set. Falls back to the real call when hooking is off.
fn sleep_ms(ms: u64) -> bool {
    let (Some(reactor), Some(scheduler)) = (Reactor::current(), Scheduler::current()) else {
        return false;
    };
    let fiber = Fiber::current();
    let weak = Arc::downgrade(&scheduler);
    reactor.add_timer(
        ms,
        Arc::new(move || {
            if let Some(sched) = weak.upgrade() {
                sched.schedule_fiber(fiber.clone());
            }
        }),
        false,
    );
    Fiber::yield_now();
    true
}

pub fn sleep(seconds: c_uint) -> c_uint {
    if is_hook_enabled() && sleep_ms(seconds as u64 * 1000) {
        return 0;
    }
    unsafe { origin::sleep_f()(seconds) }
}

pub fn usleep(usec: libc::useconds_t) -> c_int {
    if is_hook_enabled() && sleep_ms(usec as u64 / 1000) {
        return 0;
    }
    unsafe { origin::usleep_f()(usec) }
}

/// # Safety
/// `req` must point to a valid timespec; `rem` may be null.
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if is_hook_enabled() {
        if req.is_null() {
            set_errno(libc::EINVAL);
            return -1;
        }
        let spec = unsafe { &*req };
        let ms = spec.tv_sec as u64 * 1000 + spec.tv_nsec as u64 / 1_000_000;
        if sleep_ms(ms) {
            return 0;
        }
    }
    unsafe { origin::nanosleep_f()(req, rem) }
}

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { origin::socket_f()(domain, ty, protocol) };
    if !is_hook_enabled() || fd == -1 {
        return fd;
    }
    FdManager::instance().get(fd, true);
    fd
}

/// Connect with an explicit timeout in milliseconds ([`NO_TIMEOUT`] = wait
/// forever).
///
/// # Safety
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_hook_enabled() {
        return unsafe { origin::connect_f()(fd, addr, addrlen) };
    }
    let Some(ctx) = FdManager::instance().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { origin::connect_f()(fd, addr, addrlen) };
    }

    let n = unsafe { origin::connect_f()(fd, addr, addrlen) };
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(reactor) = Reactor::current() else {
        return n;
    };
    let tinfo = Arc::new(TimerInfo::default());
    let timer = if timeout_ms != NO_TIMEOUT {
        let winfo = Arc::downgrade(&tinfo);
        let wreactor = Arc::downgrade(&reactor);
        let cb: TimerCallback = Arc::new(move || {
            let Some(info) = winfo.upgrade() else {
                return;
            };
            if info.cancelled.swap(libc::ETIMEDOUT, Ordering::SeqCst) != 0 {
                return;
            }
            if let Some(reactor) = wreactor.upgrade() {
                reactor.cancel_event(fd, IoEvent::Write);
            }
        });
        Some(reactor.add_condition_timer(timeout_ms, cb, Arc::downgrade(&tinfo), false))
    } else {
        None
    };

    match reactor.add_event(fd, IoEvent::Write, None) {
        Ok(()) => {
            Fiber::yield_now();
            if let Some(timer) = timer {
                timer.cancel();
            }
            let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(timer) = timer {
                timer.cancel();
            }
            tracing::error!("connect add_event({}, WRITE) failed: {}", fd, e);
        }
    }

    // Writability only means the handshake finished; SO_ERROR has the
    // verdict.
    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let rc = unsafe {
        origin::getsockopt_f()(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut c_int as *mut c_void,
            &mut len,
        )
    };
    if rc == -1 {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// # Safety
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    unsafe { connect_with_timeout(fd, addr, addrlen, config::tcp_connect_timeout_ms()) }
}

/// # Safety
/// `addr`/`addrlen` follow the POSIX `accept` contract (both may be null).
pub unsafe fn accept(fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let new_fd = do_io(fd, "accept", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        origin::accept_f()(fd, addr, addrlen) as ssize_t
    }) as c_int;
    if new_fd >= 0 {
        FdManager::instance().get(new_fd, true);
    }
    new_fd
}

/// # Safety
/// `buf` must be valid for `count` bytes of writes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        origin::read_f()(fd, buf, count)
    })
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        origin::readv_f()(fd, iov, iovcnt)
    })
}

/// # Safety
/// `buf` must be valid for `len` bytes of writes.
pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "recv", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        origin::recv_f()(fd, buf, len, flags)
    })
}

/// # Safety
/// Pointer arguments follow the POSIX `recvfrom` contract.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(fd, "recvfrom", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        origin::recvfrom_f()(fd, buf, len, flags, src_addr, addrlen)
    })
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "recvmsg", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        origin::recvmsg_f()(fd, msg, flags)
    })
}

/// # Safety
/// `buf` must be valid for `count` bytes of reads.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", IoEvent::Write, TimeoutKind::Send, || unsafe {
        origin::write_f()(fd, buf, count)
    })
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", IoEvent::Write, TimeoutKind::Send, || unsafe {
        origin::writev_f()(fd, iov, iovcnt)
    })
}

/// # Safety
/// `buf` must be valid for `len` bytes of reads.
pub unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "send", IoEvent::Write, TimeoutKind::Send, || unsafe {
        origin::send_f()(fd, buf, len, flags)
    })
}

/// # Safety
/// Pointer arguments follow the POSIX `sendto` contract.
pub unsafe fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    to: *const libc::sockaddr,
    tolen: socklen_t,
) -> ssize_t {
    do_io(fd, "sendto", IoEvent::Write, TimeoutKind::Send, || unsafe {
        origin::sendto_f()(fd, buf, len, flags, to, tolen)
    })
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "sendmsg", IoEvent::Write, TimeoutKind::Send, || unsafe {
        origin::sendmsg_f()(fd, msg, flags)
    })
}

pub fn close(fd: c_int) -> c_int {
    if !is_hook_enabled() {
        return unsafe { origin::close_f()(fd) };
    }
    if FdManager::instance().get(fd, false).is_some() {
        if let Some(reactor) = Reactor::current() {
            reactor.cancel_all(fd);
        }
        FdManager::instance().del(fd);
    }
    unsafe { origin::close_f()(fd) }
}

/// `fcntl` with the user/kernel O_NONBLOCK split: `F_SETFL` records the
/// caller's intent but leaves the kernel flag set for tracked sockets, and
/// `F_GETFL` reports the flags as the caller last requested them.
///
/// The third argument is a fixed `c_long`; every dispatched command passes
/// either an int or a pointer, both of which travel in the same register.
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            match FdManager::instance().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                    unsafe { origin::fcntl_f()(fd, cmd, flags) }
                }
                _ => unsafe { origin::fcntl_f()(fd, cmd, arg) },
            }
        }
        libc::F_GETFL => {
            let flags = unsafe { origin::fcntl_f()(fd, cmd) };
            if flags == -1 {
                return flags;
            }
            match FdManager::instance().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => unsafe { origin::fcntl_f()(fd, cmd, arg) },
    }
}

/// `ioctl` with `FIONBIO` routed through the fd context like `F_SETFL`.
///
/// # Safety
/// `arg` must be valid for the given request.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong {
        let user_nonblock = unsafe { *(arg as *const c_int) } != 0;
        if let Some(ctx) = FdManager::instance().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    unsafe { origin::ioctl_f()(fd, request, arg) }
}

/// Plain pass-through; timeouts read back whatever the kernel stored.
///
/// # Safety
/// Pointer arguments follow the POSIX `getsockopt` contract.
pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { origin::getsockopt_f()(fd, level, optname, optval, optlen) }
}

/// Pass-through that additionally mirrors `SO_RCVTIMEO`/`SO_SNDTIMEO` into
/// the fd context so the hooks can honor them.
///
/// # Safety
/// `optval` must be valid for `optlen` bytes.
pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = FdManager::instance().get(fd, true) {
            let tv = unsafe { &*(optval as *const libc::timeval) };
            // A zero timeval means "block forever" per POSIX.
            let ms = if tv.tv_sec == 0 && tv.tv_usec == 0 {
                NO_TIMEOUT
            } else {
                tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000
            };
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout_ms(kind, ms);
        }
    }
    unsafe { origin::setsockopt_f()(fd, level, optname, optval, optlen) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_flag_is_per_thread() {
        assert!(!is_hook_enabled());
        set_hook_enabled(true);
        assert!(is_hook_enabled());
        std::thread::spawn(|| assert!(!is_hook_enabled()))
            .join()
            .unwrap();
        set_hook_enabled(false);
    }

    #[test]
    fn test_origin_symbols_resolve() {
        // dlsym must find the real libc entry points.
        assert_eq!(unsafe { origin::sleep_f()(0) }, 0);
        let fd = unsafe { origin::socket_f()(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        assert_eq!(unsafe { origin::close_f()(fd) }, 0);
    }

    #[test]
    fn test_unhooked_calls_pass_through() {
        // Hook disabled on this thread: behaves exactly like libc.
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut buf = [0u8; 4];
        assert_eq!(
            unsafe { write(fds[1], b"ping".as_ptr() as *const c_void, 4) },
            4
        );
        assert_eq!(
            unsafe { read(fds[0], buf.as_mut_ptr() as *mut c_void, 4) },
            4
        );
        assert_eq!(&buf, b"ping");
        assert_eq!(close(fds[0]), 0);
        assert_eq!(close(fds[1]), 0);
    }
}
