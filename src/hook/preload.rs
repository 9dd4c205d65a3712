//! `#[no_mangle]` exports of the hooked symbols for LD_PRELOAD use.
//!
//! Linking these into a process routes every call to the listed libc names
//! through the runtime's hooks; threads without hooking enabled fall
//! through to the real symbols via the `dlsym(RTLD_NEXT)` table.
//!
//! `fcntl` and `ioctl` are exported with a fixed third argument instead of
//! C variadics (which Rust cannot define); the SysV ABI passes the first
//! variadic argument in the same register either way.

use libc::{c_int, c_long, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};

#[no_mangle]
pub extern "C" fn sleep(seconds: c_uint) -> c_uint {
    super::sleep(seconds)
}

#[no_mangle]
pub extern "C" fn usleep(usec: libc::useconds_t) -> c_int {
    super::usleep(usec)
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    unsafe { super::nanosleep(req, rem) }
}

#[no_mangle]
pub extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    super::socket(domain, ty, protocol)
}

#[no_mangle]
pub unsafe extern "C" fn connect(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> c_int {
    unsafe { super::connect(fd, addr, addrlen) }
}

#[no_mangle]
pub unsafe extern "C" fn accept(
    fd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    unsafe { super::accept(fd, addr, addrlen) }
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    unsafe { super::read(fd, buf, count) }
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    unsafe { super::readv(fd, iov, iovcnt) }
}

#[no_mangle]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    unsafe { super::recv(fd, buf, len, flags) }
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    unsafe { super::recvfrom(fd, buf, len, flags, src_addr, addrlen) }
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    unsafe { super::recvmsg(fd, msg, flags) }
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    unsafe { super::write(fd, buf, count) }
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    unsafe { super::writev(fd, iov, iovcnt) }
}

#[no_mangle]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    unsafe { super::send(fd, buf, len, flags) }
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    to: *const libc::sockaddr,
    tolen: socklen_t,
) -> ssize_t {
    unsafe { super::sendto(fd, buf, len, flags, to, tolen) }
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    unsafe { super::sendmsg(fd, msg, flags) }
}

#[no_mangle]
pub extern "C" fn close(fd: c_int) -> c_int {
    super::close(fd)
}

#[no_mangle]
pub extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    super::fcntl(fd, cmd, arg)
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    unsafe { super::ioctl(fd, request, arg) }
}

#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { super::getsockopt(fd, level, optname, optval, optlen) }
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    unsafe { super::setsockopt(fd, level, optname, optval, optlen) }
}
