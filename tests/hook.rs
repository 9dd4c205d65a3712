//! Hooked syscall tests: cooperative sleep, timeouts, the non-blocking
//! flag split, connect.
//!
//! Worker-side observations are collected into shared state and asserted
//! on the test thread; fiber bodies must not panic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fiberio::{hook, FdManager, IoManager};

fn wait_until(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn socketpair() -> (libc::c_int, libc::c_int) {
    let mut pair = [0; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr()) },
        0
    );
    (pair[0], pair[1])
}

#[test]
fn test_hooked_sleep_runs_fibers_concurrently() {
    let iom = IoManager::new(1, false, "hook-sleep").unwrap();

    let start = Instant::now();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let done = done.clone();
        iom.schedule(move || {
            hook::sleep(1);
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(wait_until(
        || done.load(Ordering::SeqCst) == 10,
        Duration::from_secs(5)
    ));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(950), "slept {:?}", elapsed);
    // Ten cooperative sleeps on one worker overlap instead of serializing.
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);

    iom.stop();
}

#[test]
fn test_sleep_zero_returns_promptly() {
    let iom = IoManager::new(1, false, "hook-sleep0").unwrap();

    let start = Instant::now();
    let elapsed_ms = Arc::new(AtomicUsize::new(usize::MAX));
    {
        let elapsed_ms = elapsed_ms.clone();
        iom.schedule(move || {
            hook::sleep(0);
            elapsed_ms.store(start.elapsed().as_millis() as usize, Ordering::SeqCst);
        });
    }

    assert!(wait_until(
        || elapsed_ms.load(Ordering::SeqCst) != usize::MAX,
        Duration::from_secs(2)
    ));
    assert!(elapsed_ms.load(Ordering::SeqCst) < 500);

    iom.stop();
}

#[test]
fn test_usleep_parks_fiber() {
    let iom = IoManager::new(1, false, "hook-usleep").unwrap();

    let start = Instant::now();
    let elapsed_ms = Arc::new(AtomicUsize::new(usize::MAX));
    {
        let elapsed_ms = elapsed_ms.clone();
        iom.schedule(move || {
            hook::usleep(200_000);
            elapsed_ms.store(start.elapsed().as_millis() as usize, Ordering::SeqCst);
        });
    }

    assert!(wait_until(
        || elapsed_ms.load(Ordering::SeqCst) != usize::MAX,
        Duration::from_secs(2)
    ));
    let ms = elapsed_ms.load(Ordering::SeqCst);
    assert!((180..1000).contains(&ms), "usleep(200ms) took {}ms", ms);

    iom.stop();
}

#[test]
fn test_read_times_out_with_so_rcvtimeo() {
    let iom = IoManager::new(1, false, "hook-timeout").unwrap();
    let (a, b) = socketpair();

    // (return value, errno, elapsed ms)
    let outcome: Arc<Mutex<Option<(isize, i32, u128)>>> = Arc::new(Mutex::new(None));
    {
        let outcome = outcome.clone();
        iom.schedule(move || {
            // Track the fd so the hooks manage it, then ask for a 100ms
            // receive timeout.
            FdManager::instance().get(a, true);
            let tv = libc::timeval {
                tv_sec: 0,
                tv_usec: 100_000,
            };
            unsafe {
                hook::setsockopt(
                    a,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &tv as *const libc::timeval as *const libc::c_void,
                    std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                );
            }

            let start = Instant::now();
            let mut buf = [0u8; 16];
            let n = unsafe { hook::read(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            *outcome.lock().unwrap() = Some((n, err, start.elapsed().as_millis()));
        });
    }

    assert!(wait_until(
        || outcome.lock().unwrap().is_some(),
        Duration::from_secs(3)
    ));
    let (n, err, ms) = outcome.lock().unwrap().unwrap();
    assert_eq!(n, -1);
    assert_eq!(err, libc::ETIMEDOUT);
    assert!((80..1000).contains(&(ms as usize)), "timed out after {}ms", ms);
    assert_eq!(iom.pending_events(), 0, "the timed-out event must be gone");

    // The fd stays usable: with data queued the same read succeeds.
    assert_eq!(
        unsafe { libc::write(b, b"ok".as_ptr() as *const libc::c_void, 2) },
        2
    );
    let second: Arc<Mutex<Option<isize>>> = Arc::new(Mutex::new(None));
    {
        let second = second.clone();
        iom.schedule(move || {
            let mut buf = [0u8; 16];
            let n = unsafe { hook::read(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            *second.lock().unwrap() = Some(n);
        });
    }
    assert!(wait_until(
        || second.lock().unwrap().is_some(),
        Duration::from_secs(2)
    ));
    assert_eq!(second.lock().unwrap().unwrap(), 2);

    iom.stop();
    FdManager::instance().del(a);
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn test_hooked_read_waits_for_data() {
    let iom = IoManager::new(1, false, "hook-read").unwrap();
    let (a, b) = socketpair();

    let got: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    {
        let got = got.clone();
        iom.schedule(move || {
            FdManager::instance().get(a, true);
            let mut buf = [0u8; 16];
            // No timeout set: parks until the peer writes.
            let n = unsafe { hook::read(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n > 0 {
                *got.lock().unwrap() = Some(buf[..n as usize].to_vec());
            }
        });
    }

    std::thread::sleep(Duration::from_millis(100));
    assert!(got.lock().unwrap().is_none(), "read should still be parked");
    assert_eq!(
        unsafe { libc::write(b, b"hello".as_ptr() as *const libc::c_void, 5) },
        5
    );

    assert!(wait_until(
        || got.lock().unwrap().is_some(),
        Duration::from_secs(2)
    ));
    assert_eq!(got.lock().unwrap().as_deref(), Some(b"hello".as_ref()));

    iom.stop();
    FdManager::instance().del(a);
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn test_fcntl_hides_forced_nonblock() {
    let iom = IoManager::new(1, false, "hook-fcntl").unwrap();

    // (kernel nonblock, user-visible before, user-visible after F_SETFL)
    let outcome: Arc<Mutex<Option<(bool, bool, bool)>>> = Arc::new(Mutex::new(None));
    {
        let outcome = outcome.clone();
        iom.schedule(move || {
            let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            if fd < 0 {
                return;
            }
            let kernel = unsafe { libc::fcntl(fd, libc::F_GETFL) } & libc::O_NONBLOCK != 0;
            let before = hook::fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0;

            // Ask for non-blocking explicitly; the user view flips, the
            // kernel flag stays set either way.
            let flags = hook::fcntl(fd, libc::F_GETFL, 0);
            hook::fcntl(fd, libc::F_SETFL, (flags | libc::O_NONBLOCK) as libc::c_long);
            let after = hook::fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0;

            hook::close(fd);
            *outcome.lock().unwrap() = Some((kernel, before, after));
        });
    }

    assert!(wait_until(
        || outcome.lock().unwrap().is_some(),
        Duration::from_secs(2)
    ));
    let (kernel, before, after) = outcome.lock().unwrap().unwrap();
    assert!(kernel, "runtime must force the kernel flag on");
    assert!(!before, "user view defaults to blocking");
    assert!(after, "user-requested O_NONBLOCK must read back");

    iom.stop();
}

#[test]
fn test_setsockopt_timeout_roundtrip() {
    let iom = IoManager::new(1, false, "hook-sockopt").unwrap();

    // (mirrored ms in fd context, timeval read back via getsockopt)
    let outcome: Arc<Mutex<Option<(u64, i64)>>> = Arc::new(Mutex::new(None));
    {
        let outcome = outcome.clone();
        iom.schedule(move || {
            let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            if fd < 0 {
                return;
            }
            let tv = libc::timeval {
                tv_sec: 2,
                tv_usec: 500_000,
            };
            unsafe {
                hook::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &tv as *const libc::timeval as *const libc::c_void,
                    std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                );
            }
            let mirrored = FdManager::instance()
                .get(fd, false)
                .map(|ctx| ctx.timeout_ms(fiberio::TimeoutKind::Recv))
                .unwrap_or(0);

            let mut back = libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            };
            let mut len = std::mem::size_of::<libc::timeval>() as libc::socklen_t;
            unsafe {
                hook::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &mut back as *mut libc::timeval as *mut libc::c_void,
                    &mut len,
                )
            };
            hook::close(fd);
            let back_ms = back.tv_sec as i64 * 1000 + back.tv_usec as i64 / 1000;
            *outcome.lock().unwrap() = Some((mirrored, back_ms));
        });
    }

    assert!(wait_until(
        || outcome.lock().unwrap().is_some(),
        Duration::from_secs(2)
    ));
    let (mirrored, back_ms) = outcome.lock().unwrap().unwrap();
    assert_eq!(mirrored, 2500);
    assert_eq!(back_ms, 2500);

    iom.stop();
}

#[test]
fn test_hooked_connect_surfaces_refusal() {
    let iom = IoManager::new(1, false, "hook-conn").unwrap();

    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    // (return value, errno)
    let outcome: Arc<Mutex<Option<(i32, i32)>>> = Arc::new(Mutex::new(None));
    {
        let outcome = outcome.clone();
        iom.schedule(move || {
            let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            if fd < 0 {
                return;
            }
            let addr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: port.to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes([127, 0, 0, 1]),
                },
                sin_zero: [0; 8],
            };
            let rc = unsafe {
                hook::connect(
                    fd,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            hook::close(fd);
            *outcome.lock().unwrap() = Some((rc, err));
        });
    }

    assert!(wait_until(
        || outcome.lock().unwrap().is_some(),
        Duration::from_secs(3)
    ));
    let (rc, err) = outcome.lock().unwrap().unwrap();
    assert_eq!(rc, -1);
    assert_eq!(err, libc::ECONNREFUSED);
    assert_eq!(iom.pending_events(), 0);

    iom.stop();
}

#[test]
fn test_hooked_connect_reaches_listener() -> anyhow::Result<()> {
    let iom = IoManager::new(1, false, "hook-conn-ok")?;

    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();

    let outcome: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));
    {
        let outcome = outcome.clone();
        iom.schedule(move || {
            let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            if fd < 0 {
                return;
            }
            let addr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: port.to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes([127, 0, 0, 1]),
                },
                sin_zero: [0; 8],
            };
            let rc = unsafe {
                hook::connect(
                    fd,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            hook::close(fd);
            *outcome.lock().unwrap() = Some(rc);
        });
    }

    let accepted = listener.accept();
    assert!(accepted.is_ok());
    assert!(wait_until(
        || outcome.lock().unwrap().is_some(),
        Duration::from_secs(3)
    ));
    assert_eq!(outcome.lock().unwrap().unwrap(), 0);

    iom.stop();
    Ok(())
}
