//! Small OS helpers shared across the runtime.

/// OS thread id of the calling thread (the kernel tid, not `pthread_self`).
///
/// Task pinning and the caller-thread bookkeeping in the scheduler compare
/// these ids, so they must match what the kernel reports for the thread.
pub fn thread_id() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Milliseconds on the raw monotonic clock.
///
/// All timer deadlines are expressed on this clock. `CLOCK_MONOTONIC_RAW`
/// is immune to NTP slewing; the timer set still guards against the clock
/// being stepped backwards.
pub fn now_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_is_stable() {
        assert_eq!(thread_id(), thread_id());
        let main_tid = thread_id();
        let other = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(main_tid, other);
    }

    #[test]
    fn test_now_ms_monotonic() {
        let a = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a + 4);
    }
}
