//! Fiber lifecycle tests: resume/yield cycles, reset, sharing.

use std::sync::{Arc, Mutex};

use fiberio::{Fiber, FiberState};

#[test]
fn test_resume_yield_cycle() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let body_log = log.clone();

    // Initialize this thread's main fiber first.
    Fiber::current();

    let fiber = Fiber::new(
        move || {
            body_log.lock().unwrap().push("A");
            Fiber::yield_now();
            body_log.lock().unwrap().push("B");
        },
        0,
        false,
    )
    .unwrap();

    assert_eq!(fiber.state(), FiberState::Ready);
    assert_eq!(Arc::strong_count(&fiber), 1);

    fiber.resume();
    assert_eq!(*log.lock().unwrap(), vec!["A"]);
    assert_eq!(fiber.state(), FiberState::Ready);
    // The trampoline keeps a reference while the body is suspended.
    assert_eq!(Arc::strong_count(&fiber), 2);

    fiber.resume();
    assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
    assert_eq!(fiber.state(), FiberState::Term);
    assert_eq!(Arc::strong_count(&fiber), 1);
}

#[test]
fn test_reset_reuses_stack() {
    Fiber::current();
    let log: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    let body = log.clone();
    let fiber = Fiber::new(move || body.lock().unwrap().push(1), 0, false).unwrap();
    fiber.resume();
    assert_eq!(fiber.state(), FiberState::Term);

    let body = log.clone();
    fiber.reset(move || body.lock().unwrap().push(2)).unwrap();
    assert_eq!(fiber.state(), FiberState::Ready);
    fiber.resume();

    assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    assert_eq!(fiber.state(), FiberState::Term);
}

#[test]
fn test_resume_refused_when_term() {
    Fiber::current();
    let fiber = Fiber::new(|| {}, 0, false).unwrap();
    fiber.resume();
    assert_eq!(fiber.state(), FiberState::Term);
    // Refused with a logged error, not a crash.
    fiber.resume();
    assert_eq!(fiber.state(), FiberState::Term);
}

#[test]
fn test_fiber_id_visible_inside_body() {
    Fiber::current();
    let seen = Arc::new(Mutex::new(0u64));
    let inner = seen.clone();
    let fiber = Fiber::new(
        move || {
            *inner.lock().unwrap() = Fiber::fiber_id();
        },
        0,
        false,
    )
    .unwrap();
    let id = fiber.id();
    fiber.resume();
    assert_eq!(*seen.lock().unwrap(), id);
}

#[test]
fn test_fibers_on_two_threads() {
    let run = || {
        Fiber::current();
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let body = log.clone();
        let fiber = Fiber::new(
            move || {
                body.lock().unwrap().push("begin");
                Fiber::yield_now();
                body.lock().unwrap().push("end");
            },
            0,
            false,
        )
        .unwrap();
        fiber.resume();
        fiber.resume();
        assert_eq!(*log.lock().unwrap(), vec!["begin", "end"]);
    };

    let a = std::thread::spawn(run);
    let b = std::thread::spawn(run);
    a.join().unwrap();
    b.join().unwrap();
}

#[test]
fn test_custom_stack_size() {
    Fiber::current();
    let fiber = Fiber::new(|| {}, 256 * 1024, false).unwrap();
    fiber.resume();
    assert_eq!(fiber.state(), FiberState::Term);
}
