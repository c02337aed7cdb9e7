//! Releasing the execution lock around native work

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tether::args::arg;
use tether::lock::{without_lock, without_lock_interruptible};
use tether::{Attachment, Error, Module};
use tether_sandbox::Sandbox;

fn boot() -> (Rc<Sandbox>, Attachment) {
    let sandbox = Sandbox::new();
    let attached = sandbox.attach().unwrap();
    (sandbox, attached)
}

#[test]
fn test_without_lock_returns_value() {
    let (sandbox, _attached) = boot();

    let data = vec![3_u64, 4, 5];
    let sum = without_lock(move || data.iter().sum::<u64>()).unwrap();
    assert_eq!(sum, 12);
    assert!(!sandbox.is_lock_released());
}

#[test]
fn test_without_lock_requires_runtime() {
    let err = without_lock(|| 1).unwrap_err();
    assert!(matches!(err, Error::Runtime(_)), "{err}");
    assert_eq!(err.to_string(), "no runtime is attached to this thread");
}

#[test]
fn test_released_section_inside_native_method() {
    let (sandbox, _attached) = boot();
    Module::object()
        .unwrap()
        .define_method("checksum", (arg::<String>("text"),), |(text,)| {
            without_lock(move || text.bytes().map(u64::from).sum::<u64>())
        })
        .unwrap();

    let result = sandbox.call(tether::Handle::NIL, "checksum", &[sandbox.string("ab")]);
    assert_eq!(result, sandbox.int(97 + 98));
}

#[test]
fn test_interrupt_from_another_thread() {
    let (sandbox, _attached) = boot();
    let handle = sandbox.interrupt_handle();

    let stop = Arc::new(AtomicBool::new(false));
    let unblocked = Arc::new(AtomicUsize::new(0));

    let watcher = {
        let handle = handle.clone();
        thread::spawn(move || {
            while !handle.is_released() {
                thread::sleep(Duration::from_millis(1));
            }
            handle.interrupt()
        })
    };

    let rounds = {
        let running = Arc::clone(&stop);
        let unblocked = Arc::clone(&unblocked);
        without_lock_interruptible(
            move || {
                let mut rounds = 0_u64;
                while !running.load(Ordering::SeqCst) {
                    rounds += 1;
                    thread::sleep(Duration::from_millis(1));
                }
                rounds
            },
            move || {
                unblocked.fetch_add(1, Ordering::SeqCst);
                stop.store(true, Ordering::SeqCst);
            },
        )
        .unwrap()
    };

    assert!(watcher.join().unwrap());
    assert!(rounds >= 1);
    assert_eq!(unblocked.load(Ordering::SeqCst), 1);
    assert!(!handle.is_released());
}

#[test]
fn test_early_interrupt_stays_pending() {
    let (sandbox, _attached) = boot();
    let handle = sandbox.interrupt_handle();
    assert!(!handle.interrupt());

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let finished = without_lock_interruptible(
        move || {
            while !flag.load(Ordering::SeqCst) {
                thread::yield_now();
            }
            true
        },
        move || stop.store(true, Ordering::SeqCst),
    )
    .unwrap();
    assert!(finished);
}
