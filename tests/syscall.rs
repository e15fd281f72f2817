//! Blocking-syscall handoff: while one fiber sleeps inside an
//! enter_syscall/exit_syscall bracket, its processor must migrate so that
//! compute fibers keep running on another thread, and the sleeper must
//! still run to completion afterwards.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use filament::fiber;

const COMPUTE_FIBERS: usize = 8;
const SLEEP: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct Verdict {
    syscall_thread: ThreadId,
    window: (Instant, Instant),
    samples: Vec<(Instant, ThreadId)>,
}

#[test]
fn compute_fibers_run_during_blocking_syscall() {
    let (tx, rx) = mpsc::channel();

    common::boot(2, move || {
        fiber::spawn(move || {
            let sleeping = Arc::new(AtomicBool::new(false));
            let finished = Arc::new(AtomicBool::new(false));
            let samples: Arc<Mutex<Vec<(Instant, ThreadId)>>> =
                Arc::new(Mutex::new(Vec::new()));
            let done = Arc::new(AtomicUsize::new(0));
            let (window_tx, window_rx) = mpsc::channel();

            {
                let sleeping = sleeping.clone();
                let finished = finished.clone();
                fiber::Builder::new()
                    .name("sleeper")
                    .spawn(move || {
                        fiber::enter_syscall();
                        let thread = std::thread::current().id();
                        let begin = Instant::now();
                        sleeping.store(true, Ordering::SeqCst);
                        std::thread::sleep(SLEEP);
                        sleeping.store(false, Ordering::SeqCst);
                        let end = Instant::now();
                        fiber::exit_syscall();
                        // Still alive after the handoff round-trip.
                        finished.store(true, Ordering::SeqCst);
                        window_tx.send((thread, begin, end)).unwrap();
                    })
                    .unwrap();
            }

            for i in 0..COMPUTE_FIBERS {
                let sleeping = sleeping.clone();
                let finished = finished.clone();
                let samples = samples.clone();
                let done = done.clone();
                fiber::Builder::new()
                    .name(format!("compute-{}", i))
                    .spawn(move || {
                        // Spin through the scheduler until the sleeper is
                        // done, sampling the window while it is blocked.
                        while !finished.load(Ordering::SeqCst) {
                            if sleeping.load(Ordering::SeqCst) {
                                let mut samples =
                                    samples.lock().expect("samples mutex poisoned");
                                samples.push((Instant::now(), std::thread::current().id()));
                            }
                            fiber::yield_now();
                        }
                        done.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }

            // Reporter: wait for everything, then ship the verdict.
            fiber::Builder::new()
                .name("reporter")
                .spawn(move || {
                    while done.load(Ordering::SeqCst) < COMPUTE_FIBERS {
                        fiber::yield_now();
                    }
                    let (syscall_thread, begin, end) =
                        window_rx.recv().expect("sleeper vanished");
                    let samples = samples.lock().expect("samples mutex poisoned").clone();
                    tx.send(Verdict {
                        syscall_thread,
                        window: (begin, end),
                        samples,
                    })
                    .unwrap();
                })
                .unwrap();
        })
        .unwrap();
    });

    let verdict = common::recv_within(&rx);
    let (begin, end) = verdict.window;
    let in_window: Vec<(Instant, ThreadId)> = verdict
        .samples
        .iter()
        .copied()
        .filter(|sample| sample.0 >= begin && sample.0 <= end)
        .collect();
    assert!(
        !in_window.is_empty(),
        "no compute fiber ran while the sleeper was blocked: {:?}",
        verdict,
    );
    assert!(
        in_window.iter().all(|sample| sample.1 != verdict.syscall_thread),
        "a compute fiber was sampled on the blocked thread",
    );
}
