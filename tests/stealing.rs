//! Fibers spawned from one fiber must spread across processors: with two
//! processors at least one fiber has to be observed running on a thread
//! other than the spawner's.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use filament::fiber;

const FIBERS: usize = 16;
const MIN_YIELDS: usize = 3;
const YIELD_BUDGET: usize = 100_000;

#[test]
fn work_spreads_across_processors() {
    let (tx, rx) = mpsc::channel();

    common::boot(2, move || {
        fiber::spawn(move || {
            let seen: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
            let done = Arc::new(AtomicUsize::new(0));

            for i in 0..FIBERS {
                let seen = seen.clone();
                let done = done.clone();
                let tx = tx.clone();
                fiber::Builder::new()
                    .name(format!("noop-{}", i))
                    .spawn(move || {
                        // Keep cycling through the run queues until the
                        // fleet has been seen on two distinct threads (or a
                        // generous budget runs out), so a slow-starting
                        // second worker cannot be missed.
                        let mut yields = 0;
                        loop {
                            {
                                let mut seen = seen.lock().expect("seen mutex poisoned");
                                let me = std::thread::current().id();
                                if !seen.contains(&me) {
                                    seen.push(me);
                                }
                                if yields >= MIN_YIELDS && seen.len() >= 2 {
                                    break;
                                }
                            }
                            if yields >= YIELD_BUDGET {
                                break;
                            }
                            yields += 1;
                            fiber::yield_now();
                        }
                        if done.fetch_add(1, Ordering::SeqCst) + 1 == FIBERS {
                            let snapshot = seen.lock().expect("seen mutex poisoned").clone();
                            tx.send(snapshot).unwrap();
                        }
                    })
                    .unwrap();
            }
        })
        .unwrap();
    });

    let seen = common::recv_within(&rx);
    let distinct: HashSet<ThreadId> = seen.into_iter().collect();
    assert!(
        distinct.len() >= 2,
        "all {} fibers ran on a single thread; work stealing never happened",
        FIBERS,
    );

    // Completed fibers must land in the dead pool and be recycled.
    let deadline = Instant::now() + common::SCENARIO_TIMEOUT;
    loop {
        let stats = filament::sched::stats().unwrap();
        if stats.recycled_fibers >= (FIBERS + 1) as u64 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "completed fibers were not recycled: {:?}",
            stats,
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}
