//! Two cooperative fibers sharing a single processor must interleave
//! strictly, starting with the first-spawned fiber.

mod common;

use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use filament::fiber;

#[test]
fn two_fibers_interleave_on_one_processor() {
    let (tx, rx) = mpsc::channel();
    let log = Arc::new(Mutex::new(Vec::new()));

    common::boot(1, {
        let log = log.clone();
        move || {
            for id in 0u32..2 {
                let log = log.clone();
                let tx = tx.clone();
                fiber::Builder::new()
                    .name(format!("writer-{}", id))
                    .spawn(move || {
                        for _ in 0..5 {
                            log.lock().expect("log mutex poisoned").push(id);
                            fiber::yield_now();
                        }
                        // The second-spawned fiber appends last in the
                        // expected schedule, so its exit means the log is
                        // complete.
                        if id == 1 {
                            let snapshot = log.lock().expect("log mutex poisoned").clone();
                            tx.send(snapshot).unwrap();
                        }
                    })
                    .unwrap();
            }
        }
    });

    let buf = common::recv_within(&rx);
    assert_eq!(buf, vec![0, 1, 0, 1, 0, 1, 0, 1, 0, 1]);
}
