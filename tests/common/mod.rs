#![allow(dead_code)]

use std::sync::mpsc::Receiver;
use std::time::Duration;

pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(30);

/// Boot the scheduler on a dedicated thread: init, run `setup` on the
/// initial thread (this is where the scenario's first fibers are spawned),
/// then convert the thread into a scheduler worker. The scheduler has no
/// shutdown, so each test binary boots exactly once and the workers die
/// with the process.
pub fn boot<F>(procs: usize, setup: F)
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name("sched-main".into())
        .spawn(move || {
            filament::sched::init(procs).expect("scheduler init failed");
            setup();
            filament::sched::start();
        })
        .expect("failed to spawn the scheduler thread");
}

pub fn recv_within<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(SCENARIO_TIMEOUT).expect("scenario timed out")
}
