//! Socket wakeup through the one-shot edge-triggered poller, driven by an
//! external net_poll helper thread, plus the net_poll timeout boundaries.

mod common;

use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use filament::fiber;
use filament::poller::Events;
use filament::sched;

#[test]
fn listener_wakes_on_connect() {
    let (port_tx, port_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    common::boot(1, move || {
        fiber::Builder::new()
            .name("acceptor")
            .spawn(move || {
                let listener = TcpListener::bind("127.0.0.1:0").unwrap();
                listener.set_nonblocking(true).unwrap();
                let port = listener.local_addr().unwrap().port();
                port_tx.send(port).unwrap();

                let events = fiber::wait_io(listener.as_raw_fd(), Events::READ)
                    .expect("poller registration failed");
                let accepted = listener.accept().is_ok();
                done_tx.send((events, accepted)).unwrap();
            })
            .unwrap();
    });

    let port = common::recv_within(&port_rx);

    // With a single processor the only scheduler thread parks once the
    // acceptor is waiting; the helper thread below is then the sole source
    // of wakeups, exactly the situation net_poll exists for.
    std::thread::spawn(|| loop {
        let _ = sched::net_poll(100);
    });

    // net_poll with a zero timeout never blocks, events or not.
    let started = Instant::now();
    let woken = sched::net_poll(0).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(woken, 0);

    let _client = TcpStream::connect(("127.0.0.1", port)).expect("connect failed");

    let (events, accepted) = common::recv_within(&done_rx);
    assert!(
        events.contains(Events::READ),
        "woken with mask {:?}, READ missing",
        events,
    );
    assert!(accepted, "listener was woken but accept failed");
}
