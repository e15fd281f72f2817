//! Channel scenarios: rendezvous pairing and bounded buffering with close.
//! Both run inside one scheduler instance, since the scheduler is a
//! process-wide singleton with no shutdown; the file holds a single test.

mod common;

use std::sync::mpsc;

use filament::fiber;
use filament::fiber::channel::Channel;

#[test]
fn rendezvous_and_buffered_channels() {
    let (verdict_tx, verdict_rx) = mpsc::channel();

    common::boot(2, move || {
        fiber::spawn(move || {
            rendezvous_scenario(&verdict_tx);
            buffered_scenario(&verdict_tx);
        })
        .unwrap();
    });

    let (sent_ok, received) = common::recv_within(&verdict_rx);
    assert!(sent_ok, "rendezvous: some send reported a closed channel");
    assert_eq!(received, (1..=10).collect::<Vec<i32>>());

    let (sent_ok, received) = common::recv_within(&verdict_rx);
    assert!(sent_ok, "buffered: some send reported a closed channel");
    assert_eq!(received, (100..=109).collect::<Vec<i32>>());
}

/// Producer sends 1..=10 over a capacity-0 channel; the consumer observes
/// exactly that sequence, and every send (the tenth included) succeeds.
fn rendezvous_scenario(verdict: &mpsc::Sender<(bool, Vec<i32>)>) {
    let chan = Channel::new(0);
    let tx_side = chan.clone();
    let (prod_tx, prod_rx) = mpsc::channel();

    fiber::Builder::new()
        .name("rendezvous-producer")
        .spawn(move || {
            let mut all_ok = true;
            for i in 1..=10 {
                all_ok &= tx_side.send(i).is_ok();
            }
            prod_tx.send(all_ok).unwrap();
        })
        .unwrap();

    let mut received = Vec::new();
    for _ in 0..10 {
        received.push(chan.recv().expect("rendezvous channel closed early"));
    }
    let all_ok = prod_rx.recv().expect("producer vanished");
    verdict.send((all_ok, received)).unwrap();
}

/// Producer fills a capacity-4 channel with 100..=109 and closes it; the
/// consumer drains exactly those values and then observes the close.
fn buffered_scenario(verdict: &mpsc::Sender<(bool, Vec<i32>)>) {
    let chan = Channel::new(4);
    let tx_side = chan.clone();
    let (prod_tx, prod_rx) = mpsc::channel();

    fiber::Builder::new()
        .name("buffered-producer")
        .spawn(move || {
            let mut all_ok = true;
            for i in 100..=109 {
                all_ok &= tx_side.send(i).is_ok();
            }
            tx_side.close();
            prod_tx.send(all_ok).unwrap();
        })
        .unwrap();

    let mut received = Vec::new();
    while let Some(v) = chan.recv() {
        received.push(v);
    }
    let all_ok = prod_rx.recv().expect("producer vanished");
    verdict.send((all_ok, received)).unwrap();
}
