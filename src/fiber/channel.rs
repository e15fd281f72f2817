//! Inter-fiber channels.
//!
//! A [`Channel`] passes owned values between fibers. Capacity 0 makes it a
//! *rendezvous* channel: a send completes only when a receiver takes the
//! value, and vice versa: neither party proceeds until the other arrives.
//! Capacity N makes it a bounded FIFO: sends complete immediately while the
//! buffer has room and park otherwise.
//!
//! A closed channel rejects new sends but can still be drained of buffered
//! values; closure is a normal completion reported through the return
//! value, never a crate error. The [`channel`] constructor splits a channel
//! into a [`Sender`]/[`Receiver`] pair that closes it automatically when
//! either side is fully dropped.
//!
//! Internally every channel is an untyped core: values travel as boxed
//! pointers and the core keeps a monomorphized destructor for the ones it
//! still owns when destroyed. The typed [`Channel`] wrapper is a thin,
//! clonable handle over it.
//!
//! Blocking operations park the calling fiber through the scheduler's
//! park-callback machinery: the wait-list insertion and the mutex release
//! happen on the dispatcher's native stack, after the fiber's context is
//! fully saved.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::os::raw::c_void;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::fiber::{Fiber, FiberStatus};
use crate::sched::{self, ParkRequest};
use crate::sched::queue::FiberList;

type StdResult<T, E> = std::result::Result<T, E>;

const WOULD_BLOCK_MSG: &str =
    "blocking channel operation outside of a fiber would park forever";

////////////////////////////////////////////////////////////////////////////////
// RawChannel
////////////////////////////////////////////////////////////////////////////////

struct ChanState {
    capacity: usize,
    /// Bounded FIFO of boxed values; empty and unused for capacity 0.
    buf: VecDeque<*mut c_void>,
    closed: bool,
    /// Parked senders, each carrying its value in the fiber's `xfer` slot.
    senders: FiberList,
    /// Parked receivers, each waiting for `xfer` to be filled.
    receivers: FiberList,
}

struct RawChannel {
    state: Mutex<ChanState>,
    /// Destructor for values still buffered when the channel is destroyed.
    drop_value: unsafe fn(*mut c_void),
    tx_count: AtomicUsize,
    rx_count: AtomicUsize,
}

// The state behind the mutex holds raw pointers to boxed `T: Send` values
// (enforced at construction) and to fibers whose list membership the same
// mutex guards.
unsafe impl Send for RawChannel {}
unsafe impl Sync for RawChannel {}

unsafe fn drop_boxed<T>(value: *mut c_void) {
    drop(Box::from_raw(value as *mut T));
}

impl RawChannel {
    fn lock(&self) -> MutexGuard<'_, ChanState> {
        self.state.lock().expect("channel mutex was poisoned")
    }
}

impl Drop for RawChannel {
    fn drop(&mut self) {
        let state = self.state.get_mut().expect("channel mutex was poisoned");
        // A parked fiber keeps its channel handle borrowed for the whole
        // operation, so by the time the last handle is gone the wait lists
        // are necessarily empty.
        debug_assert!(state.senders.is_empty(), "channel dropped with parked senders");
        debug_assert!(state.receivers.is_empty(), "channel dropped with parked receivers");
        while let Some(value) = state.buf.pop_front() {
            unsafe { (self.drop_value)(value) };
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Park integration
////////////////////////////////////////////////////////////////////////////////

enum WaitSide {
    Senders,
    Receivers,
}

/// Travels from the parking fiber's stack into the park callback. The
/// fiber's frame stays alive until it is resumed, and the callback is done
/// with this struct before the wakeup can possibly happen.
struct ChanPark<'a> {
    guard: Option<MutexGuard<'a, ChanState>>,
    side: WaitSide,
}

/// Runs on the dispatcher stack: link the parked fiber into the wait list,
/// publish the waiting state and only then drop the channel mutex. The
/// unlock happens on the same OS thread that acquired the guard.
unsafe fn park_chan(fiber: NonNull<Fiber>, arg: *mut c_void) -> bool {
    let park = &mut *(arg as *mut ChanPark<'static>);
    let mut guard = park.guard.take().expect("channel park callback entered twice");
    // A fiber waits on a socket or a channel, never both: a stray one-shot
    // socket event would race this channel wait for the wakeup transition.
    sched::clear_io_wait(fiber.as_ref());
    match park.side {
        WaitSide::Senders => guard.senders.push_back(fiber),
        WaitSide::Receivers => guard.receivers.push_back(fiber),
    }
    fiber.as_ref().set_status(FiberStatus::Waiting);
    drop(guard);
    true
}

/// Park the current fiber on one of the channel's wait lists, consuming the
/// lock guard. Returns once the fiber has been matched or the channel
/// closed; the verdict is in the fiber's `xfer_ok`.
fn park_on(guard: MutexGuard<'_, ChanState>, side: WaitSide) -> NonNull<Fiber> {
    let worker = sched::current_worker().expect(WOULD_BLOCK_MSG);
    let fiber = worker.current_fiber().expect(WOULD_BLOCK_MSG);
    let mut park = ChanPark {
        guard: Some(guard),
        side,
    };
    worker.yield_with(ParkRequest {
        callback: park_chan,
        arg: &mut park as *mut ChanPark<'_> as *mut c_void,
        fiber,
    });
    fiber
}

/// Detach a parked sender's value under the lock and mark it matched. The
/// wakeup itself is performed after the lock is dropped.
unsafe fn take_sender_value(sender: NonNull<Fiber>) -> *mut c_void {
    let f = sender.as_ref();
    let value = f.xfer.get();
    f.xfer.set(null_mut());
    f.xfer_ok.set(true);
    value
}

////////////////////////////////////////////////////////////////////////////////
// Channel
////////////////////////////////////////////////////////////////////////////////

/// A clonable handle to a rendezvous (capacity 0) or bounded (capacity N)
/// channel.
///
/// # Examples
///
/// ```no_run
/// use filament::fiber::{self, channel::Channel};
///
/// let chan = Channel::new(0);
/// let tx = chan.clone();
/// fiber::spawn(move || {
///     tx.send(1).unwrap();
/// }).unwrap();
/// fiber::spawn(move || {
///     assert_eq!(chan.recv(), Some(1));
/// }).unwrap();
/// ```
pub struct Channel<T> {
    raw: Arc<RawChannel>,
    marker: PhantomData<T>,
}

// Values are boxed `T: Send` (enforced by the constructors); all other
// state is behind the channel mutex.
unsafe impl<T: Send> Send for Channel<T> {}
unsafe impl<T: Send> Sync for Channel<T> {}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            marker: PhantomData,
        }
    }
}

impl<T: Send> Channel<T> {
    /// Create a channel. `capacity` 0 means rendezvous.
    pub fn new(capacity: usize) -> Self {
        Self {
            raw: Arc::new(RawChannel {
                state: Mutex::new(ChanState {
                    capacity,
                    buf: VecDeque::with_capacity(capacity),
                    closed: false,
                    senders: FiberList::new(),
                    receivers: FiberList::new(),
                }),
                drop_value: drop_boxed::<T>,
                tx_count: AtomicUsize::new(0),
                rx_count: AtomicUsize::new(0),
            }),
            marker: PhantomData,
        }
    }

    /// Send a value, parking the current fiber while the channel is full
    /// (or, on a rendezvous channel, until a receiver arrives).
    ///
    /// On a closed channel the value is handed back as `Err`, so the caller
    /// can reuse it.
    ///
    /// # Panics
    ///
    /// Panics when it would park outside of a fiber. Use
    /// [`try_send`](Self::try_send) from non-fiber contexts.
    pub fn send(&self, value: T) -> StdResult<(), T> {
        let mut state = self.raw.lock();
        if state.closed {
            return Err(value);
        }

        // A parked receiver means the buffer is empty: hand over directly.
        if let Some(rx) = state.receivers.pop_front() {
            unsafe {
                let f = rx.as_ref();
                f.xfer.set(Box::into_raw(Box::new(value)) as *mut c_void);
                f.xfer_ok.set(true);
            }
            drop(state);
            sched::ready_from_channel(rx);
            return Ok(());
        }

        if state.capacity > 0 && state.buf.len() < state.capacity {
            state.buf.push_back(Box::into_raw(Box::new(value)) as *mut c_void);
            return Ok(());
        }

        // Park, carrying the value in the fiber's transfer slot.
        let worker = sched::current_worker().expect(WOULD_BLOCK_MSG);
        let fiber = worker.current_fiber().expect(WOULD_BLOCK_MSG);
        unsafe {
            let f = fiber.as_ref();
            f.xfer.set(Box::into_raw(Box::new(value)) as *mut c_void);
            f.xfer_ok.set(false);
        }
        let fiber = park_on(state, WaitSide::Senders);

        let f = unsafe { fiber.as_ref() };
        if f.xfer_ok.get() {
            Ok(())
        } else {
            // Woken by close: the value is still ours to reclaim.
            let value = f.xfer.get();
            f.xfer.set(null_mut());
            Err(unsafe { *Box::from_raw(value as *mut T) })
        }
    }

    /// Receive a value, parking the current fiber while the channel is
    /// empty. Returns `None` once the channel is closed *and* drained.
    ///
    /// # Panics
    ///
    /// Panics when it would park outside of a fiber. Use
    /// [`try_recv`](Self::try_recv) from non-fiber contexts.
    pub fn recv(&self) -> Option<T> {
        let mut state = self.raw.lock();

        if let Some(value) = state.buf.pop_front() {
            // The freed slot immediately absorbs the longest-parked sender,
            // keeping FIFO order and not leaving it parked with room free.
            if let Some(tx) = state.senders.pop_front() {
                let refill = unsafe { take_sender_value(tx) };
                state.buf.push_back(refill);
                drop(state);
                sched::ready_from_channel(tx);
            } else {
                drop(state);
            }
            return Some(unsafe { *Box::from_raw(value as *mut T) });
        }

        // Empty buffer with a parked sender: rendezvous.
        if let Some(tx) = state.senders.pop_front() {
            let value = unsafe { take_sender_value(tx) };
            drop(state);
            sched::ready_from_channel(tx);
            return Some(unsafe { *Box::from_raw(value as *mut T) });
        }

        if state.closed {
            return None;
        }

        let fiber = park_on(state, WaitSide::Receivers);

        let f = unsafe { fiber.as_ref() };
        if f.xfer_ok.get() {
            let value = f.xfer.get();
            f.xfer.set(null_mut());
            Some(unsafe { *Box::from_raw(value as *mut T) })
        } else {
            None
        }
    }

    /// Non-blocking send; usable from any thread.
    pub fn try_send(&self, value: T) -> StdResult<(), TrySendError<T>> {
        let mut state = self.raw.lock();
        if state.closed {
            return Err(TrySendError::Disconnected(value));
        }
        if let Some(rx) = state.receivers.pop_front() {
            unsafe {
                let f = rx.as_ref();
                f.xfer.set(Box::into_raw(Box::new(value)) as *mut c_void);
                f.xfer_ok.set(true);
            }
            drop(state);
            sched::ready_from_channel(rx);
            return Ok(());
        }
        if state.capacity > 0 && state.buf.len() < state.capacity {
            state.buf.push_back(Box::into_raw(Box::new(value)) as *mut c_void);
            return Ok(());
        }
        Err(TrySendError::Full(value))
    }

    /// Non-blocking receive; usable from any thread.
    pub fn try_recv(&self) -> StdResult<T, TryRecvError> {
        let mut state = self.raw.lock();
        if let Some(value) = state.buf.pop_front() {
            if let Some(tx) = state.senders.pop_front() {
                let refill = unsafe { take_sender_value(tx) };
                state.buf.push_back(refill);
                drop(state);
                sched::ready_from_channel(tx);
            } else {
                drop(state);
            }
            return Ok(unsafe { *Box::from_raw(value as *mut T) });
        }
        if let Some(tx) = state.senders.pop_front() {
            let value = unsafe { take_sender_value(tx) };
            drop(state);
            sched::ready_from_channel(tx);
            return Ok(unsafe { *Box::from_raw(value as *mut T) });
        }
        if state.closed {
            return Err(TryRecvError::Disconnected);
        }
        Err(TryRecvError::Empty)
    }

    /// Close the channel: every parked sender fails (keeping its value),
    /// every parked receiver observes `None`. Already-buffered values stay
    /// drainable. Closing twice is a no-op.
    pub fn close(&self) {
        let mut state = self.raw.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let mut woken = Vec::with_capacity(state.senders.len() + state.receivers.len());
        while let Some(tx) = state.senders.pop_front() {
            unsafe { tx.as_ref().xfer_ok.set(false) };
            woken.push(tx);
        }
        while let Some(rx) = state.receivers.pop_front() {
            unsafe { rx.as_ref().xfer_ok.set(false) };
            woken.push(rx);
        }
        drop(state);
        for fiber in woken {
            sched::ready_from_channel(fiber);
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.raw.lock().closed
    }

    /// Number of buffered values (always 0 for a rendezvous channel).
    pub fn len(&self) -> usize {
        self.raw.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.raw.lock().capacity
    }
}

////////////////////////////////////////////////////////////////////////////////
// Sender
////////////////////////////////////////////////////////////////////////////////

/// The sending half of [`channel`]. Can be cloned; the channel closes when
/// the last `Sender` is dropped.
pub struct Sender<T: Send> {
    chan: Channel<T>,
}

impl<T: Send> Sender<T> {
    fn new(chan: Channel<T>) -> Self {
        chan.raw.tx_count.fetch_add(1, Ordering::Relaxed);
        Self { chan }
    }

    /// See [`Channel::send`].
    pub fn send(&self, value: T) -> StdResult<(), T> {
        self.chan.send(value)
    }

    /// See [`Channel::try_send`].
    pub fn try_send(&self, value: T) -> StdResult<(), TrySendError<T>> {
        self.chan.try_send(value)
    }
}

impl<T: Send> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self::new(self.chan.clone())
    }
}

impl<T: Send> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.chan.raw.tx_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.chan.close();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Receiver
////////////////////////////////////////////////////////////////////////////////

/// The receiving half of [`channel`]. Can be cloned; the channel closes
/// when the last `Receiver` is dropped.
pub struct Receiver<T: Send> {
    chan: Channel<T>,
}

impl<T: Send> Receiver<T> {
    fn new(chan: Channel<T>) -> Self {
        chan.raw.rx_count.fetch_add(1, Ordering::Relaxed);
        Self { chan }
    }

    /// See [`Channel::recv`].
    pub fn recv(&self) -> Option<T> {
        self.chan.recv()
    }

    /// See [`Channel::try_recv`].
    pub fn try_recv(&self) -> StdResult<T, TryRecvError> {
        self.chan.try_recv()
    }

    /// A blocking iterator over received values; ends when the channel is
    /// closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { rx: self }
    }

    /// A non-blocking iterator; ends at the first moment the channel has
    /// nothing ready.
    pub fn try_iter(&self) -> TryIter<'_, T> {
        TryIter { rx: self }
    }
}

impl<T: Send> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self::new(self.chan.clone())
    }
}

impl<T: Send> Drop for Receiver<T> {
    fn drop(&mut self) {
        if self.chan.raw.rx_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.chan.close();
        }
    }
}

pub struct Iter<'a, T: Send + 'a> {
    rx: &'a Receiver<T>,
}

impl<'a, T: Send> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.recv()
    }
}

impl<'a, T: Send> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

pub struct TryIter<'a, T: Send + 'a> {
    rx: &'a Receiver<T>,
}

impl<'a, T: Send> Iterator for TryIter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Creates a channel and returns the sender/receiver halves.
pub fn channel<T: Send>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let chan = Channel::new(capacity);
    (Sender::new(chan.clone()), Receiver::new(chan))
}

////////////////////////////////////////////////////////////////////////////////
// Errors
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TrySendError<T> {
    Full(T),
    Disconnected(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(v) | Self::Disconnected(v) => v,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn buffered_bounds() {
        let chan = Channel::new(4);
        for i in 0..4 {
            chan.try_send(i).unwrap();
        }
        assert_eq!(chan.try_send(4), Err(TrySendError::Full(4)));
        assert_eq!(chan.len(), 4);
    }

    #[test]
    fn closed_channel_drains_exactly_k_values() {
        let chan = Channel::new(4);
        for i in 100..104 {
            chan.try_send(i).unwrap();
        }
        chan.close();
        assert_eq!(chan.try_send(104), Err(TrySendError::Disconnected(104)));
        for i in 100..104 {
            assert_eq!(chan.try_recv(), Ok(i));
        }
        assert_eq!(chan.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn rendezvous_never_buffers() {
        let chan = Channel::new(0);
        assert_eq!(chan.capacity(), 0);
        assert_eq!(chan.try_send(1), Err(TrySendError::Full(1)));
        assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn sender_drop_closes() {
        let (tx, rx) = channel::<i32>(2);
        let tx2 = tx.clone();
        tx.try_send(7).unwrap();
        drop(tx);
        assert!(!tx2.chan.is_closed());
        drop(tx2);
        assert_eq!(rx.try_recv(), Ok(7));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn destroy_drops_buffered_values() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Probe;
        impl Drop for Probe {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let chan = Channel::new(3);
        assert!(chan.try_send(Probe).is_ok());
        assert!(chan.try_send(Probe).is_ok());
        drop(chan);
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn try_iter_stops_at_empty() {
        let (tx, rx) = channel(8);
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        let got: Vec<i32> = rx.try_iter().collect();
        assert_eq!(got, vec![1, 2]);
    }
}
