//! Generic change-notification fan-out used by [`crate::Bitmap`] and, via
//! `vmnetfs-core`, by the image's byte/chunk counters.
//!
//! A [`ChangeStream`] is an unbounded channel handed to one subscriber.
//! [`ObserverList`] holds the send side of every live subscriber and is
//! meant to be mutated only while the owner's data lock is held, so that a
//! mutation and its notification happen atomically with respect to new
//! subscribers registering (see [`ObserverList::notify`]).

use std::sync::mpsc;

/// Read side of a change stream. Blocks for the next change; returns `None`
/// once the owner calls [`ObserverList::close`] or is dropped.
pub struct ChangeStream<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> ChangeStream<T> {
    /// Block until the next change arrives, or return `None` if the stream
    /// has been closed.
    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Non-blocking poll: `Some(Some(v))` for a ready value, `Some(None)` if
    /// closed, `None` if nothing is ready yet.
    pub fn try_recv(&self) -> Option<Option<T>> {
        match self.rx.try_recv() {
            Ok(v) => Some(Some(v)),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(None),
        }
    }
}

impl<T> Iterator for ChangeStream<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.recv()
    }
}

/// Holds the send half of every subscriber registered against a piece of
/// mutable state. All methods take `&mut self` and are meant to be called
/// only while the caller already holds the lock guarding that state.
pub struct ObserverList<T> {
    senders: Vec<mpsc::Sender<T>>,
}

impl<T: Clone> ObserverList<T> {
    pub fn new() -> Self {
        Self {
            senders: Vec::new(),
        }
    }

    /// Register a new subscriber and return its read side. Call this while
    /// holding the owner's lock, after writing the subscriber's initial
    /// snapshot, so the snapshot and the first tail notification can never
    /// interleave.
    pub fn register(&mut self) -> ChangeStream<T> {
        let (tx, rx) = mpsc::channel();
        self.senders.push(tx);
        ChangeStream { rx }
    }

    /// Register a new subscriber, letting `seed` push its initial snapshot
    /// directly into the new subscriber's channel before it is added to the
    /// broadcast list. Both the snapshot writes and the list insertion
    /// happen here, under whatever lock the caller already holds, so no
    /// `notify` call from another thread can interleave with the snapshot.
    pub fn register_with_snapshot(&mut self, seed: impl FnOnce(&mpsc::Sender<T>)) -> ChangeStream<T> {
        let (tx, rx) = mpsc::channel();
        seed(&tx);
        self.senders.push(tx);
        ChangeStream { rx }
    }

    /// Broadcast a value to every live subscriber, dropping any whose
    /// receiver has gone away.
    pub fn notify(&mut self, value: T) {
        self.senders.retain(|tx| tx.send(value.clone()).is_ok());
    }

    /// Disconnect every subscriber; their streams will now report EOF.
    pub fn close(&mut self) {
        self.senders.clear();
    }
}

impl<T: Clone> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}
