//! Thread-safe, dense bitmap indexed by chunk number, with a
//! snapshot-then-tail subscription model for watching which chunks change.
//!
//! The bitmap starts empty and grows lazily: [`Bitmap::set`] doubles the
//! backing storage whenever a bit lands past the current allocation, the
//! same growth the chunk-present and chunk-accessed maps rely on in the
//! engine above this crate.

mod stream;

pub use stream::{ChangeStream, ObserverList};

use std::sync::Mutex;

/// A subscription to a [`Bitmap`]'s changes: first yields every bit that
/// was already set at subscribe time, then every bit set afterward.
/// Disconnects (stops yielding) once the bitmap is closed.
pub type BitmapStream = ChangeStream<u64>;

struct Inner {
    bits: Vec<u8>,
    observers: ObserverList<u64>,
}

impl Inner {
    fn byte_len_for(bit: u64) -> usize {
        let needed = (bit / 8 + 1) as usize;
        needed.next_power_of_two()
    }

    fn ensure_capacity(&mut self, bit: u64) {
        let needed = Self::byte_len_for(bit);
        if needed > self.bits.len() {
            self.bits.resize(needed, 0);
            tracing::trace!(new_len = needed, "bitmap resized");
        }
    }
}

/// Dense chunk-index bitmap. Cheap to clone via `Arc` at the call site;
/// the type itself is `Sync` and meant to be shared behind one.
pub struct Bitmap {
    inner: Mutex<Inner>,
}

impl Bitmap {
    /// An empty bitmap with no storage allocated yet.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                bits: Vec::new(),
                observers: ObserverList::new(),
            }),
        }
    }

    /// Set `bit`, growing backing storage if needed. Returns `true` if the
    /// bit was not already set. Notifies every live subscriber of the
    /// index while still holding the lock, so a concurrent `subscribe()`
    /// can never miss or duplicate this change.
    pub fn set(&self, bit: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_capacity(bit);
        let byte = (bit / 8) as usize;
        let mask = 1u8 << (bit % 8);
        let was_set = inner.bits[byte] & mask != 0;
        inner.bits[byte] |= mask;
        if !was_set {
            inner.observers.notify(bit);
        }
        !was_set
    }

    /// Test whether `bit` is set. Bits past the current allocation read as
    /// unset.
    pub fn test(&self, bit: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        let byte = (bit / 8) as usize;
        match inner.bits.get(byte) {
            Some(b) => b & (1u8 << (bit % 8)) != 0,
            None => false,
        }
    }

    /// Count of bits currently set.
    pub fn count_set(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.bits.iter().map(|b| b.count_ones() as u64).sum()
    }

    /// Subscribe to this bitmap's changes. The returned stream first yields
    /// every bit already set, in ascending order, then every bit set after
    /// this call, in the order `set` was called.
    pub fn subscribe(&self) -> BitmapStream {
        let mut inner = self.inner.lock().unwrap();
        let bits = &inner.bits;
        let set_bits: Vec<u64> = bits
            .iter()
            .enumerate()
            .flat_map(|(byte_idx, &byte)| {
                (0..8u64).filter_map(move |bit_in_byte| {
                    (byte & (1u8 << bit_in_byte) != 0).then(|| byte_idx as u64 * 8 + bit_in_byte)
                })
            })
            .collect();
        inner.observers.register_with_snapshot(|tx| {
            for bit in set_bits {
                // Unbounded channel with a receiver that hasn't been
                // dropped yet (we hold it), so this cannot fail.
                let _ = tx.send(bit);
            }
        })
    }

    /// Disconnect every current subscriber. Future `subscribe()` calls
    /// still work against a closed bitmap (they'll just see no further
    /// updates after their initial snapshot, since nothing sets bits on a
    /// closed image anymore in practice).
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.observers.close();
    }
}

impl Default for Bitmap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_bits_read_false() {
        let b = Bitmap::new();
        assert!(!b.test(0));
        assert!(!b.test(4095));
    }

    #[test]
    fn set_then_test() {
        let b = Bitmap::new();
        assert!(b.set(3));
        assert!(b.test(3));
        assert!(!b.test(2));
        assert!(!b.test(4));
    }

    #[test]
    fn set_is_idempotent() {
        let b = Bitmap::new();
        assert!(b.set(10));
        assert!(!b.set(10));
        assert_eq!(b.count_set(), 1);
    }

    #[test]
    fn set_grows_storage_across_byte_boundaries() {
        let b = Bitmap::new();
        b.set(0);
        b.set(100_000);
        assert!(b.test(0));
        assert!(b.test(100_000));
        assert!(!b.test(50_000));
    }

    #[test]
    fn subscribe_snapshots_existing_bits_in_order() {
        let b = Bitmap::new();
        b.set(2);
        b.set(5);
        let stream = b.subscribe();
        assert_eq!(stream.recv(), Some(2));
        assert_eq!(stream.recv(), Some(5));
    }

    #[test]
    fn subscribe_then_tail_sees_new_sets() {
        let b = Bitmap::new();
        b.set(1);
        let stream = b.subscribe();
        assert_eq!(stream.recv(), Some(1));
        b.set(9);
        assert_eq!(stream.recv(), Some(9));
    }

    #[test]
    fn subscribe_does_not_replay_redundant_set() {
        let b = Bitmap::new();
        b.set(1);
        let stream = b.subscribe();
        assert_eq!(stream.recv(), Some(1));
        assert!(!b.set(1));
        assert_eq!(stream.try_recv(), None);
    }

    #[test]
    fn close_disconnects_subscribers() {
        let b = Bitmap::new();
        let stream = b.subscribe();
        b.close();
        assert_eq!(stream.recv(), None);
    }

    #[test]
    fn two_subscribers_each_see_full_history() {
        let b = Bitmap::new();
        b.set(1);
        let s1 = b.subscribe();
        b.set(2);
        let s2 = b.subscribe();
        b.set(3);

        assert_eq!(s1.recv(), Some(1));
        assert_eq!(s1.recv(), Some(2));
        assert_eq!(s1.recv(), Some(3));

        assert_eq!(s2.recv(), Some(2));
        assert_eq!(s2.recv(), Some(3));
    }
}
