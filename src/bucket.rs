//! Buckets and the compare-and-set primitive.
//!
//! A bucket is a single slot of the table. Its contents (occupancy, key and value) live behind a
//! reader/writer lock, so any number of threads can snapshot it while writers are serialized.
//! Shared locks are taken recursively: a thread already holding a bucket's shared lock can read it
//! again even if a writer is queued on it.
//!
//! Every mutation of a bucket (except for key initialization, which must hold the lock during the
//! initializer) goes through `Bucket::compare_and_set`.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The occupancy state of a bucket.
///
/// The lifecycle is `Empty → Element → Deleted → Element → …`. A tombstone only returns to
/// `Element` when the same key is inserted again, and nothing but a resize brings a bucket back
/// to `Empty`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Occupancy {
    /// Never written.
    Empty,
    /// A live key-value pair.
    Element,
    /// A tombstone. The key is kept so the slot can be reused by the same key.
    Deleted,
}

/// The contents of a bucket.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Slot<K, V> {
    /// The occupancy state.
    pub occupancy: Occupancy,
    /// The key. Meaningless while `Empty`.
    pub key: K,
    /// The value. Only meaningful while `Element`.
    pub value: V,
}

impl<K: Default, V: Default> Default for Slot<K, V> {
    fn default() -> Slot<K, V> {
        Slot {
            occupancy: Occupancy::Empty,
            key: K::default(),
            value: V::default(),
        }
    }
}

/// The new contents requested from a compare-and-set.
///
/// The occupancy is always written. The key and value are only written if given.
#[derive(Clone, Copy, Debug)]
pub struct Desired<K, V> {
    /// The new occupancy.
    pub occupancy: Occupancy,
    /// The new key, if it is to be written.
    pub key: Option<K>,
    /// The new value, if it is to be written.
    pub value: Option<V>,
}

impl<K, V> Desired<K, V> {
    /// A live entry with the given key and value.
    pub fn element(key: K, value: V) -> Desired<K, V> {
        Desired {
            occupancy: Occupancy::Element,
            key: Some(key),
            value: Some(value),
        }
    }

    /// A live entry whose value is replaced, keeping the key as it is.
    pub fn value(value: V) -> Desired<K, V> {
        Desired {
            occupancy: Occupancy::Element,
            key: None,
            value: Some(value),
        }
    }

    /// A tombstone, keeping key and value as they are.
    pub fn deleted() -> Desired<K, V> {
        Desired {
            occupancy: Occupancy::Deleted,
            key: None,
            value: None,
        }
    }
}

/// The expected contents of a compare-and-set.
///
/// Every field is optional: `None` means "don't care". After the compare-and-set, every field that
/// was `Some` holds the bucket's actual contents after the operation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Expected<K, V> {
    /// The expected occupancy.
    pub occupancy: Option<Occupancy>,
    /// The expected key.
    pub key: Option<K>,
    /// The expected value.
    pub value: Option<V>,
}

impl<K, V> Expected<K, V> {
    /// Expect nothing.
    pub fn any() -> Expected<K, V> {
        Expected {
            occupancy: None,
            key: None,
            value: None,
        }
    }

    /// Expect some occupancy.
    pub fn occupancy(mut self, occupancy: Occupancy) -> Expected<K, V> {
        self.occupancy = Some(occupancy);
        self
    }

    /// Expect some key.
    pub fn key(mut self, key: K) -> Expected<K, V> {
        self.key = Some(key);
        self
    }

    /// Expect some value.
    pub fn value(mut self, value: V) -> Expected<K, V> {
        self.value = Some(value);
        self
    }
}

impl<K: PartialEq + Copy, V: PartialEq + Copy> Expected<K, V> {
    /// Does every provided expectation match `slot`?
    fn matches(&self, slot: &Slot<K, V>) -> bool {
        self.occupancy.map_or(true, |x| x == slot.occupancy)
            && self.key.map_or(true, |x| x == slot.key)
            && self.value.map_or(true, |x| x == slot.value)
    }

    /// Overwrite every provided expectation with the actual contents of `slot`.
    fn refresh(&mut self, slot: &Slot<K, V>) {
        if self.occupancy.is_some() {
            self.occupancy = Some(slot.occupancy);
        }
        if self.key.is_some() {
            self.key = Some(slot.key);
        }
        if self.value.is_some() {
            self.value = Some(slot.value);
        }
    }
}

/// A bucket of the table.
pub struct Bucket<K, V> {
    /// The contents, behind the bucket-local lock.
    lock: RwLock<Slot<K, V>>,
}

impl<K: Default, V: Default> Default for Bucket<K, V> {
    fn default() -> Bucket<K, V> {
        Bucket {
            lock: RwLock::new(Slot::default()),
        }
    }
}

impl<K, V> Bucket<K, V> {
    /// Take the shared lock.
    ///
    /// The lock is taken recursively, so this doesn't wait for queued writers.
    pub fn read(&self) -> RwLockReadGuard<Slot<K, V>> {
        self.lock.read_recursive()
    }

    /// Take the exclusive lock.
    pub fn write(&self) -> RwLockWriteGuard<Slot<K, V>> {
        self.lock.write()
    }

    /// Access the contents without locking.
    pub fn get_mut(&mut self) -> &mut Slot<K, V> {
        self.lock.get_mut()
    }
}

impl<K: PartialEq + Copy, V: PartialEq + Copy> Bucket<K, V> {
    /// Snapshot the contents under the shared lock.
    pub fn load(&self) -> Slot<K, V> {
        *self.read()
    }

    /// Compare-and-set the bucket.
    ///
    /// This takes the exclusive lock and compares every expectation given in `expected` with the
    /// current contents. If all of them match, `desired` is written and the previous contents are
    /// returned as `Ok`. Otherwise nothing is written and the current contents are returned as
    /// `Err`.
    ///
    /// Either way, the provided fields of `expected` are updated to the actual contents after the
    /// operation, so the caller can retry right away.
    pub fn compare_and_set(
        &self,
        desired: Desired<K, V>,
        expected: &mut Expected<K, V>,
    ) -> Result<Slot<K, V>, Slot<K, V>> {
        self.compare_and_set_with(desired, expected, || ())
    }

    /// Compare-and-set the bucket, running `on_write` after a successful write.
    ///
    /// `on_write` runs while the exclusive lock is still held, so no other operation on this
    /// bucket can observe the write before it.
    pub fn compare_and_set_with<F>(
        &self,
        desired: Desired<K, V>,
        expected: &mut Expected<K, V>,
        on_write: F,
    ) -> Result<Slot<K, V>, Slot<K, V>>
        where F: FnOnce() {
        let mut slot = self.lock.write();

        let ret = if expected.matches(&slot) {
            let previous = *slot;

            slot.occupancy = desired.occupancy;
            if let Some(key) = desired.key {
                slot.key = key;
            }
            if let Some(value) = desired.value {
                slot.value = value;
            }
            on_write();

            Ok(previous)
        } else {
            Err(*slot)
        };

        expected.refresh(&slot);

        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fresh_bucket_is_empty() {
        let bucket: Bucket<u32, u64> = Bucket::default();
        let slot = bucket.load();

        assert_eq!(slot.occupancy, Occupancy::Empty);
        assert_eq!(slot.key, 0);
        assert_eq!(slot.value, 0);
    }

    #[test]
    fn claim_empty() {
        let bucket = Bucket::default();
        let mut expected = Expected::any().occupancy(Occupancy::Empty).key(0u32);

        let previous = bucket.compare_and_set(Desired::element(7, 70u64), &mut expected).unwrap();

        assert_eq!(previous.occupancy, Occupancy::Empty);
        assert_eq!(expected.occupancy, Some(Occupancy::Element));
        assert_eq!(expected.key, Some(7));
        // Not asked for, so not written back.
        assert_eq!(expected.value, None);
        assert_eq!(bucket.load(), Slot { occupancy: Occupancy::Element, key: 7, value: 70 });
    }

    #[test]
    fn mismatch_writes_nothing() {
        let bucket = Bucket::default();
        bucket.compare_and_set(Desired::element(7u32, 70u64), &mut Expected::any()).unwrap();

        let mut expected = Expected::any().occupancy(Occupancy::Element).value(71);
        let actual = bucket.compare_and_set(Desired::value(72), &mut expected).unwrap_err();

        assert_eq!(actual.value, 70);
        assert_eq!(expected.value, Some(70));
        assert_eq!(expected.occupancy, Some(Occupancy::Element));
        assert_eq!(bucket.load().value, 70);

        // Retrying with the refreshed expectation goes through.
        assert_eq!(bucket.compare_and_set(Desired::value(72), &mut expected).unwrap().value, 70);
        assert_eq!(bucket.load().value, 72);
    }

    #[test]
    fn tombstone_keeps_key() {
        let bucket = Bucket::default();
        bucket.compare_and_set(Desired::element(3u32, 30u64), &mut Expected::any()).unwrap();

        let mut expected = Expected::any().occupancy(Occupancy::Element);
        bucket.compare_and_set(Desired::deleted(), &mut expected).unwrap();

        let slot = bucket.load();
        assert_eq!(slot.occupancy, Occupancy::Deleted);
        assert_eq!(slot.key, 3);
        assert_eq!(expected.occupancy, Some(Occupancy::Deleted));

        // A second delete expecting a live entry fails.
        let mut expected = Expected::any().occupancy(Occupancy::Element);
        assert!(bucket.compare_and_set(Desired::deleted(), &mut expected).is_err());
        assert_eq!(expected.occupancy, Some(Occupancy::Deleted));
    }

    #[test]
    fn on_write_only_after_write() {
        let bucket = Bucket::default();
        let mut writes = 0;

        let mut expected = Expected::any();
        bucket.compare_and_set_with(Desired::element(1u32, 10u64), &mut expected, || writes += 1)
            .unwrap();
        expected = Expected::any().occupancy(Occupancy::Empty);
        bucket.compare_and_set_with(Desired::element(2, 20), &mut expected, || writes += 1)
            .unwrap_err();

        assert_eq!(writes, 1);
    }

    #[test]
    fn reads_pass_queued_writers() {
        let bucket = Arc::new(Bucket::default());
        bucket.compare_and_set(Desired::element(1u32, 10u64), &mut Expected::any()).unwrap();

        let guard = bucket.read();
        let writer = {
            let bucket = bucket.clone();
            thread::spawn(move || {
                bucket.compare_and_set(Desired::value(11), &mut Expected::any()).unwrap();
            })
        };
        // Give the writer time to park on the lock.
        thread::sleep(Duration::from_millis(50));

        // A second read from the same thread doesn't wait for the writer.
        assert_eq!(bucket.load().value, 10);
        drop(guard);

        writer.join().unwrap();
        assert_eq!(bucket.load().value, 11);
    }

    #[test]
    fn racing_claims() {
        let bucket = Arc::new(Bucket::default());
        let mut joins = Vec::new();

        for t in 0..8u32 {
            let bucket = bucket.clone();
            joins.push(thread::spawn(move || {
                let mut expected = Expected::any().occupancy(Occupancy::Empty);
                bucket.compare_and_set(Desired::element(t, u64::from(t)), &mut expected).is_ok()
            }));
        }

        let mut winners = 0;
        for j in joins {
            if j.join().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        // Key and value were written together.
        let slot = bucket.load();
        assert_eq!(u64::from(slot.key), slot.value);
    }
}
