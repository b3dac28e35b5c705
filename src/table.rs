//! The concurrent table.

use std::hash::{BuildHasher, BuildHasherDefault, Hash, Hasher};
use std::sync::atomic::{self, AtomicUsize};
use std::{fmt, ops};

use parking_lot::{MappedRwLockReadGuard, RwLockReadGuard};
use seahash::SeaHasher;
use slog::{Discard, Logger};

use backoff::Backoff;
use bucket::{Bucket, Desired, Expected, Occupancy, Slot};
use error::Error;
use settings::{self, Settings};

/// The atomic ordering of the live-entry counter.
const ORDERING: atomic::Ordering = atomic::Ordering::Relaxed;

/// The default hash builder.
///
/// SeaHash diffuses every word it is fed, so the high bits (which determine the home bucket) are
/// well distributed.
pub type DefaultHashBuilder = BuildHasherDefault<SeaHasher>;

/// The sequence of bucket indexes to visit for some key.
///
/// It starts at the home index and walks forward, wrapping around. Every bucket is visited at most
/// once, after which the sequence ends.
struct Probe {
    /// The next index.
    next: usize,
    /// The mask to wrap indexes with.
    mask: usize,
    /// The number of buckets left to visit.
    remaining: usize,
}

impl Iterator for Probe {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }

        let idx = self.next;
        self.next = (idx + 1) & self.mask;
        self.remaining -= 1;

        Some(idx)
    }
}

/// Can a bucket holding `slot` be claimed for `key`?
///
/// `Some(true)` if it can, `Some(false)` if it can't and probing should go on, and `None` if
/// probing must stop: a tombstone of another key blocks the insertion.
fn claimable<K: PartialEq, V>(slot: &Slot<K, V>, key: &K) -> Option<bool> {
    match slot.occupancy {
        Occupancy::Empty => Some(true),
        Occupancy::Deleted if slot.key == *key => Some(true),
        Occupancy::Deleted => None,
        Occupancy::Element => Some(false),
    }
}

/// A read guard to a value in the table.
///
/// This holds the shared lock of the value's bucket, so writers of that bucket wait until it is
/// dropped. Lookups of other keys (and of the same key) from the holding thread don't wait, even
/// when a writer is queued on the bucket. Modifying the guarded entry from the holding thread
/// deadlocks.
pub struct ReadGuard<'a, V: 'a> {
    inner: MappedRwLockReadGuard<'a, V>,
}

impl<'a, V> ops::Deref for ReadGuard<'a, V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.inner
    }
}

impl<'a, V: fmt::Debug> fmt::Debug for ReadGuard<'a, V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// A fixed-capacity concurrent hash table.
///
/// The table is an array of `2^size_exponent` buckets, each with its own reader/writer lock.
/// Collisions are resolved by linear probing. Removed entries leave a tombstone carrying their
/// key, which only the same key can reuse.
///
/// All operations take `&self` and can be called from any number of threads.
pub struct Table<K, V, S = DefaultHashBuilder> {
    /// The base-2 logarithm of the number of buckets.
    pow: u32,
    /// The buckets.
    buckets: Vec<Bucket<K, V>>,
    /// The number of live entries.
    len: AtomicUsize,
    /// The settings the table was built with.
    settings: Settings,
    /// The hash builder.
    hash_builder: S,
    /// The logger.
    log: Logger,
}

/// Allocate `2^pow` empty buckets.
fn buckets<K: Default, V: Default>(pow: u32) -> Vec<Bucket<K, V>> {
    // `RwLock` isn't `Clone`, so we can't use `vec!`.
    let cap = 1 << pow;
    let mut vec = Vec::with_capacity(cap);
    for _ in 0..cap {
        vec.push(Bucket::default());
    }

    vec
}

impl<K, V> Table<K, V>
where K: Hash + Eq + Copy + Default,
      V: Copy + PartialEq + Default {
    /// Create a table of `2^size_exponent` buckets with default settings.
    pub fn new(size_exponent: u32) -> Result<Table<K, V>, Error> {
        Table::with_settings(Settings::default().size_exponent(size_exponent))
    }

    /// Create a table with some settings.
    pub fn with_settings(settings: Settings) -> Result<Table<K, V>, Error> {
        Table::with_logger(settings, None::<Logger>)
    }

    /// Create a table with some settings, logging to `log`.
    pub fn with_logger<L>(settings: Settings, log: L) -> Result<Table<K, V>, Error>
        where L: Into<Option<Logger>> {
        Table::with_hasher(settings, DefaultHashBuilder::default(), log)
    }
}

impl<K, V, S> Table<K, V, S>
where K: Hash + Eq + Copy + Default,
      V: Copy + PartialEq + Default,
      S: BuildHasher {
    /// Create a table with some settings and a custom hash builder, logging to `log`.
    ///
    /// The home bucket of a key is given by the top bits of its hash, so the hasher must mix
    /// entropy into the high bits.
    pub fn with_hasher<L>(settings: Settings, hash_builder: S, log: L) -> Result<Table<K, V, S>, Error>
        where L: Into<Option<Logger>> {
        settings.validate()?;

        let log = log.into().unwrap_or_else(|| Logger::root(Discard, o!()));
        info!(log, "creating table"; "capacity" => settings.capacity());

        Ok(Table {
            pow: settings.size_exponent,
            buckets: buckets(settings.size_exponent),
            len: AtomicUsize::new(0),
            settings: settings,
            hash_builder: hash_builder,
            log: log,
        })
    }

    /// The index of the bucket where probing for `key` starts.
    ///
    /// This is the top `size_exponent` bits of the key's hash.
    pub fn home_index(&self, key: &K) -> usize {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);

        let idx = (hasher.finish() >> (64 - self.pow)) as usize;
        precond!(self.log, idx < self.buckets.len());

        idx
    }

    /// The probe sequence of `key`.
    fn probe(&self, key: &K) -> Probe {
        Probe {
            next: self.home_index(key),
            mask: self.buckets.len() - 1,
            remaining: self.buckets.len(),
        }
    }

    /// Start the retry state of an operation.
    fn backoff(&self) -> Backoff {
        Backoff::new(&self.settings)
    }

    /// Wait before retrying a lost race on bucket `idx`.
    fn snooze(&self, backoff: &mut Backoff, idx: usize) -> Result<(), Error> {
        trace!(self.log, "retrying compare-and-set"; "bucket" => idx, "attempt" => backoff.attempts());

        backoff.snooze().map_err(|err| {
            debug!(self.log, "giving up under contention"; "bucket" => idx);
            err
        })
    }

    /// Insert a key-value pair.
    ///
    /// The pair is placed in the first bucket on the probe sequence that is either empty or a
    /// tombstone of the same key. Live entries are skipped, whatever their key, so inserting a key
    /// that is already present adds another entry, shadowed by the first one.
    ///
    /// This fails with `Error::Blocked` if probing hits the tombstone of another key, and with
    /// `Error::Full` if no bucket could be claimed.
    pub fn insert(&self, key: K, val: V) -> Result<(), Error> {
        for idx in self.probe(&key) {
            let bucket = &self.buckets[idx];
            let snapshot = bucket.load();

            match claimable(&snapshot, &key) {
                Some(true) => (),
                Some(false) => continue,
                None => {
                    debug!(self.log, "insertion blocked by tombstone"; "bucket" => idx);
                    return Err(Error::Blocked);
                },
            }

            let mut expected = Expected::any()
                .occupancy(snapshot.occupancy)
                .key(snapshot.key);
            let mut backoff = self.backoff();

            loop {
                let claimed = bucket.compare_and_set_with(Desired::element(key, val), &mut expected, || {
                    self.len.fetch_add(1, ORDERING);
                });
                if claimed.is_ok() {
                    return Ok(());
                }

                // Someone else got there first. Retry only if the bucket is still up for grabs,
                // otherwise move on to the next one.
                let still_claimable = match (expected.occupancy, expected.key) {
                    (Some(occupancy), Some(found)) => {
                        occupancy == Occupancy::Empty
                            || (occupancy == Occupancy::Deleted && found == key)
                    },
                    _ => false,
                };
                if !still_claimable {
                    break;
                }

                self.snooze(&mut backoff, idx)?;
            }
        }

        debug!(self.log, "table full"; "capacity" => self.capacity());
        Err(Error::Full)
    }

    /// Get the value of some key.
    ///
    /// The returned guard keeps the bucket read-locked until it is dropped. See `ReadGuard` for
    /// what the holding thread may do meanwhile.
    pub fn get(&self, key: &K) -> Option<ReadGuard<V>> {
        for idx in self.probe(key) {
            let lock = self.buckets[idx].read();
            let occupancy = lock.occupancy;
            let matching = lock.key == *key;

            match occupancy {
                Occupancy::Empty => return None,
                Occupancy::Element if matching => {
                    return Some(ReadGuard {
                        inner: RwLockReadGuard::map(lock, |slot| &slot.value),
                    });
                },
                _ => (),
            }
        }

        None
    }

    /// Does the table contain some key?
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Find the live entry of `key`.
    ///
    /// Returns the index of its bucket and the bucket's snapshot.
    fn find(&self, key: &K) -> Option<(usize, Slot<K, V>)> {
        for idx in self.probe(key) {
            let snapshot = self.buckets[idx].load();

            match snapshot.occupancy {
                Occupancy::Empty => return None,
                Occupancy::Element if snapshot.key == *key => return Some((idx, snapshot)),
                _ => (),
            }
        }

        None
    }

    /// Replace the value of some key.
    ///
    /// On success, the value the replacement overwrote is returned. If the entry is deleted
    /// concurrently, this fails with `Error::NotFound`.
    pub fn swap(&self, key: &K, val: V) -> Result<V, Error> {
        let (idx, _) = self.find(key).ok_or(Error::NotFound)?;
        let bucket = &self.buckets[idx];

        // Keys never move, so the bucket alone identifies the entry.
        let mut expected = Expected::any().occupancy(Occupancy::Element);
        let mut backoff = self.backoff();

        loop {
            match bucket.compare_and_set(Desired::value(val), &mut expected) {
                Ok(previous) => return Ok(previous.value),
                Err(ref actual) if actual.occupancy == Occupancy::Element => (),
                // Deleted in the meantime.
                Err(_) => return Err(Error::NotFound),
            }

            self.snooze(&mut backoff, idx)?;
        }
    }

    /// Delete some key.
    ///
    /// The bucket becomes a tombstone which keeps the key. If the key was already deleted (or is
    /// deleted concurrently by another thread), this fails with `Error::NotFound`.
    pub fn delete(&self, key: &K) -> Result<(), Error> {
        for idx in self.probe(key) {
            let bucket = &self.buckets[idx];
            let snapshot = bucket.load();

            if snapshot.occupancy == Occupancy::Empty {
                break;
            }
            if snapshot.key != *key {
                continue;
            }

            let mut expected = Expected::any().occupancy(snapshot.occupancy);
            let mut backoff = self.backoff();

            while expected.occupancy != Some(Occupancy::Deleted) {
                let removed = bucket.compare_and_set_with(Desired::deleted(), &mut expected, || {
                    self.len.fetch_sub(1, ORDERING);
                });
                if removed.is_ok() {
                    return Ok(());
                }

                if expected.occupancy != Some(Occupancy::Deleted) {
                    self.snooze(&mut backoff, idx)?;
                }
            }

            // The bucket of the key is a tombstone, or became one under our feet. Either way, the
            // key is gone and there is no other bucket for it.
            return Err(Error::NotFound);
        }

        Err(Error::NotFound)
    }

    /// Update the value of some key.
    ///
    /// `f` maps the current value to the new one, or declines with `None`, in which case nothing
    /// is changed and `Error::Declined` is returned. The new value is only written if the value
    /// didn't change in the meantime. Otherwise, `f` is called again on the fresh value.
    ///
    /// This makes read-modify-write (e.g. counters) safe under concurrency, at the cost of calling
    /// `f` more than once under contention.
    pub fn update<F>(&self, key: &K, mut f: F) -> Result<(), Error>
        where F: FnMut(&V) -> Option<V> {
        let (idx, snapshot) = self.find(key).ok_or(Error::NotFound)?;
        let bucket = &self.buckets[idx];

        let mut current = snapshot.value;
        let mut backoff = self.backoff();

        loop {
            let new = f(&current).ok_or(Error::Declined)?;

            let mut expected = Expected::any()
                .occupancy(Occupancy::Element)
                .value(current);

            match bucket.compare_and_set(Desired::value(new), &mut expected) {
                Ok(_) => return Ok(()),
                Err(ref actual) if actual.occupancy == Occupancy::Element => current = actual.value,
                Err(_) => return Err(Error::NotFound),
            }

            self.snooze(&mut backoff, idx)?;
        }
    }

    /// Insert a key, initializing its value with `init`.
    ///
    /// This claims a bucket like `insert` does, but the bucket's exclusive lock is held while
    /// `init` runs. Hence `init` is called at most once, and never concurrently for the same
    /// bucket. If it declines with `None`, the bucket is left as it was and `Error::Declined` is
    /// returned.
    pub fn key_init<F>(&self, key: K, init: F) -> Result<(), Error>
        where F: FnOnce() -> Option<V> {
        for idx in self.probe(&key) {
            let bucket = &self.buckets[idx];
            let mut snapshot = bucket.load();
            let mut backoff = self.backoff();
            let mut retrying = false;

            loop {
                match claimable(&snapshot, &key) {
                    Some(true) => (),
                    Some(false) => break,
                    None => {
                        debug!(self.log, "key initialization blocked by tombstone"; "bucket" => idx);
                        return Err(Error::Blocked);
                    },
                }

                if retrying {
                    self.snooze(&mut backoff, idx)?;
                }
                retrying = true;

                {
                    let mut slot = bucket.write();

                    if slot.occupancy == snapshot.occupancy {
                        // Nothing changed since the snapshot, so the bucket is ours.
                        return match init() {
                            Some(val) => {
                                *slot = Slot {
                                    occupancy: Occupancy::Element,
                                    key: key,
                                    value: val,
                                };
                                self.len.fetch_add(1, ORDERING);

                                Ok(())
                            },
                            None => Err(Error::Declined),
                        };
                    }

                    snapshot = *slot;
                }
            }
        }

        debug!(self.log, "table full"; "capacity" => self.capacity());
        Err(Error::Full)
    }

    /// Rebuild the table with `2^size_exponent` buckets.
    ///
    /// This needs exclusive access. Every live entry is moved to the new bucket array, and
    /// tombstones are dropped. The table can both grow and shrink, as long as the live entries
    /// fit; if they don't, the table is left untouched.
    ///
    /// Entries of the same key keep their relative probe order, so the same one stays visible.
    pub fn resize(&mut self, size_exponent: u32) -> Result<(), Error> {
        settings::check_size_exponent(size_exponent)?;

        let mut live: Vec<(usize, Slot<K, V>)> = self.buckets.iter_mut()
            .map(|bucket| *bucket.get_mut())
            .enumerate()
            .filter(|&(_, slot)| slot.occupancy == Occupancy::Element)
            .collect();
        let capacity = 1 << size_exponent;
        if live.len() > capacity {
            return Err(Error::TooSmall {
                live: live.len(),
                capacity: capacity,
            });
        }

        info!(self.log, "resizing table"; "from" => self.pow, "to" => size_exponent, "live" => live.len());

        // Place entries by their distance from their home bucket. Entries of the same key share a
        // home, so the one probed first is placed first.
        let mask = self.buckets.len() - 1;
        live.sort_by_key(|&(idx, slot)| idx.wrapping_sub(self.home_index(&slot.key)) & mask);

        self.buckets = buckets(size_exponent);
        self.pow = size_exponent;
        self.settings.size_exponent = size_exponent;

        for &(_, slot) in &live {
            self.place(slot);
        }

        *self.len.get_mut() = live.len();

        Ok(())
    }

    /// Put a live entry into the first empty bucket of its probe sequence, without locking.
    fn place(&mut self, slot: Slot<K, V>) {
        for idx in self.probe(&slot.key) {
            let bucket = self.buckets[idx].get_mut();

            if bucket.occupancy == Occupancy::Empty {
                *bucket = slot;
                return;
            }
        }

        fatal!(self.log, "no free bucket for a live entry while resizing");
    }

    /// Run a closure on every live entry.
    ///
    /// Buckets are visited one at a time, under their shared lock, so this is not a snapshot of
    /// the whole table.
    pub fn for_each<F>(&self, mut f: F)
        where F: FnMut(&K, &V) {
        for bucket in &self.buckets {
            let slot = bucket.read();

            if slot.occupancy == Occupancy::Element {
                f(&slot.key, &slot.value);
            }
        }
    }
}

impl<K, V, S> Table<K, V, S> {
    /// The number of live entries.
    ///
    /// This is only exact when no other thread is modifying the table.
    pub fn len(&self) -> usize {
        self.len.load(ORDERING)
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of buckets.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// The base-2 logarithm of the number of buckets.
    pub fn size_exponent(&self) -> u32 {
        self.pow
    }

    /// The settings of the table.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The bucket at index `idx`.
    #[cfg(test)]
    pub(crate) fn bucket(&self, idx: usize) -> &Bucket<K, V> {
        &self.buckets[idx]
    }
}

impl<K, V, S> fmt::Debug for Table<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Table")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl<K, V, S> Drop for Table<K, V, S> {
    fn drop(&mut self) {
        info!(self.log, "destroying table"; "capacity" => self.capacity(), "live" => self.len());
    }
}
