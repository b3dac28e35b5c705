//! Table errors.
//!
//! Everything in here is an expected outcome of an operation (a miss, a full table, a declined
//! closure). Broken invariants don't go through this type; see the `fatal` module for those.

quick_error! {
    /// A table operation error.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Error {
        /// No eligible bucket was found on the whole probe sequence.
        Full {
            display("No free bucket left in the table.")
        }
        /// Probing stopped at a tombstone holding another key.
        ///
        /// A tombstone keeps its key, and insertion only reuses tombstones of the same key.
        Blocked {
            display("Probing was blocked by the tombstone of another key.")
        }
        /// The key is not in the table.
        ///
        /// This is also reported when the entry was deleted concurrently, while the operation was
        /// trying to modify it.
        NotFound {
            display("The key is not in the table.")
        }
        /// The caller-supplied closure declined to produce a value.
        Declined {
            display("The closure declined to produce a value.")
        }
        /// The bounded retry budget was exhausted under contention.
        Contended(attempts: u32) {
            display("Gave up after {} contended attempts.", attempts)
        }
        /// The size exponent is outside of the supported range.
        SizeExponent(pow: u32) {
            display("Size exponent {} is out of range.", pow)
        }
        /// The live entries don't fit in the requested capacity.
        TooSmall { live: usize, capacity: usize } {
            display("{} live entries do not fit in {} buckets.", live, capacity)
        }
    }
}
