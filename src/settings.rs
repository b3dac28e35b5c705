//! Settings and presets.

use backoff::Strategy;
use error::Error;

/// The smallest supported size exponent.
pub const MIN_SIZE_EXPONENT: u32 = 1;
/// The largest supported size exponent.
pub const MAX_SIZE_EXPONENT: u32 = 32;

/// Settings for a table.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Settings {
    /// The base-2 logarithm of the number of buckets.
    ///
    /// The capacity of the table is fixed to `2^size_exponent` at construction.
    pub size_exponent: u32,
    /// How to wait after losing a race on a bucket.
    pub backoff: Strategy,
    /// The maximal number of retries of a single operation on a single bucket.
    ///
    /// `None` means retrying for as long as the operation's precondition holds. When the limit is
    /// hit, the operation fails with `Error::Contended`.
    pub max_retries: Option<u32>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            size_exponent: 10,
            backoff: Strategy::Spin,
            max_retries: None,
        }
    }
}

impl Settings {
    /// Preset yielding the thread between retries.
    ///
    /// This suits machines with more threads than cores.
    pub fn low_latency() -> Settings {
        Settings {
            backoff: Strategy::Yield,
            .. Settings::default()
        }
    }

    /// Preset for heavy same-key contention.
    ///
    /// Retries back off exponentially and are bounded, so an operation can't livelock.
    pub fn contended() -> Settings {
        Settings {
            backoff: Strategy::Exponential { limit: 6 },
            max_retries: Some(4096),
            .. Settings::default()
        }
    }

    /// Set the size exponent.
    pub fn size_exponent(mut self, size_exponent: u32) -> Settings {
        self.size_exponent = size_exponent;
        self
    }

    /// The number of buckets these settings describe.
    pub fn capacity(&self) -> usize {
        1 << self.size_exponent
    }

    /// Check that the settings describe a table that can be built.
    pub fn validate(&self) -> Result<(), Error> {
        check_size_exponent(self.size_exponent)
    }
}

/// Check that a size exponent is in range and addressable on this platform.
pub fn check_size_exponent(size_exponent: u32) -> Result<(), Error> {
    if size_exponent < MIN_SIZE_EXPONENT
        || size_exponent > MAX_SIZE_EXPONENT
        || 1usize.checked_shl(size_exponent).is_none() {
        return Err(Error::SizeExponent(size_exponent));
    }

    Ok(())
}
