//! Retrying lost races.
//!
//! Whenever a compare-and-set fails while the operation's precondition still holds, the operation
//! retries. In between it "snoozes" according to a `Strategy`, on top of `crossbeam_utils`'
//! exponential backoff. With no retry limit configured the loop is unbounded, like a plain spin
//! loop.

use std::thread;

use crossbeam_utils;

use error::Error;
use settings::Settings;

/// How to wait between two attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Spin, doubling the number of spin hints per attempt up to a small cap.
    Spin,
    /// Yield the time slice before retrying.
    Yield,
    /// Spin exponentially, then yield.
    ///
    /// After `limit` attempts, or once the exponential backoff is completed, the thread yields on
    /// every attempt.
    Exponential {
        /// The number of attempts to back off exponentially.
        limit: u32,
    },
}

/// The retry state of a single operation.
pub struct Backoff {
    /// The exponential backoff.
    inner: crossbeam_utils::Backoff,
    /// The waiting strategy.
    strategy: Strategy,
    /// The maximal number of retries, if any.
    max_retries: Option<u32>,
    /// The number of retries so far.
    attempt: u32,
}

impl Backoff {
    /// Start a fresh backoff with the given settings.
    pub fn new(settings: &Settings) -> Backoff {
        Backoff {
            inner: crossbeam_utils::Backoff::new(),
            strategy: settings.backoff,
            max_retries: settings.max_retries,
            attempt: 0,
        }
    }

    /// Wait before the next retry.
    ///
    /// This fails with `Error::Contended` when the retry budget is used up.
    pub fn snooze(&mut self) -> Result<(), Error> {
        if let Some(max) = self.max_retries {
            if self.attempt >= max {
                return Err(Error::Contended(self.attempt));
            }
        }

        match self.strategy {
            Strategy::Spin => self.inner.spin(),
            Strategy::Yield => thread::yield_now(),
            Strategy::Exponential { limit } => {
                if self.attempt < limit && !self.inner.is_completed() {
                    self.inner.snooze();
                } else {
                    thread::yield_now();
                }
            },
        }

        self.attempt += 1;

        Ok(())
    }

    /// The number of retries so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Is the exponential part of the backoff used up?
    ///
    /// From then on, every attempt of `Strategy::Exponential` yields. `Strategy::Spin` never
    /// completes.
    pub fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use settings::Settings;
    use error::Error;

    #[test]
    fn unbounded() {
        let mut backoff = Backoff::new(&Settings::default());

        for _ in 0..10000 {
            backoff.snooze().unwrap();
        }
        assert_eq!(backoff.attempts(), 10000);
    }

    #[test]
    fn bounded() {
        let mut backoff = Backoff::new(&Settings {
            max_retries: Some(3),
            .. Settings::default()
        });

        backoff.snooze().unwrap();
        backoff.snooze().unwrap();
        backoff.snooze().unwrap();
        assert_eq!(backoff.snooze(), Err(Error::Contended(3)));
        // It stays exhausted.
        assert_eq!(backoff.snooze(), Err(Error::Contended(3)));
    }

    #[test]
    fn exponential_falls_back_to_yield() {
        let mut backoff = Backoff::new(&Settings {
            backoff: Strategy::Exponential { limit: 2 },
            .. Settings::default()
        });

        for _ in 0..16 {
            backoff.snooze().unwrap();
        }
        assert_eq!(backoff.attempts(), 16);
        // Only the first two attempts went through the exponential backoff.
        assert!(!backoff.is_completed());
    }

    #[test]
    fn exponential_completes() {
        let mut backoff = Backoff::new(&Settings {
            backoff: Strategy::Exponential { limit: 64 },
            .. Settings::default()
        });

        assert!(!backoff.is_completed());
        for _ in 0..64 {
            backoff.snooze().unwrap();
        }
        assert!(backoff.is_completed());
    }
}
