//! Validity clock: maps a requested join window to an absolute expiry.
//!
//! A zero window means the call stays joinable for as long as it is
//! registered. Any other window ends at `now + window`, measured on the same
//! monotonic clock the join decision reads, so both sides of the comparison
//! share one granularity.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Source of "now" for expiry computation and the join decision.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Monotonic wall-time clock (`Instant::now`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when [`advance`](Self::advance) is called.
///
/// Lets tests step a call past its validity window without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward by `by`.
    ///
    /// An advance past the last representable `Instant` leaves the clock
    /// where it is.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = offset.checked_add(by)
            && self.origin.checked_add(next).is_some()
        {
            *offset = next;
        }
    }

    /// Total time advanced since construction.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let elapsed = self.elapsed();
        self.origin.checked_add(elapsed).unwrap_or(self.origin)
    }
}

/// The instant after which a registered call no longer accepts joiners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Joinable until completion or `forget`.
    Unbounded,
    /// Joinable while `now < instant`.
    At(Instant),
}

impl Expiry {
    /// Compute the expiry for a call starting at `now` with the given window.
    ///
    /// A window too large to represent as an `Instant` is treated as
    /// unbounded.
    #[must_use]
    pub fn from_validity(now: Instant, validity: Duration) -> Self {
        if validity.is_zero() {
            return Self::Unbounded;
        }
        now.checked_add(validity).map_or(Self::Unbounded, Self::At)
    }

    /// Whether a caller arriving at `now` may still join.
    #[must_use]
    pub fn is_joinable_at(&self, now: Instant) -> bool {
        match self {
            Self::Unbounded => true,
            Self::At(deadline) => *deadline > now,
        }
    }
}
