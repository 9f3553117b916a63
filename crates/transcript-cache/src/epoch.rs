//! Generation tokens for cooperative cancellation
//!
//! An [`Epoch`] is captured before an asynchronous step suspends and compared
//! with the live value after it resumes. Bumping the live epoch invalidates
//! every captured copy at once.

use derive_more::Display;

/// Monotonic generation counter
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u64);

impl Epoch {
    pub const ZERO: Self = Self(0);

    /// The epoch after this one
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Advance in place and return the new value
    pub fn bump(&mut self) -> Self {
        *self = self.next();
        *self
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next() {
        assert_eq!(Epoch::ZERO.next(), Epoch(1));
        assert_eq!(Epoch(41).next().value(), 42);
    }

    #[test]
    fn test_bump_invalidates_captured_copy() {
        let mut live = Epoch::default();
        let captured = live;
        assert_eq!(captured, live);

        let bumped = live.bump();
        assert_eq!(bumped, live);
        assert_ne!(captured, live);
    }

    #[test]
    fn test_wraps_instead_of_panicking() {
        assert_eq!(Epoch(u64::MAX).next(), Epoch::ZERO);
    }
}
