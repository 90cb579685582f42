//! 16-bit wraparound sequence numbers.
//!
//! Ordinals only carry meaning relative to each other. `a` is after `b` when
//! the signed mod-65536 distance `a - b` lies in `1..=32767`; a distance of
//! exactly half the space (-32768 as `i16`) counts as "not after", so the
//! relation is a strict order between any two distinct ordinals.
//!
//! Every comparison in the crate goes through [`Ordinal::distance`].

use std::cmp::Ordering;
use std::fmt;

/// Half of the 16-bit ordinal space.
pub const WINDOW_SIZE: u16 = 32768;

/// A per-channel, per-direction 16-bit sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ordinal(u16);

impl Ordinal {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    /// The ordinal immediately after this one.
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub const fn wrapping_add(self, n: u16) -> Self {
        Self(self.0.wrapping_add(n))
    }

    /// Signed distance from `other` to `self`, in `[-32768, 32767]`.
    pub const fn distance(self, other: Ordinal) -> i16 {
        self.0.wrapping_sub(other.0) as i16
    }

    /// Window-relative ordering of `self` against `other`.
    pub fn compare(self, other: Ordinal) -> Ordering {
        self.distance(other).cmp(&0)
    }

    pub fn is_before(self, other: Ordinal) -> bool {
        self.distance(other) < 0
    }

    pub fn is_after(self, other: Ordinal) -> bool {
        self.distance(other) > 0
    }
}

impl From<u16> for Ordinal {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<Ordinal> for u16 {
    fn from(ordinal: Ordinal) -> Self {
        ordinal.0
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
