//! 16-bit wrapping sequence numbers.
//!
//! Sequence numbers live on a ring of 2^16 values. `a` precedes `b` when the
//! forward distance from `a` to `b` is in `1..HALF_RANGE`. There is no total
//! order, so `Seq` intentionally does not implement `Ord`; windows on either
//! side of the ring must stay below `HALF_RANGE` for comparisons to be
//! meaningful.

use std::fmt;

/// Half the sequence space. Forward distances at or beyond this are treated
/// as "behind".
pub const HALF_RANGE: u16 = 1 << 15;

/// A wire sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Seq(pub u16);

impl Seq {
    pub const ZERO: Seq = Seq(0);

    pub fn value(self) -> u16 {
        self.0
    }

    /// The sequence number following this one.
    pub fn next(self) -> Self {
        Seq(self.0.wrapping_add(1))
    }

    /// The sequence number preceding this one.
    pub fn prev(self) -> Self {
        Seq(self.0.wrapping_sub(1))
    }

    pub fn add(self, n: u16) -> Self {
        Seq(self.0.wrapping_add(n))
    }

    /// Forward distance from `self` to `other` on the ring.
    pub fn distance_to(self, other: Seq) -> u16 {
        other.0.wrapping_sub(self.0)
    }

    /// True if `self` comes strictly before `other`.
    pub fn precedes(self, other: Seq) -> bool {
        let d = self.distance_to(other);
        d != 0 && d < HALF_RANGE
    }

    /// True if `self` comes strictly after `other`.
    pub fn follows(self, other: Seq) -> bool {
        other.precedes(self)
    }

    /// True if `self` lies in `[start, start + len)` on the ring.
    pub fn in_window(self, start: Seq, len: u16) -> bool {
        start.distance_to(self) < len
    }
}

impl From<u16> for Seq {
    fn from(value: u16) -> Self {
        Seq(value)
    }
}

impl From<Seq> for u16 {
    fn from(seq: Seq) -> Self {
        seq.0
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_wraps_at_u16_max() {
        assert_eq!(Seq(u16::MAX).next(), Seq(0));
        assert_eq!(Seq(0).prev(), Seq(u16::MAX));
    }

    #[test]
    fn ordering_across_wrap() {
        assert!(Seq(65535).precedes(Seq(0)));
        assert!(Seq(65530).precedes(Seq(3)));
        assert!(Seq(3).follows(Seq(65530)));
        assert!(!Seq(3).precedes(Seq(65530)));
    }

    #[test]
    fn equal_is_neither_before_nor_after() {
        assert!(!Seq(7).precedes(Seq(7)));
        assert!(!Seq(7).follows(Seq(7)));
    }

    #[test]
    fn half_range_is_behind() {
        // Exactly half the ring away is ambiguous; treat it as not-ahead.
        assert!(!Seq(0).precedes(Seq(HALF_RANGE)));
        assert!(Seq(0).precedes(Seq(HALF_RANGE - 1)));
    }

    #[test]
    fn window_membership() {
        assert!(Seq(65534).in_window(Seq(65530), 8));
        assert!(Seq(1).in_window(Seq(65530), 8));
        assert!(!Seq(2).in_window(Seq(65530), 8));
        assert!(!Seq(65529).in_window(Seq(65530), 8));
    }
}
