use std::fmt;

/// A point on the routing keyspace, an integer ring modulo 2^16.
///
/// All arithmetic wraps. Interval membership is the ring test
/// `(x - a) mod 2^w <= (b - a) mod 2^w`; the empty interval convention is
/// `a == b => only a is in the interval`.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    derive_more::From,
    derive_more::Into,
)]
pub struct KeyId(pub u16);

impl KeyId {
    /// Number of bits in the keyspace; a Chord node keeps this many fingers.
    pub const BITS: u32 = u16::BITS;

    pub const MIN: KeyId = KeyId(u16::MIN);
    pub const MAX: KeyId = KeyId(u16::MAX);

    pub fn wrapping_add(self, rhs: KeyId) -> KeyId {
        KeyId(self.0.wrapping_add(rhs.0))
    }

    pub fn wrapping_sub(self, rhs: KeyId) -> KeyId {
        KeyId(self.0.wrapping_sub(rhs.0))
    }

    /// `self + 2^k` on the ring; the start of finger `k`.
    pub fn finger_start(self, k: u32) -> KeyId {
        KeyId(self.0.wrapping_add(1u16.wrapping_shl(k)))
    }

    /// Ring interval membership of `self` in `[start, end]`.
    pub fn in_interval(self, start: KeyId, end: KeyId) -> bool {
        if start == end {
            self == start
        } else {
            self.wrapping_sub(start) <= end.wrapping_sub(start)
        }
    }

    /// Membership in the half-open `(start, end]`, the ownership interval
    /// of a Chord node. `start == end` is the single-node ring: the whole
    /// keyspace belongs to it.
    pub fn in_exclusive_inclusive(self, start: KeyId, end: KeyId) -> bool {
        if start == end {
            return true;
        }
        let d = self.wrapping_sub(start);
        d != KeyId(0) && d <= end.wrapping_sub(start)
    }

    /// Membership in the open `(start, end)`. `start == end` degenerates to
    /// the full ring minus the endpoint.
    pub fn in_exclusive(self, start: KeyId, end: KeyId) -> bool {
        if start == end {
            return self != start;
        }
        let d = self.wrapping_sub(start);
        d != KeyId(0) && d < end.wrapping_sub(start)
    }

    /// Place a full key hash on the ring.
    pub fn from_hash(h: u128) -> KeyId {
        KeyId(h as u16)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({:#06x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(5, 1, 10, true; "plain interior")]
    #[test_case(1, 1, 10, true; "closed at start")]
    #[test_case(10, 1, 10, true; "closed at end")]
    #[test_case(11, 1, 10, false; "past end")]
    #[test_case(0xfff0, 0xff00, 0x0010, true; "wrapping interior")]
    #[test_case(0x0008, 0xff00, 0x0010, true; "wrapped past zero")]
    #[test_case(0x0020, 0xff00, 0x0010, false; "wrapping past end")]
    fn interval_membership(x: u16, a: u16, b: u16, expect: bool) {
        assert_eq!(KeyId(x).in_interval(KeyId(a), KeyId(b)), expect);
    }

    #[test]
    fn empty_interval_contains_only_its_start() {
        assert!(KeyId(7).in_interval(KeyId(7), KeyId(7)));
        assert!(!KeyId(8).in_interval(KeyId(7), KeyId(7)));
        assert!(!KeyId(6).in_interval(KeyId(7), KeyId(7)));
    }

    #[test]
    fn exclusive_inclusive_excludes_start() {
        assert!(!KeyId(3).in_exclusive_inclusive(KeyId(3), KeyId(9)));
        assert!(KeyId(9).in_exclusive_inclusive(KeyId(3), KeyId(9)));
        assert!(KeyId(4).in_exclusive_inclusive(KeyId(3), KeyId(9)));
    }

    #[test]
    fn single_node_ring_owns_everything() {
        assert!(KeyId(0).in_exclusive_inclusive(KeyId(9), KeyId(9)));
        assert!(KeyId(9).in_exclusive_inclusive(KeyId(9), KeyId(9)));
        assert!(!KeyId(9).in_exclusive(KeyId(9), KeyId(9)));
        assert!(KeyId(10).in_exclusive(KeyId(9), KeyId(9)));
    }

    #[test]
    fn adjacent_ids_leave_an_empty_open_interval() {
        assert!(!KeyId(4).in_exclusive(KeyId(4), KeyId(5)));
        assert!(!KeyId(5).in_exclusive(KeyId(4), KeyId(5)));
        assert!(KeyId(5).in_exclusive_inclusive(KeyId(4), KeyId(5)));
    }

    #[test]
    fn finger_starts_cover_powers_of_two() {
        let id = KeyId(0xfffe);
        assert_eq!(id.finger_start(0), KeyId(0xffff));
        assert_eq!(id.finger_start(1), KeyId(0x0000));
        assert_eq!(id.finger_start(15), KeyId(0x7ffe));
    }
}
