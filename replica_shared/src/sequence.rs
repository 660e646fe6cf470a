//! Wrapping `u16` sequence numbers.
//!
//! Comparisons use half-range arithmetic so a sender can keep counting
//! forever: `s1` is "newer" than `s2` when it is ahead by less than 32768.

/// `sequence_greater_than(2, 1)` is true, `(1, 2)` and `(1, 1)` are false.
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

/// Signed distance from `a` forward to `b`.
///
/// `wrapping_diff(65535, 0) == 1`, `wrapping_diff(0, 65535) == -1`.
pub fn wrapping_diff(a: u16, b: u16) -> i16 {
    b.wrapping_sub(a) as i16
}
