//! Truncated Value Expansion
//!
//! Several wire fields carry only the low bits of a wider logical counter:
//! 8-bit frame ids, 16-bit sequence numbers and 32-bit RTP timestamps. The
//! receiving side re-expands them against a reference value it already knows.
//! Reordering by more than half the truncated range cannot be detected and
//! yields the wrong value.

#[inline]
fn span_and_mask(bits: u32) -> (i64, i64) {
    debug_assert!(bits > 0 && bits < 63);
    let span = 1i64 << bits;
    (span, span - 1)
}

/// Expand to the value nearest `reference` whose low `bits` bits equal
/// `truncated`
///
/// The result lies in `(reference - 2^(bits-1), reference + 2^(bits-1)]`, so an
/// exact half-range tie resolves forward.
pub fn expand_nearest(reference: i64, truncated: u64, bits: u32) -> i64 {
    let (span, mask) = span_and_mask(bits);
    let lowest = reference - span / 2 + 1;
    let mut result = (lowest & !mask) | (truncated as i64 & mask);
    if result < lowest {
        result += span;
    }
    result
}

/// Expand to the greatest value `<= reference` whose low `bits` bits equal
/// `truncated`
pub fn expand_less_than_or_equal(reference: i64, truncated: u64, bits: u32) -> i64 {
    let (span, mask) = span_and_mask(bits);
    let mut result = (reference & !mask) | (truncated as i64 & mask);
    if result > reference {
        result -= span;
    }
    result
}

/// Expand to the smallest value `> reference` whose low `bits` bits equal
/// `truncated`
pub fn expand_greater_than(reference: i64, truncated: u64, bits: u32) -> i64 {
    let (span, mask) = span_and_mask(bits);
    let mut result = (reference & !mask) | (truncated as i64 & mask);
    if result <= reference {
        result += span;
    }
    result
}
