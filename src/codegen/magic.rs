// Division by a constant is replaced by a multiply-high with a precomputed reciprocal
// ("magic number") followed by shifts. The generation follows the well known branchful
// libdivide scheme: for an unsigned divisor d with k = floor(log2 d) the magic is
// ceil(2^(64+k) / d) when the rounding error stays below 2^k, otherwise a 65-bit magic
// is emulated by the "add" fixup ((n - q) >> 1) + q before the final shift. The signed
// variant works on |d|, applies the fixup by adding the dividend back, and rounds toward
// zero by adding the sign bit of the quotient. Powers of two and the trivial divisors
// 0 and +-1 are rejected because strength reduction handles them with plain shifts.
// The divide methods evaluate exactly what the emitted machine sequence computes, so
// they double as the reference for the property tests.

//! Magic numbers for division by constants.

/// Reciprocal for unsigned 64-bit division.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsignedMagic {
    pub magic: u64,
    pub shift: u8,
    /// Use the 65-bit fixup sequence.
    pub add: bool,
}

/// Reciprocal for signed 64-bit division.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedMagic {
    pub magic: i64,
    pub shift: u8,
    /// Add (or for negative divisors, subtract) the dividend after the multiply.
    pub add: bool,
    pub negative: bool,
}

fn mulhi_u(a: u64, b: u64) -> u64 {
    ((a as u128 * b as u128) >> 64) as u64
}

fn mulhi_s(a: i64, b: i64) -> i64 {
    ((a as i128 * b as i128) >> 64) as i64
}

/// Magic for `n / d`; `None` for 0, 1 and powers of two.
pub fn unsigned_magic(d: u64) -> Option<UnsignedMagic> {
    if d == 0 || d.is_power_of_two() {
        return None;
    }
    let k = 63 - d.leading_zeros();
    let num = 1u128 << (64 + k);
    let mut proposed = (num / d as u128) as u64;
    let rem = (num % d as u128) as u64;
    let e = d - rem;
    let add = if e < (1u64 << k) {
        false
    } else {
        proposed = proposed.wrapping_add(proposed);
        let twice_rem = rem.wrapping_add(rem);
        if twice_rem >= d || twice_rem < rem {
            proposed = proposed.wrapping_add(1);
        }
        true
    };
    Some(UnsignedMagic {
        magic: proposed.wrapping_add(1),
        shift: k as u8,
        add,
    })
}

impl UnsignedMagic {
    /// Quotient as computed by the emitted sequence.
    pub fn divide(&self, n: u64) -> u64 {
        let q = mulhi_u(n, self.magic);
        if self.add {
            (((n - q) >> 1) + q) >> self.shift
        } else {
            q >> self.shift
        }
    }
}

/// Magic for signed `n / d`; `None` for 0, +-1 and +-powers of two.
pub fn signed_magic(d: i64) -> Option<SignedMagic> {
    let abs = d.unsigned_abs();
    if abs <= 1 || abs.is_power_of_two() {
        return None;
    }
    let k = 63 - abs.leading_zeros();
    let num = 1u128 << (64 + k - 1);
    let mut proposed = (num / abs as u128) as u64;
    let rem = (num % abs as u128) as u64;
    let e = abs - rem;
    let (shift, add) = if e < (1u64 << k) {
        (k - 1, false)
    } else {
        proposed = proposed.wrapping_add(proposed);
        let twice_rem = rem.wrapping_add(rem);
        if twice_rem >= abs || twice_rem < rem {
            proposed = proposed.wrapping_add(1);
        }
        (k, true)
    };
    let mut magic = proposed.wrapping_add(1) as i64;
    if d < 0 {
        magic = magic.wrapping_neg();
    }
    Some(SignedMagic {
        magic,
        shift: shift as u8,
        add,
        negative: d < 0,
    })
}

impl SignedMagic {
    /// Quotient as computed by the emitted sequence, truncating toward zero.
    pub fn divide(&self, n: i64) -> i64 {
        let mut q = mulhi_s(n, self.magic);
        if self.add {
            q = if self.negative { q.wrapping_sub(n) } else { q.wrapping_add(n) };
        }
        q >>= self.shift;
        q.wrapping_add(((q as u64) >> 63) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rejects_trivial_divisors() {
        assert!(unsigned_magic(0).is_none());
        assert!(unsigned_magic(1).is_none());
        assert!(unsigned_magic(64).is_none());
        assert!(signed_magic(-1).is_none());
        assert!(signed_magic(-16).is_none());
        assert!(signed_magic(i64::MIN).is_none());
    }

    #[test]
    fn test_known_divisors() {
        let seven = unsigned_magic(7).unwrap();
        assert!(seven.add);
        for n in [0u64, 6, 7, 8, 1000, u64::MAX, u64::MAX - 1] {
            assert_eq!(seven.divide(n), n / 7);
        }
        let ten = unsigned_magic(10).unwrap();
        assert!(!ten.add);
        assert_eq!(ten.divide(u64::MAX), u64::MAX / 10);

        for d in [3i64, -3, 7, -7, 10, 1000, i64::MAX, i64::MIN + 1] {
            let m = signed_magic(d).unwrap();
            for n in [0i64, 1, -1, 5, -5, i64::MAX, i64::MIN, 123_456_789] {
                assert_eq!(m.divide(n), n.wrapping_div(d), "{n} / {d}");
            }
        }
    }

    #[test]
    fn test_small_divisors_exhaustive_dividends() {
        for d in 3u64..200 {
            if let Some(m) = unsigned_magic(d) {
                for n in 0..2000u64 {
                    assert_eq!(m.divide(n), n / d);
                }
            }
            if let Some(m) = signed_magic(d as i64) {
                for n in -1000i64..1000 {
                    assert_eq!(m.divide(n), n / d as i64);
                }
            }
        }
    }

    proptest! {
        #[test]
        fn unsigned_matches_native(n in any::<u64>(), d in 2u64..) {
            if let Some(m) = unsigned_magic(d) {
                prop_assert_eq!(m.divide(n), n / d);
            }
        }

        #[test]
        fn signed_matches_native(n in any::<i64>(), d in any::<i64>()) {
            if let Some(m) = signed_magic(d) {
                prop_assert_eq!(m.divide(n), n.wrapping_div(d));
            }
        }
    }
}
