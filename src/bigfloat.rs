//! The `BigFloat` facade.
//!
//! A thin adapter over the arbitrary-precision backend (here: [`rug`]'s
//! MPFR-backed `Float`), fixing the default precision and rounding mode
//! used by every shadow operation, and owning a small pool of scratch
//! values so hot paths (the interpreter, the stage monitor, the reporter)
//! never allocate a fresh backend value per call.
//!
//! Per the spec's Open Question on `reldiff` semantics, this facade
//! defines [`BigFloat::relative_difference`] explicitly as
//! `|x - y| / max(|x|, |y|)`, zero when both operands are zero, rather
//! than inheriting whatever the backend happens to do.

use rug::Float;
use std::cmp::Ordering;

/// Default precision in bits, matching the spec's default (§6).
pub const DEFAULT_PRECISION: u32 = 120;

/// A high-precision shadow value.
///
/// Cheap to clone (an owned `rug::Float` copy) — [`crate::store::ShadowStore::upsert`]
/// relies on this to satisfy the "upsert always copies, never aliases"
/// contract of §4.2.
#[derive(Clone, Debug, PartialEq)]
pub struct BigFloat(Float);

impl BigFloat {
    /// Construct a zero at the given precision.
    pub fn zero(prec: u32) -> Self {
        BigFloat(Float::with_val(prec, 0))
    }

    /// `set-from-f32`.
    pub fn from_f32(prec: u32, value: f32) -> Self {
        BigFloat(Float::with_val(prec, value))
    }

    /// `set-from-f64`.
    pub fn from_f64(prec: u32, value: f64) -> Self {
        BigFloat(Float::with_val(prec, value))
    }

    /// `set-from-int`.
    pub fn from_i64(prec: u32, value: i64) -> Self {
        BigFloat(Float::with_val(prec, value))
    }

    /// The precision this value was constructed with.
    pub fn precision(&self) -> u32 {
        self.0.prec()
    }

    /// `add`.
    pub fn add(&self, other: &BigFloat) -> BigFloat {
        BigFloat(Float::with_val(self.0.prec(), &self.0 + &other.0))
    }

    /// `sub`.
    pub fn sub(&self, other: &BigFloat) -> BigFloat {
        BigFloat(Float::with_val(self.0.prec(), &self.0 - &other.0))
    }

    /// `mul`.
    pub fn mul(&self, other: &BigFloat) -> BigFloat {
        BigFloat(Float::with_val(self.0.prec(), &self.0 * &other.0))
    }

    /// `div`.
    pub fn div(&self, other: &BigFloat) -> BigFloat {
        BigFloat(Float::with_val(self.0.prec(), &self.0 / &other.0))
    }

    /// `sqrt`.
    pub fn sqrt(&self) -> BigFloat {
        let mut v = self.0.clone();
        v.sqrt_mut();
        BigFloat(v)
    }

    /// `neg`.
    pub fn neg(&self) -> BigFloat {
        BigFloat(-self.0.clone())
    }

    /// `abs`.
    pub fn abs(&self) -> BigFloat {
        let mut v = self.0.clone();
        v.abs_mut();
        BigFloat(v)
    }

    /// `min`.
    pub fn min(&self, other: &BigFloat) -> BigFloat {
        if self.0 <= other.0 {
            self.clone()
        } else {
            other.clone()
        }
    }

    /// `max`.
    pub fn max(&self, other: &BigFloat) -> BigFloat {
        if self.0 >= other.0 {
            self.clone()
        } else {
            other.clone()
        }
    }

    /// `relative-difference`: `|x - y| / max(|x|, |y|)`, zero when both
    /// operands are zero. See the module docs for why this deviates from
    /// "whatever the backend does".
    pub fn relative_difference(&self, other: &BigFloat) -> BigFloat {
        if self.0.is_zero() && other.0.is_zero() {
            return BigFloat::zero(self.0.prec());
        }
        let diff = self.sub(other).abs();
        let denom = self.abs().max(&other.abs());
        diff.div(&denom)
    }

    /// `compare`.
    pub fn compare(&self, other: &BigFloat) -> Option<Ordering> {
        self.0.partial_cmp(&other.0)
    }

    /// `sign`: -1, 0, or 1, relative to zero. Returns `None` for NaN.
    pub fn sign(&self) -> Option<i32> {
        self.0.cmp0().ok().map(|ord| ord as i32)
    }

    /// `is-regular`: not NaN, not infinite, and not zero (mirrors
    /// `mpfr_regular_p`).
    pub fn is_regular(&self) -> bool {
        !self.0.is_nan() && !self.0.is_infinite() && !self.0.is_zero()
    }

    /// `is-number`: not NaN and not infinite (mirrors `mpfr_number_p`;
    /// zero counts as a number).
    pub fn is_number(&self) -> bool {
        !self.0.is_nan() && !self.0.is_infinite()
    }

    /// Whether this value is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Whether this value is NaN.
    pub fn is_nan(&self) -> bool {
        self.0.is_nan()
    }

    /// Whether this value is +/- infinity.
    pub fn is_infinite(&self) -> bool {
        self.0.is_infinite()
    }

    /// `exponent`: the binary exponent, or `0` for non-regular values
    /// (zero/NaN/infinity), matching `getCanceledBits`'s early-out for
    /// those cases in the original tool.
    pub fn exponent(&self) -> i64 {
        self.0.get_exp().map(i64::from).unwrap_or(0)
    }

    /// `minimum-required-precision`: the smallest precision at which this
    /// value round-trips exactly. Not on any hot path — used only by the
    /// reporter when deciding how many decimal digits to print.
    pub fn minimum_required_precision(&self) -> u32 {
        if !self.is_number() || self.is_zero() {
            return 1;
        }
        let mut lo = 2u32;
        let mut hi = self.0.prec();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let roundtrip = Float::with_val(mid, &self.0);
            if roundtrip == self.0 {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    /// `format-to-decimal`.
    pub fn format_to_decimal(&self, digits: usize) -> String {
        self.0.to_string_radix(10, Some(digits.max(1)))
    }

    /// Re-round an already-computed value to a different precision,
    /// mirroring `mpfr_set_prec` on a result before the next operation
    /// writes into it (`sim-original`'s forced 24/53-bit collapse).
    pub fn rounded_to(&self, prec: u32) -> BigFloat {
        BigFloat(Float::with_val(prec, &self.0))
    }

    /// Round this high-precision value down to `f32`.
    pub fn to_f32(&self) -> f32 {
        self.0.to_f32()
    }

    /// Round this high-precision value down to `f64`.
    pub fn to_f64(&self) -> f64 {
        self.0.to_f64()
    }
}

/// A small pool of scratch [`BigFloat`]s, reused across calls to avoid
/// per-operation allocation on hot paths. Mirrors the original tool's
/// static `mpfr_t` scratch globals (`meanOrg`, `stageOrg`, `cancelTemp`,
/// ...), but scoped to whichever component checks them out.
#[derive(Debug)]
pub struct BigFloatPool {
    precision: u32,
    free: Vec<BigFloat>,
}

impl BigFloatPool {
    /// Create a pool fixed at the given default precision.
    pub fn new(precision: u32) -> Self {
        BigFloatPool {
            precision,
            free: Vec::new(),
        }
    }

    /// The pool's fixed default precision.
    pub fn precision(&self) -> u32 {
        self.precision
    }

    /// Check out a scratch value, reusing a freed one if available.
    pub fn checkout(&mut self) -> BigFloat {
        self.free
            .pop()
            .unwrap_or_else(|| BigFloat::zero(self.precision))
    }

    /// Return a scratch value to the pool for reuse.
    pub fn release(&mut self, value: BigFloat) {
        self.free.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reldiff_zero_both_sides() {
        let a = BigFloat::zero(DEFAULT_PRECISION);
        let b = BigFloat::zero(DEFAULT_PRECISION);
        assert!(a.relative_difference(&b).is_zero());
    }

    #[test]
    fn reldiff_matches_definition() {
        let a = BigFloat::from_f64(DEFAULT_PRECISION, 1.0);
        let b = BigFloat::from_f64(DEFAULT_PRECISION, 1.5);
        let rel = a.relative_difference(&b);
        // |1.0 - 1.5| / max(1.0, 1.5) == 1/3
        let expected = BigFloat::from_f64(DEFAULT_PRECISION, 1.0 / 3.0);
        let diff = rel.sub(&expected).abs();
        assert!(diff.to_f64() < 1e-10);
    }

    #[test]
    fn cancellation_exponent_tracking() {
        let a = BigFloat::from_f32(DEFAULT_PRECISION, 1.5);
        let b = BigFloat::from_f32(DEFAULT_PRECISION, 1.5 + 6e-8);
        let d = b.sub(&a);
        // The result should be much smaller in magnitude than either
        // operand: exponent(d) << max(exponent(a), exponent(b)).
        assert!(d.exponent() < a.exponent());
    }

    #[test]
    fn is_regular_excludes_zero_nan_inf() {
        let zero = BigFloat::zero(DEFAULT_PRECISION);
        assert!(!zero.is_regular());
        assert!(zero.is_number());

        let one = BigFloat::from_f64(DEFAULT_PRECISION, 1.0);
        assert!(one.is_regular());
    }

    #[test]
    fn pool_reuses_released_values() {
        let mut pool = BigFloatPool::new(DEFAULT_PRECISION);
        let a = pool.checkout();
        pool.release(a);
        let b = pool.checkout();
        assert_eq!(b.precision(), DEFAULT_PRECISION);
        assert_eq!(pool.free.len(), 0);
    }

    #[test]
    fn rounded_to_collapses_precision() {
        let v = BigFloat::from_f64(DEFAULT_PRECISION, 1.0 / 3.0);
        let rounded = v.rounded_to(24);
        assert_eq!(rounded.precision(), 24);
        assert!(rounded.sub(&v).abs().to_f64() > 0.0);
    }

    #[test]
    fn minimum_required_precision_for_small_integer() {
        let v = BigFloat::from_i64(DEFAULT_PRECISION, 4);
        // 4 == 2^2 needs only 1 significant bit of mantissa.
        assert!(v.minimum_required_precision() <= 2);
    }
}
