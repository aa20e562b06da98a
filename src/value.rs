//! The shadow value: the unit of shadowing (§3).

use crate::bigfloat::BigFloat;

/// The untainted machine value a [`ShadowValue`] mirrors, tagged by width.
///
/// `Invalid` corresponds to a shadow whose original location has not (or
/// no longer) carried a known-width float — see invariant I5 and the
/// "invariant breach" error kind in §7 (a store tagged active with
/// neither f32 nor f64 width).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OrigValue {
    /// A 32-bit original value.
    F32(f32),
    /// A 64-bit original value.
    F64(f64),
    /// No known-width original value.
    Invalid,
}

impl OrigValue {
    /// Whether this holds a known-width value.
    pub fn is_valid(&self) -> bool {
        !matches!(self, OrigValue::Invalid)
    }

    /// Promote the original machine value into a [`BigFloat`] at the
    /// given precision (f32 -> 24-bit mantissa, f64 -> 53-bit, per §4.3
    /// step 1).
    pub fn promote(&self, precision: u32) -> BigFloat {
        match self {
            OrigValue::F32(v) => BigFloat::from_f32(precision, *v),
            OrigValue::F64(v) => BigFloat::from_f64(precision, *v),
            OrigValue::Invalid => BigFloat::zero(precision),
        }
    }
}

/// A higher-precision mirror of a machine floating-point value, maintained
/// alongside execution.
///
/// Field-for-field mapping to §3's `ShadowValue`:
/// - `key` is carried by the *container* (the map key in
///   [`crate::store::ShadowStore`]), not duplicated here, since Rust maps
///   already own their keys.
/// - `value` -> [`ShadowValue::value`]
/// - `origType`/`orig` -> [`ShadowValue::orig`] (one tagged enum instead
///   of two C fields)
/// - `opCount` -> [`ShadowValue::op_count`]
/// - `origin` -> [`ShadowValue::origin`]
/// - `canceled`/`cancelOrigin` -> [`ShadowValue::canceled`]/[`ShadowValue::cancel_origin`]
/// - `active` -> [`ShadowValue::active`]
/// - `version` -> [`ShadowValue::version`] (temp slots only)
#[derive(Clone, Debug, PartialEq)]
pub struct ShadowValue {
    /// The mirrored high-precision arithmetic result.
    pub value: BigFloat,
    /// The untainted machine value, tagged by width.
    pub orig: OrigValue,
    /// Length, in original-program operations, of the longest dataflow
    /// path feeding this value. Invariant I3: `>= 1` once an arithmetic
    /// op has produced the value.
    pub op_count: u64,
    /// Instruction address of the last operation that produced this
    /// value.
    pub origin: u64,
    /// Maximum number of bits lost to catastrophic cancellation on any
    /// path into this value. Invariant I4: `>= 0`.
    pub canceled: i64,
    /// Instruction address where the worst cancellation occurred.
    pub cancel_origin: u64,
    /// Whether the slot is logically populated. For memory/register
    /// slots, `false` means the original location has been overwritten by
    /// something non-floating or unshadowed (invariant I2). For temp
    /// slots, liveness is instead governed by `version` (invariant I1);
    /// `active` is still tracked for temps for uniform `Display`/report
    /// handling but is not authoritative there.
    pub active: bool,
    /// Generation counter, meaningful for temp slots only: the slot is
    /// live iff this equals the superblock-execution counter at the time
    /// of the read (invariant I1).
    pub version: u64,
}

impl ShadowValue {
    /// Construct a fresh shadow value with no recorded provenance
    /// (`op_count = 0`, `origin = 0`), as used when promoting a bare
    /// machine-value snapshot with no backing shadow (§4.3 step 1).
    pub fn from_promoted(value: BigFloat, orig: OrigValue) -> Self {
        ShadowValue {
            value,
            orig,
            op_count: 0,
            origin: 0,
            canceled: 0,
            cancel_origin: 0,
            active: true,
            version: 0,
        }
    }

    /// Copy another shadow's high-precision payload into this one in
    /// place, as `ShadowStore::upsert`'s "copies src's high-precision
    /// payload into the target; resets active=true" contract requires
    /// (§4.2) — never aliasing, always copying.
    pub fn copy_from(&mut self, src: &ShadowValue) {
        self.value = src.value.clone();
        self.orig = src.orig;
        self.op_count = src.op_count;
        self.origin = src.origin;
        self.canceled = src.canceled;
        self.cancel_origin = src.cancel_origin;
        self.active = true;
    }

    /// Mark this slot logically empty without freeing it (§3's "the only
    /// form of in-place delete"). `active` stops mattering for temp slots
    /// once their `version` is stale, but this is still used to disable
    /// memory/register shadows on a non-shadow write.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// The absolute error against the machine value, computed at the
    /// value's own precision.
    pub fn absolute_error(&self) -> BigFloat {
        let prec = self.value.precision();
        let orig = self.orig.promote(prec);
        self.value.sub(&orig).abs()
    }

    /// The relative error against the machine value (§4.3 step 7):
    /// `|reldiff(shadow, orig)|`, zero when both sides are zero.
    pub fn relative_error(&self) -> BigFloat {
        let prec = self.value.precision();
        let orig = self.orig.promote(prec);
        self.value.relative_difference(&orig).abs()
    }
}
