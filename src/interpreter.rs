//! The operation interpreter (§4.3): given a decoded opcode and argument
//! slots, produces a shadow value, updates cancellation bookkeeping, and
//! invokes the aggregator.
//!
//! Grounded on `fd_main.c`'s `processUnOp`/`processBinOp`/`processTriOp`
//! and `getCanceledBits`, and on the teacher's `strum`-derived opcode
//! enums for the supported-operation tag.

use hashbrown::HashSet;
use strum::{Display, EnumString, IntoStaticStr};

use crate::aggregate::Aggregator;
use crate::bigfloat::{BigFloat, BigFloatPool};
use crate::engine::ThreadId;
use crate::error::EngineResult;
use crate::store::ShadowStore;
use crate::value::{OrigValue, ShadowValue};

/// Supported floating-point opcodes, plus an `Unsupported` catch-all
/// carrying the host's raw opcode id (§1: "analyzing unsupported
/// operations ... they are only recorded as 'unsupported' and pass
/// through without shadow effect").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum OpCode {
    /// f32 negate
    NegF32,
    /// f64 negate
    NegF64,
    /// f32 absolute value
    AbsF32,
    /// f64 absolute value
    AbsF64,
    /// f32 square root
    SqrtF32,
    /// f64 square root
    SqrtF64,
    /// f32 add
    AddF32,
    /// f64 add
    AddF64,
    /// f32 subtract
    SubF32,
    /// f64 subtract
    SubF64,
    /// f32 multiply
    MulF32,
    /// f64 multiply
    MulF64,
    /// f32 divide
    DivF32,
    /// f64 divide
    DivF64,
    /// f32 minimum
    MinF32,
    /// f64 minimum
    MinF64,
    /// f32 maximum
    MaxF32,
    /// f64 maximum
    MaxF64,
    /// ternary f64 add (first operand is a rounding-mode flag, ignored)
    TriAddF64,
    /// ternary f64 subtract (first operand ignored)
    TriSubF64,
    /// ternary f64 multiply (first operand ignored)
    TriMulF64,
    /// ternary f64 divide (first operand ignored)
    TriDivF64,
    /// An opcode this interpreter does not understand. The host's raw id
    /// is recorded separately in the unsupported-opcode set (keyed by the
    /// host-supplied name), not carried on this variant.
    Unsupported,
}

impl OpCode {
    /// Whether this is a 32- or 64-bit operation. `Unsupported` has no
    /// meaningful width.
    pub fn width_bits(self) -> Option<u32> {
        use OpCode::*;
        match self {
            NegF32 | AbsF32 | SqrtF32 | AddF32 | SubF32 | MulF32 | DivF32 | MinF32 | MaxF32 => {
                Some(23)
            }
            NegF64 | AbsF64 | SqrtF64 | AddF64 | SubF64 | MulF64 | DivF64 | MinF64 | MaxF64
            | TriAddF64 | TriSubF64 | TriMulF64 | TriDivF64 => Some(52),
            Unsupported => None,
        }
    }

    /// The IEEE width a result rounds to under `sim-original` (24 for
    /// f32, 53 for f64/ternary ops), matching `fd_main.c`'s
    /// `mpfr_set_prec(res->value, 24 | 53)` before dispatch.
    pub fn shadow_precision_bits(self) -> Option<u32> {
        use OpCode::*;
        match self {
            NegF32 | AbsF32 | SqrtF32 | AddF32 | SubF32 | MulF32 | DivF32 | MinF32 | MaxF32 => {
                Some(24)
            }
            NegF64 | AbsF64 | SqrtF64 | AddF64 | SubF64 | MulF64 | DivF64 | MinF64 | MaxF64
            | TriAddF64 | TriSubF64 | TriMulF64 | TriDivF64 => Some(53),
            Unsupported => None,
        }
    }

    /// Whether this opcode's cancellation bookkeeping applies (add/sub
    /// only, per §4.3 step 5).
    pub fn is_add_or_sub(self) -> bool {
        use OpCode::*;
        matches!(self, AddF32 | AddF64 | SubF32 | SubF64 | TriAddF64 | TriSubF64)
    }
}

/// Where an operation's argument comes from, and the machine-value
/// snapshot taken for it per the ordering guarantee in §5 ("capture
/// machine-value snapshots of arguments" happens before the callback
/// fires, regardless of whether a shadow backs the argument).
#[derive(Clone, Debug)]
pub enum ArgSlot {
    /// An inline constant: `constMask` bit set for this slot (§4.3).
    Const(OrigValue),
    /// A temporary reference.
    Temp {
        /// Temp index.
        index: usize,
        /// Machine-value snapshot, used if no live shadow backs `index`.
        snapshot: OrigValue,
    },
    /// A register reference.
    Register {
        /// Owning thread.
        tid: ThreadId,
        /// Byte offset within the thread's register file.
        offset: u32,
        /// Machine-value snapshot fallback.
        snapshot: OrigValue,
    },
    /// A memory reference.
    Memory {
        /// Machine address.
        addr: u64,
        /// Machine-value snapshot fallback.
        snapshot: OrigValue,
    },
}

impl ArgSlot {
    fn snapshot(&self) -> OrigValue {
        match self {
            ArgSlot::Const(v) => *v,
            ArgSlot::Temp { snapshot, .. }
            | ArgSlot::Register { snapshot, .. }
            | ArgSlot::Memory { snapshot, .. } => *snapshot,
        }
    }
}

struct Resolved {
    value: BigFloat,
    op_count: u64,
    origin: u64,
    canceled: i64,
    cancel_origin: u64,
    orig_promoted: BigFloat,
}

/// The operation interpreter. Borrows the engine's mutable state for the
/// duration of a single call.
pub struct Interpreter<'a> {
    store: &'a mut ShadowStore,
    aggregator: &'a mut Aggregator,
    pool: &'a mut BigFloatPool,
    unsupported: &'a mut HashSet<&'static str>,
    generation: u64,
    badness_enabled: bool,
    sim_original: bool,
    mean_error: bool,
}

impl<'a> Interpreter<'a> {
    /// Borrow the pieces needed to run one interpreter call.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &'a mut ShadowStore,
        aggregator: &'a mut Aggregator,
        pool: &'a mut BigFloatPool,
        unsupported: &'a mut HashSet<&'static str>,
        generation: u64,
        badness_enabled: bool,
        sim_original: bool,
        mean_error: bool,
    ) -> Self {
        Interpreter {
            store,
            aggregator,
            pool,
            unsupported,
            generation,
            badness_enabled,
            sim_original,
            mean_error,
        }
    }

    /// Collapse `result` to the op's original IEEE width when
    /// `sim-original=yes` is configured, reproducing the machine
    /// computation's own rounding instead of the pool's shadow precision.
    fn simulate_original(&self, op: OpCode, result: BigFloat) -> BigFloat {
        if !self.sim_original {
            return result;
        }
        match op.shadow_precision_bits() {
            Some(bits) => result.rounded_to(bits),
            None => result,
        }
    }

    fn precision(&self) -> u32 {
        self.pool.precision()
    }

    fn resolve(&self, slot: &ArgSlot) -> Resolved {
        let prec = self.precision();
        let (value, op_count, origin, canceled, cancel_origin) = match slot {
            ArgSlot::Const(orig) => (orig.promote(prec), 0, 0, 0, 0),
            ArgSlot::Temp { index, snapshot } => {
                match self.store.temp_get(*index, self.generation) {
                    Some(sv) => (
                        sv.value.clone(),
                        sv.op_count,
                        sv.origin,
                        sv.canceled,
                        sv.cancel_origin,
                    ),
                    None => (snapshot.promote(prec), 0, 0, 0, 0),
                }
            }
            ArgSlot::Register { tid, offset, snapshot } => {
                match self.store.register_get(*tid, *offset) {
                    Some(sv) => (
                        sv.value.clone(),
                        sv.op_count,
                        sv.origin,
                        sv.canceled,
                        sv.cancel_origin,
                    ),
                    None => (snapshot.promote(prec), 0, 0, 0, 0),
                }
            }
            ArgSlot::Memory { addr, snapshot } => match self.store.memory_get(*addr) {
                Some(sv) => (
                    sv.value.clone(),
                    sv.op_count,
                    sv.origin,
                    sv.canceled,
                    sv.cancel_origin,
                ),
                None => (snapshot.promote(prec), 0, 0, 0, 0),
            },
        };
        let orig_promoted = slot.snapshot().promote(prec);
        Resolved {
            value,
            op_count,
            origin,
            canceled,
            cancel_origin,
            orig_promoted,
        }
    }

    /// `exactBits` estimate of §4.3 step 6, clamped to the operation's
    /// original width (23 for f32, 52 for f64) per `fd_main.c`'s
    /// `exactBits > orgType` clamp.
    fn exact_bits(shadow: &BigFloat, orig_promoted: &BigFloat, width_bits: u32) -> u32 {
        if !shadow.is_regular() || !orig_promoted.is_regular() {
            return 0;
        }
        if shadow.exponent() != orig_promoted.exponent() {
            return 0;
        }
        let diff = shadow.sub(orig_promoted);
        if diff.is_zero() {
            // No difference at all from the machine value: `fd_main.c`
            // leaves `exactBitsArgN` at its un-overridden default (23/52)
            // in this case rather than zeroing it.
            return width_bits;
        }
        let bits = (shadow.exponent() - diff.exponent()).saturating_sub(2);
        (bits.max(0) as u32).min(width_bits)
    }

    fn dispatch_unary(op: OpCode, a: &BigFloat) -> Option<BigFloat> {
        use OpCode::*;
        match op {
            NegF32 | NegF64 => Some(a.neg()),
            AbsF32 | AbsF64 => Some(a.abs()),
            SqrtF32 | SqrtF64 => Some(a.sqrt()),
            _ => None,
        }
    }

    fn dispatch_binary(op: OpCode, a: &BigFloat, b: &BigFloat) -> Option<BigFloat> {
        use OpCode::*;
        match op {
            AddF32 | AddF64 => Some(a.add(b)),
            SubF32 | SubF64 => Some(a.sub(b)),
            MulF32 | MulF64 => Some(a.mul(b)),
            DivF32 | DivF64 => Some(a.div(b)),
            MinF32 | MinF64 => Some(a.min(b)),
            MaxF32 | MaxF64 => Some(a.max(b)),
            _ => None,
        }
    }

    fn dispatch_ternary(op: OpCode, b: &BigFloat, c: &BigFloat) -> Option<BigFloat> {
        use OpCode::*;
        match op {
            TriAddF64 => Some(b.add(c)),
            TriSubF64 => Some(b.sub(c)),
            TriMulF64 => Some(b.mul(c)),
            TriDivF64 => Some(b.div(c)),
            _ => None,
        }
    }

    fn record_unsupported(&mut self, op_name: &'static str) {
        if self.unsupported.insert(op_name) {
            tracing::debug!(op = op_name, "unsupported opcode, passing through");
        }
    }

    /// `unOp(addr, opcode, writeTmp, argSlot, constMask, origValue)`.
    pub fn un_op(
        &mut self,
        addr: u64,
        op: OpCode,
        write_tmp: usize,
        arg: ArgSlot,
        result_orig: OrigValue,
    ) -> EngineResult<Option<ShadowValue>> {
        let resolved = self.resolve(&arg);
        let Some(result) = Self::dispatch_unary(op, &resolved.value) else {
            self.record_unsupported(op.into());
            return Ok(None);
        };
        let result = self.simulate_original(op, result);

        let op_count = 1 + resolved.op_count;
        let mut shadow = ShadowValue::from_promoted(result, result_orig);
        shadow.op_count = op_count;
        shadow.origin = addr;
        shadow.canceled = resolved.canceled;
        shadow.cancel_origin = resolved.cancel_origin;

        if self.mean_error {
            let rel_error = shadow.relative_error();
            self.aggregator.record(
                addr,
                op,
                rel_error,
                shadow.canceled,
                0,
                resolved.origin,
                0,
            );
        }

        let stored = self.store.temp_set(write_tmp, self.generation, shadow)?;
        Ok(Some(stored.clone()))
    }

    /// `binOp(addr, opcode, writeTmp, arg1, arg2, constMask, origValue)`.
    #[allow(clippy::too_many_arguments)]
    pub fn bin_op(
        &mut self,
        addr: u64,
        op: OpCode,
        write_tmp: usize,
        arg1: ArgSlot,
        arg2: ArgSlot,
        result_orig: OrigValue,
    ) -> EngineResult<Option<ShadowValue>> {
        let r1 = self.resolve(&arg1);
        let r2 = self.resolve(&arg2);
        let Some(result) = Self::dispatch_binary(op, &r1.value, &r2.value) else {
            self.record_unsupported(op.into());
            return Ok(None);
        };
        let result = self.simulate_original(op, result);

        let op_count = 1 + r1.op_count.max(r2.op_count);

        let mut canceled = 0i64;
        if op.is_add_or_sub() {
            canceled = getCanceledBits(&result, &r1.value, &r2.value);
        }
        let max_arg_canceled = r1.canceled.max(r2.canceled);
        let result_canceled = canceled.max(max_arg_canceled);
        let cancel_origin = if canceled >= max_arg_canceled {
            addr
        } else if r1.canceled >= r2.canceled {
            r1.cancel_origin
        } else {
            r2.cancel_origin
        };

        let mut badness = 0u32;
        if self.badness_enabled && canceled > 0 {
            let width = op.width_bits().unwrap_or(52);
            let exact1 = Self::exact_bits(&r1.value, &r1.orig_promoted, width);
            let exact2 = Self::exact_bits(&r2.value, &r2.orig_promoted, width);
            let min_exact = exact1.min(exact2);
            badness = (canceled as u32).saturating_sub(min_exact);
        }

        let mut shadow = ShadowValue::from_promoted(result, result_orig);
        shadow.op_count = op_count;
        shadow.origin = addr;
        shadow.canceled = result_canceled;
        shadow.cancel_origin = cancel_origin;

        if self.mean_error {
            let rel_error = shadow.relative_error();
            self.aggregator.record(
                addr,
                op,
                rel_error,
                canceled,
                badness,
                r1.origin,
                r2.origin,
            );
        }

        let stored = self.store.temp_set(write_tmp, self.generation, shadow)?;
        Ok(Some(stored.clone()))
    }

    /// `triOp(addr, opcode, writeTmp, arg1, arg2, arg3, constMask, origValue)`.
    /// `arg1` is the rounding-mode operand; the spec says it's ignored
    /// since the facade fixes round-to-nearest.
    #[allow(clippy::too_many_arguments)]
    pub fn tri_op(
        &mut self,
        addr: u64,
        op: OpCode,
        write_tmp: usize,
        _arg1_rounding_mode: ArgSlot,
        arg2: ArgSlot,
        arg3: ArgSlot,
        result_orig: OrigValue,
    ) -> EngineResult<Option<ShadowValue>> {
        let r2 = self.resolve(&arg2);
        let r3 = self.resolve(&arg3);
        let Some(result) = Self::dispatch_ternary(op, &r2.value, &r3.value) else {
            self.record_unsupported(op.into());
            return Ok(None);
        };
        let result = self.simulate_original(op, result);

        let op_count = 1 + r2.op_count.max(r3.op_count);

        let mut canceled = 0i64;
        if op.is_add_or_sub() {
            canceled = getCanceledBits(&result, &r2.value, &r3.value);
        }
        let max_arg_canceled = r2.canceled.max(r3.canceled);
        let result_canceled = canceled.max(max_arg_canceled);
        let cancel_origin = if canceled >= max_arg_canceled {
            addr
        } else if r2.canceled >= r3.canceled {
            r2.cancel_origin
        } else {
            r3.cancel_origin
        };

        let mut badness = 0u32;
        if self.badness_enabled && canceled > 0 {
            let width = op.width_bits().unwrap_or(52);
            let exact2 = Self::exact_bits(&r2.value, &r2.orig_promoted, width);
            let exact3 = Self::exact_bits(&r3.value, &r3.orig_promoted, width);
            let min_exact = exact2.min(exact3);
            badness = (canceled as u32).saturating_sub(min_exact);
        }

        let mut shadow = ShadowValue::from_promoted(result, result_orig);
        shadow.op_count = op_count;
        shadow.origin = addr;
        shadow.canceled = result_canceled;
        shadow.cancel_origin = cancel_origin;

        if self.mean_error {
            let rel_error = shadow.relative_error();
            self.aggregator.record(
                addr,
                op,
                rel_error,
                canceled,
                badness,
                r2.origin,
                r3.origin,
            );
        }

        let stored = self.store.temp_set(write_tmp, self.generation, shadow)?;
        Ok(Some(stored.clone()))
    }
}

/// `max(0, max(exp(a), exp(b)) - exp(result))`, skipping non-regular
/// operands/result (invariant I5), per §4.3 step 5 and the glossary's
/// definition of cancellation.
#[allow(non_snake_case)]
fn getCanceledBits(result: &BigFloat, a: &BigFloat, b: &BigFloat) -> i64 {
    if !result.is_regular() || !a.is_regular() || !b.is_regular() {
        return 0;
    }
    let max_exp = a.exponent().max(b.exponent());
    (max_exp - result.exponent()).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bigfloat::DEFAULT_PRECISION;
    use crate::engine::ThreadId;
    use crate::store::RegisterExclusions;

    fn new_store() -> ShadowStore {
        ShadowStore::new(16, RegisterExclusions::none())
    }

    #[test]
    fn binop_produces_op_count_1_plus_max() {
        let mut store = new_store();
        let mut agg = Aggregator::new();
        let mut pool = BigFloatPool::new(DEFAULT_PRECISION);
        let mut unsupported = HashSet::new();

        {
            let mut interp =
                Interpreter::new(&mut store, &mut agg, &mut pool, &mut unsupported, 1, true, false, true);
            interp
                .un_op(
                    0x10,
                    OpCode::AbsF64,
                    0,
                    ArgSlot::Const(OrigValue::F64(-2.0)),
                    OrigValue::F64(2.0),
                )
                .unwrap();
        }

        let op_count_0 = store.temp_get(0, 1).unwrap().op_count;
        assert_eq!(op_count_0, 1);

        {
            let mut interp =
                Interpreter::new(&mut store, &mut agg, &mut pool, &mut unsupported, 1, true, false, true);
            interp
                .bin_op(
                    0x20,
                    OpCode::AddF64,
                    1,
                    ArgSlot::Temp {
                        index: 0,
                        snapshot: OrigValue::F64(2.0),
                    },
                    ArgSlot::Const(OrigValue::F64(3.0)),
                    OrigValue::F64(5.0),
                )
                .unwrap();
        }

        let r = store.temp_get(1, 1).unwrap();
        assert_eq!(r.op_count, 2, "1 + max(1, 0)");
    }

    #[test]
    fn unsupported_opcode_recorded_and_no_shadow() {
        let mut store = new_store();
        let mut agg = Aggregator::new();
        let mut pool = BigFloatPool::new(DEFAULT_PRECISION);
        let mut unsupported = HashSet::new();
        let mut interp =
            Interpreter::new(&mut store, &mut agg, &mut pool, &mut unsupported, 1, true, false, true);

        let result = interp
            .un_op(
                0x30,
                OpCode::Unsupported,
                2,
                ArgSlot::Const(OrigValue::F64(1.0)),
                OrigValue::F64(1.0),
            )
            .unwrap();
        assert!(result.is_none());
        assert!(unsupported.contains("Unsupported"));
        assert!(store.temp_get(2, 1).is_none());
    }

    #[test]
    fn catastrophic_cancellation_scenario() {
        // a = 1.5, b = a + 6e-8 (f32), d = b - a.
        let mut store = new_store();
        let mut agg = Aggregator::new();
        let mut pool = BigFloatPool::new(DEFAULT_PRECISION);
        let mut unsupported = HashSet::new();

        let a_orig = OrigValue::F32(1.5);
        {
            let mut interp =
                Interpreter::new(&mut store, &mut agg, &mut pool, &mut unsupported, 1, true, false, true);
            interp
                .bin_op(
                    0x1,
                    OpCode::AddF32,
                    0,
                    ArgSlot::Const(a_orig),
                    ArgSlot::Const(OrigValue::F32(6e-8)),
                    OrigValue::F32(1.5), // machine addition rounds away the tiny increment
                )
                .unwrap();
        }
        {
            let mut interp =
                Interpreter::new(&mut store, &mut agg, &mut pool, &mut unsupported, 1, true, false, true);
            interp
                .bin_op(
                    0x2,
                    OpCode::SubF32,
                    1,
                    ArgSlot::Temp {
                        index: 0,
                        snapshot: OrigValue::F32(1.5),
                    },
                    ArgSlot::Const(a_orig),
                    OrigValue::F32(0.0), // machine subtraction yields exactly zero
                )
                .unwrap();
        }

        let d = store.temp_get(1, 1).unwrap();
        assert!(d.canceled >= 20, "expected heavy cancellation, got {}", d.canceled);
        assert_eq!(d.cancel_origin, 0x2);
        let rel_err = d.relative_error();
        // Machine value is exactly 0 but shadow is ~6e-8: relative error is 1.
        let one = BigFloat::from_f64(DEFAULT_PRECISION, 1.0);
        assert_eq!(rel_err.compare(&one), Some(std::cmp::Ordering::Equal));
    }

    #[test]
    fn sim_original_collapses_shadow_precision() {
        let mut store = new_store();
        let mut agg = Aggregator::new();
        let mut pool = BigFloatPool::new(DEFAULT_PRECISION);
        let mut unsupported = HashSet::new();
        let mut interp =
            Interpreter::new(&mut store, &mut agg, &mut pool, &mut unsupported, 1, false, true, true);

        interp
            .bin_op(
                0x1,
                OpCode::DivF64,
                0,
                ArgSlot::Const(OrigValue::F64(1.0)),
                ArgSlot::Const(OrigValue::F64(3.0)),
                OrigValue::F64(1.0 / 3.0),
            )
            .unwrap();

        let shadow = store.temp_get(0, 1).unwrap();
        assert_eq!(shadow.value.precision(), 53, "sim-original collapses to f64 width");
    }

    #[test]
    fn mean_error_disabled_skips_aggregator() {
        let mut store = new_store();
        let mut agg = Aggregator::new();
        let mut pool = BigFloatPool::new(DEFAULT_PRECISION);
        let mut unsupported = HashSet::new();
        let mut interp =
            Interpreter::new(&mut store, &mut agg, &mut pool, &mut unsupported, 1, false, false, false);

        interp
            .un_op(
                0x50,
                OpCode::AbsF64,
                0,
                ArgSlot::Const(OrigValue::F64(-2.0)),
                OrigValue::F64(2.0),
            )
            .unwrap();

        assert!(store.temp_get(0, 1).is_some(), "shadow is still produced");
        assert!(agg.get(0x50).is_none(), "mean-error=no must skip the aggregator");
    }
}
