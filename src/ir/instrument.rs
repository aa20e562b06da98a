//! The IR instrumenter (§4.4): backward importance pass, forward alias
//! pass, and emission. Since the real dirty-call-inserting translator is
//! out of scope, "emission" here produces an [`InstrumentedSuperblock`]
//! that *is* the executable instrumented program: walking it plays the
//! same role a real host's emitted callbacks would at run time.

use hashbrown::{HashMap, HashSet};

use crate::engine::Engine;
use crate::error::EngineResult;
use crate::interpreter::{ArgSlot, OpCode};
use crate::ir::testkit::MachineState;
use crate::ir::{Arg, Const, Expr, Stmt, Superblock, Width};
use crate::value::OrigValue;

/// Performs the two static passes over a [`Superblock`] and returns an
/// executable, instrumented form of it.
pub struct Instrumenter;

impl Instrumenter {
    /// Run both passes and produce the instrumented superblock.
    pub fn run(sb: &Superblock) -> InstrumentedSuperblock {
        let important = backward_importance_pass(sb);
        let aliases = forward_alias_pass(sb);
        InstrumentedSuperblock {
            stmts: sb.stmts.clone(),
            important,
            aliases,
        }
    }
}

fn mark_arg_important(arg: Arg, important: &mut HashSet<usize>) {
    if let Arg::Tmp(t) = arg {
        important.insert(t);
    }
}

/// "Marks every temporary that feeds a store/put or a supported fp op as
/// important" (§2 item 6, §4.4).
fn backward_importance_pass(sb: &Superblock) -> HashSet<usize> {
    let mut important = HashSet::new();

    // Seed directly from statements with an externally observable effect,
    // and from every fp-op's arguments (the op always runs, so its
    // argument shadows are never optimized away).
    for stmt in &sb.stmts {
        match stmt {
            Stmt::Store { addr, value } => {
                mark_arg_important(*addr, &mut important);
                mark_arg_important(*value, &mut important);
            }
            Stmt::PutReg { value, .. } => mark_arg_important(*value, &mut important),
            Stmt::PutIndexed { value, .. } => mark_arg_important(*value, &mut important),
            Stmt::WriteTemp { expr, .. } => mark_fp_op_args_important(expr, &mut important),
            Stmt::Mark(_) | Stmt::Exit | Stmt::Hint(_) => {}
        }
    }

    // Propagate backward: if a WriteTemp's destination is important, its
    // feeding arguments are important too.
    let mut changed = true;
    while changed {
        changed = false;
        for stmt in sb.stmts.iter().rev() {
            if let Stmt::WriteTemp { tmp, expr, .. } = stmt {
                if important.contains(tmp) {
                    let before = important.len();
                    mark_value_expr_important(expr, &mut important);
                    if important.len() != before {
                        changed = true;
                    }
                }
            }
        }
    }

    important
}

/// Seeds importance from a fp-op's arguments only: the op always runs at
/// machine execution time, so its argument shadows are never optimized
/// away regardless of whether the op's own result is later consumed.
/// Plain forwarding expressions (copies, loads, aliases, gets, `ite`)
/// seed nothing here — they're only important if something downstream
/// of *their* destination already is, which the propagation pass below
/// discovers.
fn mark_fp_op_args_important(expr: &Expr, important: &mut HashSet<usize>) {
    match expr {
        Expr::UnOp { arg, .. } => mark_arg_important(*arg, important),
        Expr::BinOp { a, b, .. } => {
            mark_arg_important(*a, important);
            mark_arg_important(*b, important);
        }
        Expr::TriOp { a, b, c, .. } => {
            mark_arg_important(*a, important);
            mark_arg_important(*b, important);
            mark_arg_important(*c, important);
        }
        Expr::Arg(_)
        | Expr::Load(_)
        | Expr::GetIndexed { .. }
        | Expr::Alias { .. }
        | Expr::Ite { .. } => {}
    }
}

/// Marks every temp read by `expr`, regardless of expression kind. Used
/// only for backward propagation once a destination temp is already
/// known to be important.
fn mark_value_expr_important(expr: &Expr, important: &mut HashSet<usize>) {
    match expr {
        Expr::Arg(a) | Expr::Load(a) => mark_arg_important(*a, important),
        Expr::GetIndexed { ix_tmp, .. } => {
            important.insert(*ix_tmp);
        }
        Expr::Alias { source } => {
            important.insert(*source);
        }
        Expr::UnOp { arg, .. } => mark_arg_important(*arg, important),
        Expr::BinOp { a, b, .. } => {
            mark_arg_important(*a, important);
            mark_arg_important(*b, important);
        }
        Expr::TriOp { a, b, c, .. } => {
            mark_arg_important(*a, important);
            mark_arg_important(*b, important);
            mark_arg_important(*c, important);
        }
        Expr::Ite {
            cond_tmp,
            then_arg,
            else_arg,
        } => {
            important.insert(*cond_tmp);
            mark_arg_important(*then_arg, important);
            mark_arg_important(*else_arg, important);
        }
    }
}

/// Resolves each alias-chain temp to its ultimate real source (§4.4's
/// forward alias pass). Register write-then-read chains are *not*
/// resolved here: unlike temps, registers are ordinary mutable
/// architectural state and are commonly written more than once per
/// superblock, so which write last reached a given read depends on
/// program order — that tracking has to happen live during replay (see
/// `InstrumentedSuperblock::execute`'s `reg_last_write` local), not as a
/// single whole-block snapshot.
fn forward_alias_pass(sb: &Superblock) -> HashMap<usize, usize> {
    let mut aliases = HashMap::new();

    for stmt in &sb.stmts {
        if let Stmt::WriteTemp {
            tmp,
            expr: Expr::Alias { source },
            ..
        } = stmt
        {
            let resolved = aliases.get(source).copied().unwrap_or(*source);
            aliases.insert(*tmp, resolved);
        }
    }

    aliases
}

/// An executable, instrumented superblock: carries the importance/alias
/// metadata computed by [`Instrumenter::run`] and replays the original
/// statements against an [`Engine`] and a [`MachineState`].
pub struct InstrumentedSuperblock {
    stmts: Vec<Stmt>,
    important: HashSet<usize>,
    aliases: HashMap<usize, usize>,
}

impl InstrumentedSuperblock {
    fn resolve_tmp(&self, t: usize) -> usize {
        self.aliases.get(&t).copied().unwrap_or(t)
    }

    /// Resolve an argument to the shadow-store slot that actually backs
    /// it (applying alias resolution for `Tmp`, and `reg_last_write` for
    /// `Reg` — the live, position-correct map of "which temp last wrote
    /// this register, within this execution of this superblock") and the
    /// native machine-value snapshot to fall back on.
    fn resolve_arg(
        &self,
        arg: Arg,
        machine: &MachineState,
        reg_last_write: &HashMap<u32, usize>,
    ) -> (ArgSlot, OrigValue) {
        match arg {
            Arg::Const(c) => {
                let ov = const_to_orig(c);
                (ArgSlot::Const(ov), ov)
            }
            Arg::Tmp(t) => {
                let resolved = self.resolve_tmp(t);
                let snapshot = machine.get_float_temp(t);
                (
                    ArgSlot::Temp {
                        index: resolved,
                        snapshot,
                    },
                    snapshot,
                )
            }
            Arg::Reg(offset) => {
                let snapshot = machine.get_register(offset);
                if let Some(&t) = reg_last_write.get(&offset) {
                    (
                        ArgSlot::Temp {
                            index: t,
                            snapshot,
                        },
                        snapshot,
                    )
                } else {
                    (
                        ArgSlot::Register {
                            tid: machine.tid,
                            offset,
                            snapshot,
                        },
                        snapshot,
                    )
                }
            }
            Arg::Mem(addr) => {
                let snapshot = machine.get_memory(addr);
                (ArgSlot::Memory { addr, snapshot }, snapshot)
            }
        }
    }

    /// Execute every statement in order against `engine`/`machine`,
    /// playing the role of the emitted dirty calls.
    pub fn execute(&self, engine: &mut Engine, machine: &mut MachineState) -> EngineResult<()> {
        let mut current_addr = 0u64;
        // Live, position-correct "which temp last wrote this register"
        // map, rebuilt from scratch for this replay of this superblock.
        let mut reg_last_write: HashMap<u32, usize> = HashMap::new();
        for stmt in &self.stmts {
            match stmt {
                Stmt::Mark(addr) => current_addr = *addr,
                Stmt::WriteTemp { tmp, width, expr } => self.exec_write_temp(
                    engine,
                    machine,
                    current_addr,
                    *tmp,
                    *width,
                    expr,
                    &reg_last_write,
                )?,
                Stmt::PutReg {
                    offset,
                    width,
                    value,
                } => {
                    self.exec_put_reg(
                        engine,
                        machine,
                        current_addr,
                        *offset,
                        *width,
                        *value,
                        &reg_last_write,
                    )?;
                    match value {
                        Arg::Tmp(t) => {
                            reg_last_write.insert(*offset, self.resolve_tmp(*t));
                        }
                        _ => {
                            reg_last_write.remove(offset);
                        }
                    }
                }
                Stmt::PutIndexed {
                    base,
                    ix_tmp,
                    bias,
                    n_elems,
                    value,
                } => {
                    let offset = self.exec_put_indexed(
                        engine,
                        machine,
                        current_addr,
                        *base,
                        *ix_tmp,
                        *bias,
                        *n_elems,
                        *value,
                        &reg_last_write,
                    )?;
                    match value {
                        Arg::Tmp(t) => {
                            reg_last_write.insert(offset, self.resolve_tmp(*t));
                        }
                        _ => {
                            reg_last_write.remove(&offset);
                        }
                    }
                }
                Stmt::Store { addr, value } => self.exec_store(
                    engine,
                    machine,
                    current_addr,
                    *addr,
                    *value,
                    &reg_last_write,
                )?,
                Stmt::Exit | Stmt::Hint(_) => {}
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn eval_value(
        &self,
        engine: &mut Engine,
        machine: &mut MachineState,
        addr: u64,
        write_tmp: usize,
        expr: &Expr,
        important: bool,
        reg_last_write: &HashMap<u32, usize>,
    ) -> EngineResult<OrigValue> {
        match expr {
            Expr::Arg(a) => {
                let (slot, native) = self.resolve_arg(*a, machine, reg_last_write);
                if important {
                    self.copy_shadow_into_temp(engine, &slot, write_tmp);
                }
                Ok(native)
            }
            Expr::Load(a) => {
                let (slot, native) = self.resolve_arg(*a, machine, reg_last_write);
                // Loads always propagate shadow when present and active
                // (§4.4: "if present and active, copies it into the
                // write-temp's shadow").
                self.copy_shadow_into_temp(engine, &slot, write_tmp);
                Ok(native)
            }
            Expr::GetIndexed {
                base,
                ix_tmp,
                bias,
                n_elems,
            } => {
                let ix = machine.get_int_temp(*ix_tmp);
                let offset =
                    crate::store::ShadowStore::circular_offset(*base, ix, *bias, *n_elems);
                let native = machine.get_register(offset);
                let slot = ArgSlot::Register {
                    tid: machine.tid,
                    offset,
                    snapshot: native,
                };
                self.copy_shadow_into_temp(engine, &slot, write_tmp);
                Ok(native)
            }
            Expr::Alias { source } => Ok(machine.get_float_temp(*source)),
            Expr::UnOp { op, arg } => {
                let (slot, native) = self.resolve_arg(*arg, machine, reg_last_write);
                let result = native_unop(*op, native);
                engine
                    .interpreter()
                    .un_op(addr, *op, write_tmp, slot, result)?;
                Ok(result)
            }
            Expr::BinOp { op, a, b } => {
                let (slot_a, native_a) = self.resolve_arg(*a, machine, reg_last_write);
                let (slot_b, native_b) = self.resolve_arg(*b, machine, reg_last_write);
                let result = native_binop(*op, native_a, native_b);
                engine
                    .interpreter()
                    .bin_op(addr, *op, write_tmp, slot_a, slot_b, result)?;
                Ok(result)
            }
            Expr::TriOp { op, a, b, c } => {
                let (slot_a, _) = self.resolve_arg(*a, machine, reg_last_write);
                let (slot_b, native_b) = self.resolve_arg(*b, machine, reg_last_write);
                let (slot_c, native_c) = self.resolve_arg(*c, machine, reg_last_write);
                let result = native_triop(*op, native_b, native_c);
                engine
                    .interpreter()
                    .tri_op(addr, *op, write_tmp, slot_a, slot_b, slot_c, result)?;
                Ok(result)
            }
            Expr::Ite {
                cond_tmp,
                then_arg,
                else_arg,
            } => {
                let cond = machine.get_int_temp(*cond_tmp) != 0;
                let chosen = if cond { *then_arg } else { *else_arg };
                let (slot, native) = self.resolve_arg(chosen, machine, reg_last_write);
                self.copy_shadow_into_temp(engine, &slot, write_tmp);
                Ok(native)
            }
        }
    }

    fn copy_shadow_into_temp(&self, engine: &mut Engine, source: &ArgSlot, dest_tmp: usize) {
        let generation = engine.generation();
        let shadow = match source {
            ArgSlot::Const(_) => None,
            ArgSlot::Temp { index, .. } => {
                engine.store().temp_get(*index, generation).cloned()
            }
            ArgSlot::Register { tid, offset, .. } => {
                engine.store().register_get(*tid, *offset).cloned()
            }
            ArgSlot::Memory { addr, .. } => engine.store().memory_get(*addr).cloned(),
        };
        if let Some(shadow) = shadow {
            let _ = engine.store_mut().temp_set(dest_tmp, generation, shadow);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_write_temp(
        &self,
        engine: &mut Engine,
        machine: &mut MachineState,
        addr: u64,
        tmp: usize,
        _width: Width,
        expr: &Expr,
        reg_last_write: &HashMap<u32, usize>,
    ) -> EngineResult<()> {
        let important = self.important.contains(&tmp);
        let native = self.eval_value(engine, machine, addr, tmp, expr, important, reg_last_write)?;
        machine.set_float_temp(tmp, native);
        Ok(())
    }

    /// Shadow + native value for an `Arg` already computed elsewhere
    /// (e.g. as the source of a put/store), used by the always-observable
    /// sinks which never run arithmetic themselves (§4.4: arithmetic
    /// always lands in a temp via `WriteTemp` first).
    fn shadow_for_arg(
        &self,
        engine: &Engine,
        arg: Arg,
        machine: &MachineState,
        reg_last_write: &HashMap<u32, usize>,
    ) -> Option<crate::value::ShadowValue> {
        let (slot, _) = self.resolve_arg(arg, machine, reg_last_write);
        let generation = engine.generation();
        match slot {
            ArgSlot::Const(_) => None,
            ArgSlot::Temp { index, .. } => engine.store().temp_get(index, generation).cloned(),
            ArgSlot::Register { tid, offset, .. } => {
                engine.store().register_get(tid, offset).cloned()
            }
            ArgSlot::Memory { addr, .. } => engine.store().memory_get(addr).cloned(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_put_reg(
        &self,
        engine: &mut Engine,
        machine: &mut MachineState,
        _addr: u64,
        offset: u32,
        _width: Width,
        value: Arg,
        reg_last_write: &HashMap<u32, usize>,
    ) -> EngineResult<()> {
        let (_, native) = self.resolve_arg(value, machine, reg_last_write);
        machine.set_register(offset, native);
        match self.shadow_for_arg(engine, value, machine, reg_last_write) {
            Some(shadow) => {
                engine.store_mut().register_upsert(machine.tid, offset, &shadow);
            }
            None => engine.store_mut().register_deactivate(machine.tid, offset),
        }
        Ok(())
    }

    /// Resolves the indexed register's circular offset, performs the put,
    /// and hands the offset back to the caller so it can update the live
    /// `reg_last_write` map.
    #[allow(clippy::too_many_arguments)]
    fn exec_put_indexed(
        &self,
        engine: &mut Engine,
        machine: &mut MachineState,
        addr: u64,
        base: u32,
        ix_tmp: usize,
        bias: i64,
        n_elems: u32,
        value: Arg,
        reg_last_write: &HashMap<u32, usize>,
    ) -> EngineResult<u32> {
        let ix = machine.get_int_temp(ix_tmp);
        let offset = crate::store::ShadowStore::circular_offset(base, ix, bias, n_elems);
        self.exec_put_reg(engine, machine, addr, offset, Width::W64, value, reg_last_write)?;
        Ok(offset)
    }

    fn exec_store(
        &self,
        engine: &mut Engine,
        machine: &mut MachineState,
        _addr: u64,
        target: Arg,
        value: Arg,
        reg_last_write: &HashMap<u32, usize>,
    ) -> EngineResult<()> {
        let (target_slot, _) = self.resolve_arg(target, machine, reg_last_write);
        let mem_addr = match target_slot {
            ArgSlot::Memory { addr, .. } => addr,
            ArgSlot::Temp { snapshot, .. } | ArgSlot::Register { snapshot, .. } => {
                // A dynamic address: the native value of the addressing
                // temp/register, reinterpreted as an integer address.
                match snapshot {
                    OrigValue::F64(v) => v.to_bits(),
                    OrigValue::F32(v) => u64::from(v.to_bits()),
                    OrigValue::Invalid => 0,
                }
            }
            ArgSlot::Const(_) => 0,
        };
        let (_, native) = self.resolve_arg(value, machine, reg_last_write);
        machine.set_memory(mem_addr, native);

        match self.shadow_for_arg(engine, value, machine, reg_last_write) {
            Some(shadow) => {
                engine.store_mut().memory_upsert(mem_addr, &shadow);
            }
            None => engine.store_mut().memory_deactivate(mem_addr),
        }

        if let Some(shadow) = engine.store().memory_get(mem_addr).cloned() {
            let rel_error = shadow.relative_error();
            for n in 0..engine.stages().len() {
                let is_active = engine
                    .stages()
                    .get(n)
                    .map(|s| s.is_active())
                    .unwrap_or(false);
                if is_active {
                    engine
                        .stages_mut()
                        .update_stage(n, mem_addr, shadow.value.clone(), rel_error.clone())?;
                }
            }
        }
        Ok(())
    }
}

fn const_to_orig(c: Const) -> OrigValue {
    match c {
        Const::F32(v) => OrigValue::F32(v),
        Const::F64(v) => OrigValue::F64(v),
    }
}

fn as_f32(v: OrigValue) -> f32 {
    match v {
        OrigValue::F32(v) => v,
        OrigValue::F64(v) => v as f32,
        OrigValue::Invalid => f32::NAN,
    }
}

fn as_f64(v: OrigValue) -> f64 {
    match v {
        OrigValue::F64(v) => v,
        OrigValue::F32(v) => f64::from(v),
        OrigValue::Invalid => f64::NAN,
    }
}

fn native_unop(op: OpCode, a: OrigValue) -> OrigValue {
    use OpCode::*;
    match op {
        NegF32 => OrigValue::F32(-as_f32(a)),
        NegF64 => OrigValue::F64(-as_f64(a)),
        AbsF32 => OrigValue::F32(as_f32(a).abs()),
        AbsF64 => OrigValue::F64(as_f64(a).abs()),
        SqrtF32 => OrigValue::F32(as_f32(a).sqrt()),
        SqrtF64 => OrigValue::F64(as_f64(a).sqrt()),
        _ => OrigValue::Invalid,
    }
}

fn native_binop(op: OpCode, a: OrigValue, b: OrigValue) -> OrigValue {
    use OpCode::*;
    match op {
        AddF32 => OrigValue::F32(as_f32(a) + as_f32(b)),
        AddF64 => OrigValue::F64(as_f64(a) + as_f64(b)),
        SubF32 => OrigValue::F32(as_f32(a) - as_f32(b)),
        SubF64 => OrigValue::F64(as_f64(a) - as_f64(b)),
        MulF32 => OrigValue::F32(as_f32(a) * as_f32(b)),
        MulF64 => OrigValue::F64(as_f64(a) * as_f64(b)),
        DivF32 => OrigValue::F32(as_f32(a) / as_f32(b)),
        DivF64 => OrigValue::F64(as_f64(a) / as_f64(b)),
        MinF32 => OrigValue::F32(as_f32(a).min(as_f32(b))),
        MinF64 => OrigValue::F64(as_f64(a).min(as_f64(b))),
        MaxF32 => OrigValue::F32(as_f32(a).max(as_f32(b))),
        MaxF64 => OrigValue::F64(as_f64(a).max(as_f64(b))),
        _ => OrigValue::Invalid,
    }
}

fn native_triop(op: OpCode, b: OrigValue, c: OrigValue) -> OrigValue {
    use OpCode::*;
    match op {
        TriAddF64 => OrigValue::F64(as_f64(b) + as_f64(c)),
        TriSubF64 => OrigValue::F64(as_f64(b) - as_f64(c)),
        TriMulF64 => OrigValue::F64(as_f64(b) * as_f64(c)),
        TriDivF64 => OrigValue::F64(as_f64(b) / as_f64(c)),
        _ => OrigValue::Invalid,
    }
}
