//! A host-agnostic IR model standing in for the out-of-scope dynamic
//! binary translator (§1, §4.4). Real hosts expose a typed SSA IR with
//! superblocks, temps, and dirty-call insertion; this module defines just
//! enough of that shape for the instrumenter and the test harness
//! (`testkit`) to exercise the engine exactly as a host would.

pub mod instrument;
pub mod testkit;

use crate::interpreter::OpCode;

/// An operand's original-program width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width {
    /// 32-bit float.
    W32,
    /// 64-bit float.
    W64,
}

/// An inline constant, tagged by width (§6: "constants (tagged by
/// width)").
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Const {
    /// A 32-bit constant.
    F32(f32),
    /// A 64-bit constant.
    F64(f64),
}

impl Const {
    /// This constant's width.
    pub fn width(self) -> Width {
        match self {
            Const::F32(_) => Width::W32,
            Const::F64(_) => Width::W64,
        }
    }
}

/// An operation argument slot (§4.3: "each being a temporary reference, a
/// register reference, a memory reference, or an inline constant").
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Arg {
    /// An inline constant.
    Const(Const),
    /// A read of a superblock temp.
    Tmp(usize),
    /// A read of a fixed-offset guest register.
    Reg(u32),
    /// A read of a fixed machine address. Real hosts compute dynamic
    /// addresses into a temp first; this variant models the already
    /// IR-resolved case.
    Mem(u64),
}

/// A value-producing expression, as attached to a [`Stmt::WriteTemp`],
/// [`Stmt::PutReg`], [`Stmt::Store`], or [`Stmt::PutIndexed`].
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// A bare argument read (covers `RdTmp`, `GetReg`-by-fixed-offset, an
    /// inline constant, or an already-resolved load address).
    Arg(Arg),
    /// A load of the address named by the given argument.
    Load(Arg),
    /// A read of a circular register file slot: `(base + (ix_tmp + bias)
    /// mod n_elems)` (§4.4, §9).
    GetIndexed {
        /// Base register offset.
        base: u32,
        /// Temp holding the dynamic index.
        ix_tmp: usize,
        /// Static bias added to the dynamic index.
        bias: i64,
        /// Number of elements in the circular file.
        n_elems: u32,
    },
    /// A value-preserving cast/narrow/widen of another temp: bit-for-bit
    /// identical to its source, so the alias pass redirects shadow reads
    /// to `source` rather than shadowing this expression independently.
    Alias {
        /// The temp this expression is bit-identical to.
        source: usize,
    },
    /// A unary supported-fp (or unsupported, tagged `OpCode::Unsupported`)
    /// operation.
    UnOp {
        /// The opcode.
        op: OpCode,
        /// The sole argument.
        arg: Arg,
    },
    /// A binary operation.
    BinOp {
        /// The opcode.
        op: OpCode,
        /// First argument.
        a: Arg,
        /// Second argument.
        b: Arg,
    },
    /// A ternary operation; `a` is the rounding-mode operand (ignored).
    TriOp {
        /// The opcode.
        op: OpCode,
        /// Rounding-mode argument (ignored by the facade).
        a: Arg,
        /// Second operand.
        b: Arg,
        /// Third operand.
        c: Arg,
    },
    /// An if-then-else: the condition is captured as a temp at emit time
    /// (§4.4), and the selected branch's shadow is copied to the result.
    Ite {
        /// Temp holding the captured boolean condition.
        cond_tmp: usize,
        /// Argument selected when the condition is true.
        then_arg: Arg,
        /// Argument selected when the condition is false.
        else_arg: Arg,
    },
}

/// One IR statement (§4.4: "mark, write-to-temp, put-to-register, store,
/// put-indexed, exit, or hint").
#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    /// Sets the "current client instruction address" used for
    /// attribution in every subsequent statement until the next mark.
    Mark(u64),
    /// Writes the given expression's value into a temp.
    WriteTemp {
        /// Destination temp.
        tmp: usize,
        /// This temp's width (for alias/cast bookkeeping).
        width: Width,
        /// The producing expression.
        expr: Expr,
    },
    /// Writes to a fixed-offset guest register. As in a real SSA IR, the
    /// value has already been computed into a temp (or is a bare
    /// constant/other register/memory read) by the time it reaches a
    /// put — arithmetic always happens via [`Stmt::WriteTemp`] first.
    PutReg {
        /// Register byte offset.
        offset: u32,
        /// Register width.
        width: Width,
        /// The value to write.
        value: Arg,
    },
    /// Writes to a circular register file slot.
    PutIndexed {
        /// Base register offset.
        base: u32,
        /// Temp holding the dynamic index.
        ix_tmp: usize,
        /// Static bias.
        bias: i64,
        /// Circular file size.
        n_elems: u32,
        /// The value to write.
        value: Arg,
    },
    /// Stores to a memory address named by the given argument.
    Store {
        /// The target address.
        addr: Arg,
        /// The value to write.
        value: Arg,
    },
    /// A superblock exit (no analysis effect; present for shape parity
    /// with a real IR).
    Exit,
    /// A non-semantic hint (e.g. a branch-prediction annotation); no
    /// analysis effect.
    Hint(&'static str),
}

/// A straight-line IR block between control-flow joins — the unit the
/// instrumenter operates on.
#[derive(Clone, Debug, Default)]
pub struct Superblock {
    /// The statements, in program order.
    pub stmts: Vec<Stmt>,
}

impl Superblock {
    /// Build an empty superblock.
    pub fn new() -> Self {
        Superblock { stmts: Vec::new() }
    }

    /// Append a statement, builder-style.
    pub fn push(mut self, stmt: Stmt) -> Self {
        self.stmts.push(stmt);
        self
    }
}
