//! The stage (iteration) monitor (§4.5).
//!
//! Grounded on the original tool's per-stage `oldVals`/`newVals`/`limits`
//! hash tables (`fd_main.c`'s `beginStage`/`endStage`/`updateStages`) and
//! on the teacher's fixed-size, index-addressed table-of-slots pattern
//! (`fuel-vm`'s register/memory arrays addressed by a small integer).

use hashbrown::HashMap;

use crate::bigfloat::BigFloat;
use crate::error::{EngineError, EngineResult};

/// Per-address worst-case-this-iteration record.
#[derive(Clone, Debug)]
pub struct StageValue {
    /// The shadow value observed.
    pub val: BigFloat,
    /// The relative error observed alongside it.
    pub rel_error: BigFloat,
}

/// A divergence report for one address within a stage.
#[derive(Clone, Debug, PartialEq)]
pub struct StageReport {
    /// Number of iterations in which this address's error grew.
    pub count: u32,
    /// First iteration (by stage `count`) in which a growth was reported.
    pub iter_min: u32,
    /// Most recent iteration in which a growth was reported.
    pub iter_max: u32,
    /// Instruction address that produced the shadow at the time of the
    /// report (copied from the memory shadow's `origin`).
    pub origin: u64,
}

/// One stage slot.
#[derive(Clone, Debug, Default)]
pub struct Stage {
    active: bool,
    count: u32,
    old_vals: Option<HashMap<u64, StageValue>>,
    new_vals: HashMap<u64, StageValue>,
    limits: HashMap<u64, BigFloat>,
    reports: HashMap<u64, StageReport>,
}

impl Stage {
    /// Whether the stage is currently between a `beginStage` and its
    /// matching `endStage`/`clearStage`.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Iterations observed so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Reports accumulated so far, keyed by address.
    pub fn reports(&self) -> impl Iterator<Item = (&u64, &StageReport)> {
        self.reports.iter()
    }
}

/// A fixed-size table of stage slots, indexed `0..N`.
#[derive(Debug)]
pub struct StageTable {
    slots: Vec<Stage>,
}

impl StageTable {
    /// Create a table with `max_stages` empty slots.
    pub fn new(max_stages: usize) -> Self {
        StageTable {
            slots: vec![Stage::default(); max_stages],
        }
    }

    fn slot(&self, n: usize) -> EngineResult<&Stage> {
        self.slots.get(n).ok_or_else(|| EngineError::StageOutOfRange {
            index: n,
            max: self.slots.len(),
        })
    }

    fn slot_mut(&mut self, n: usize) -> EngineResult<&mut Stage> {
        let max = self.slots.len();
        self.slots
            .get_mut(n)
            .ok_or(EngineError::StageOutOfRange { index: n, max })
    }

    /// Read-only access to a stage slot.
    pub fn get(&self, n: usize) -> EngineResult<&Stage> {
        self.slot(n)
    }

    /// Number of stage slots in this table.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table has no slots at all.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// `BEGIN_STAGE(n)`: allocate a fresh `newVals`, keep `oldVals` and
    /// `limits` from the prior iteration.
    pub fn begin_stage(&mut self, n: usize) -> EngineResult<()> {
        let stage = self.slot_mut(n)?;
        stage.active = true;
        stage.count += 1;
        stage.new_vals = HashMap::new();
        Ok(())
    }

    /// Route a memory store through the active stages at `addr`.
    /// `relative_error`/`val` are the shadow's current values at the
    /// store site. Keeps the maximum (by absolute relative error) per
    /// address within the iteration.
    pub fn update_stage(
        &mut self,
        n: usize,
        addr: u64,
        val: BigFloat,
        rel_error: BigFloat,
    ) -> EngineResult<()> {
        let stage = self.slot_mut(n)?;
        if !stage.active {
            return Ok(());
        }
        match stage.new_vals.get(&addr) {
            Some(existing)
                if existing
                    .rel_error
                    .compare(&rel_error)
                    .map(|o| o.is_ge())
                    .unwrap_or(true) => {}
            _ => {
                stage.new_vals.insert(addr, StageValue { val, rel_error });
            }
        }
        Ok(())
    }

    /// `END_STAGE(n)`: compare each address's new/old relative error,
    /// raise/extend a report when the delta exceeds the stored limit, and
    /// rotate `oldVals := newVals`.
    pub fn end_stage(&mut self, n: usize, origin_of: impl Fn(u64) -> u64) -> EngineResult<()> {
        let stage = self.slot_mut(n)?;
        stage.active = false;
        let current_iter = stage.count;

        if let Some(old_vals) = &stage.old_vals {
            let mut limit_updates = Vec::new();
            let mut report_updates = Vec::new();
            for (addr, new_val) in &stage.new_vals {
                let Some(old_val) = old_vals.get(addr) else {
                    continue;
                };
                let delta = old_val.rel_error.sub(&new_val.rel_error).abs();
                let limit = stage
                    .limits
                    .get(addr)
                    .cloned()
                    .unwrap_or_else(|| BigFloat::zero(delta.precision()));
                if delta.compare(&limit) == Some(std::cmp::Ordering::Greater) {
                    limit_updates.push((*addr, delta));
                    report_updates.push(*addr);
                }
            }
            for (addr, delta) in limit_updates {
                stage.limits.insert(addr, delta);
            }
            for addr in report_updates {
                let origin = origin_of(addr);
                stage
                    .reports
                    .entry(addr)
                    .and_modify(|r| {
                        r.count += 1;
                        r.iter_max = current_iter;
                        r.origin = origin;
                    })
                    .or_insert(StageReport {
                        count: 1,
                        iter_min: current_iter,
                        iter_max: current_iter,
                        origin,
                    });
                tracing::info!(stage = n, addr, "stage divergence report");
            }
        }

        stage.old_vals = Some(std::mem::take(&mut stage.new_vals));
        Ok(())
    }

    /// `CLEAR_STAGE(n)`: tear down `oldVals`/`newVals`/`limits` and mark
    /// the slot empty.
    pub fn clear_stage(&mut self, n: usize) -> EngineResult<()> {
        let stage = self.slot_mut(n)?;
        *stage = Stage::default();
        Ok(())
    }
}
