//! Per-site error aggregator (§4.5.. no, §2 item 5 / §3's `MeanValue`).
//!
//! Grounded on the original tool's `updateMeanValue` (`fd_main.c`) and on
//! the teacher's per-location aggregate pattern in
//! `fuel-vm/src/profiler.rs` (`GasProfilingData`: a `HashMap<InstructionLocation, T>`
//! with a sorted `Display` impl).

use hashbrown::HashMap;
use std::fmt;

use crate::bigfloat::BigFloat;
use crate::interpreter::OpCode;

/// Per-site aggregate, keyed by instruction address.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeanValue {
    /// The opcode this site executes.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub op: OpCode,
    /// Number of times this site has been observed.
    pub count: u32,
    /// Running sum of relative error, as a decimal string (BigFloat is
    /// not serde-friendly; see `sum`/`max` for the live value).
    #[cfg_attr(feature = "serde", serde(skip))]
    pub sum: BigFloat,
    /// Running max of relative error.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub max: BigFloat,
    /// Running sum of cancelled bits.
    pub canceled_sum: i64,
    /// Running max of cancelled bits.
    pub canceled_max: i64,
    /// Set when `canceled_sum` would wrap (overflow), per §7.
    pub overflow: bool,
    /// Running sum of cancellation badness.
    pub badness_sum: u32,
    /// Running max of cancellation badness.
    pub badness_max: u32,
    /// Provenance address of the first argument that produced the
    /// current `max`.
    pub arg1: u64,
    /// Provenance address of the second argument that produced the
    /// current `max`.
    pub arg2: u64,
}

impl MeanValue {
    fn new(
        op: OpCode,
        rel_error: BigFloat,
        canceled: i64,
        badness: u32,
        arg1: u64,
        arg2: u64,
    ) -> Self {
        MeanValue {
            op,
            count: 1,
            sum: rel_error.clone(),
            max: rel_error,
            canceled_sum: canceled,
            canceled_max: canceled,
            overflow: false,
            badness_sum: badness,
            badness_max: badness,
            arg1,
            arg2,
        }
    }

    fn merge(
        &mut self,
        rel_error: BigFloat,
        canceled: i64,
        badness: u32,
        arg1: u64,
        arg2: u64,
    ) {
        self.count += 1;
        self.sum = self.sum.add(&rel_error);

        let old_sum = self.canceled_sum;
        self.canceled_sum = self.canceled_sum.wrapping_add(canceled);
        if canceled >= 0 && self.canceled_sum < old_sum {
            self.overflow = true;
            tracing::warn!(site = self.arg1, "mean-value cancellation sum overflowed");
        }

        self.badness_sum = self.badness_sum.saturating_add(badness);

        if rel_error.compare(&self.max) == Some(std::cmp::Ordering::Greater) {
            self.max = rel_error;
            self.arg1 = arg1;
            self.arg2 = arg2;
        }

        if canceled > self.canceled_max {
            self.canceled_max = canceled;
        }
        if badness > self.badness_max {
            self.badness_max = badness;
        }
    }

    /// The mean relative error, or `None` on overflow of the running sum
    /// (§7: "reports display 'overflow' in place of an average").
    pub fn mean_relative_error(&self) -> Option<BigFloat> {
        if self.overflow || self.count == 0 {
            return None;
        }
        let prec = self.sum.precision();
        Some(self.sum.div(&BigFloat::from_i64(prec, i64::from(self.count))))
    }

    /// The mean cancelled-bits count, or `None` on overflow.
    pub fn mean_canceled(&self) -> Option<f64> {
        if self.overflow || self.count == 0 {
            return None;
        }
        Some(self.canceled_sum as f64 / f64::from(self.count))
    }
}

/// Mapping from static operation address to a [`MeanValue`] record.
#[derive(Clone, Debug, Default)]
pub struct Aggregator {
    sites: HashMap<u64, MeanValue>,
}

impl Aggregator {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Aggregator::default()
    }

    /// Record an observation at `addr` (§4.3 step 7). Created lazily on
    /// first observation, per §3's `MeanValue` lifecycle ("never freed
    /// before exit").
    pub fn record(
        &mut self,
        addr: u64,
        op: OpCode,
        rel_error: BigFloat,
        canceled: i64,
        badness: u32,
        arg1: u64,
        arg2: u64,
    ) {
        self.sites
            .entry(addr)
            .and_modify(|v| v.merge(rel_error.clone(), canceled, badness, arg1, arg2))
            .or_insert_with(|| MeanValue::new(op, rel_error, canceled, badness, arg1, arg2));
    }

    /// Look up a site's aggregate.
    pub fn get(&self, addr: u64) -> Option<&MeanValue> {
        self.sites.get(&addr)
    }

    /// Iterate over all observed sites.
    pub fn iter(&self) -> impl Iterator<Item = (&u64, &MeanValue)> {
        self.sites.iter()
    }

    /// Number of distinct sites observed.
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Whether any site has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut items: Vec<_> = self.sites.iter().collect();
        items.sort_by_key(|(addr, _)| **addr);
        for (addr, v) in items {
            match v.mean_relative_error() {
                Some(mean) => writeln!(
                    f,
                    "{addr:#x}: op={:?} count={} mean_rel_err={} max_rel_err={}",
                    v.op,
                    v.count,
                    mean.format_to_decimal(6),
                    v.max.format_to_decimal(6)
                )?,
                None => writeln!(
                    f,
                    "{addr:#x}: op={:?} count={} mean_rel_err=overflow max_rel_err={}",
                    v.op,
                    v.count,
                    v.max.format_to_decimal(6)
                )?,
            }
        }
        Ok(())
    }
}
