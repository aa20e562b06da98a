//! The shadow store (§4.2): three address spaces — memory, per-thread
//! registers, and per-superblock temporaries.
//!
//! Grounded on the teacher's `fuel-vm/src/interpreter/memory.rs` and
//! `register.rs` (a per-thread register file addressed by the owning
//! `Interpreter`) and on the original tool's `globalMemory` /
//! `threadRegisters` / `localTemps` hash tables and arrays (`fd_main.c`).

use hashbrown::HashMap;

use crate::engine::ThreadId;
use crate::value::ShadowValue;

/// Per-architecture register-offset exclusions (Open Question #1): a
/// portable generalization of the original's hard-coded x86 offset-168
/// (rip/segment slot) exclusion.
#[derive(Clone, Debug, Default)]
pub struct RegisterExclusions {
    excluded: hashbrown::HashSet<u32>,
}

impl RegisterExclusions {
    /// No exclusions at all.
    pub fn none() -> Self {
        RegisterExclusions::default()
    }

    /// The amd64 preset: excludes offset 168, matching the original
    /// tool's hard-coded behavior.
    pub fn amd64() -> Self {
        let mut excluded = hashbrown::HashSet::new();
        excluded.insert(168);
        RegisterExclusions { excluded }
    }

    /// Build a custom exclusion set.
    pub fn custom(offsets: impl IntoIterator<Item = u32>) -> Self {
        RegisterExclusions {
            excluded: offsets.into_iter().collect(),
        }
    }

    /// Whether the given byte offset is excluded from shadowing.
    pub fn is_excluded(&self, offset: u32) -> bool {
        self.excluded.contains(&offset)
    }
}

/// The shadow store: memory, registers, and temps.
#[derive(Debug, Default)]
pub struct ShadowStore {
    memory: HashMap<u64, ShadowValue>,
    registers: HashMap<(ThreadId, u32), ShadowValue>,
    temps: Vec<Option<ShadowValue>>,
    exclusions: RegisterExclusions,
}

impl ShadowStore {
    /// Create an empty store with room for `max_temps` temporaries per
    /// superblock and the given register exclusion set.
    pub fn new(max_temps: usize, exclusions: RegisterExclusions) -> Self {
        ShadowStore {
            memory: HashMap::new(),
            registers: HashMap::new(),
            temps: vec![None; max_temps],
            exclusions,
        }
    }

    /// The configured register exclusion set.
    pub fn exclusions(&self) -> &RegisterExclusions {
        &self.exclusions
    }

    // --- memory --------------------------------------------------------

    /// `memory.get(addr) -> ShadowValue?`
    pub fn memory_get(&self, addr: u64) -> Option<&ShadowValue> {
        self.memory.get(&addr).filter(|sv| sv.active)
    }

    /// `memory.upsert(addr, src) -> ShadowValue`: never allocates a
    /// second record for an existing key, copies `src`'s payload.
    pub fn memory_upsert(&mut self, addr: u64, src: &ShadowValue) -> &ShadowValue {
        self.memory
            .entry(addr)
            .and_modify(|existing| existing.copy_from(src))
            .or_insert_with(|| src.clone());
        self.memory.get(&addr).expect("just inserted")
    }

    /// Deactivate a memory shadow (e.g. overwritten by a non-float
    /// store). A no-op if no shadow is present.
    pub fn memory_deactivate(&mut self, addr: u64) {
        if let Some(sv) = self.memory.get_mut(&addr) {
            sv.deactivate();
        }
    }

    /// Remove every memory shadow (used by `RESET`, §4.7).
    pub fn memory_deactivate_all(&mut self) {
        for sv in self.memory.values_mut() {
            sv.deactivate();
        }
    }

    /// Iterate over active memory shadows.
    pub fn memory_iter(&self) -> impl Iterator<Item = (&u64, &ShadowValue)> {
        self.memory.iter().filter(|(_, sv)| sv.active)
    }

    // --- registers -------------------------------------------------------

    /// `register.get(tid, offset)`.
    pub fn register_get(&self, tid: ThreadId, offset: u32) -> Option<&ShadowValue> {
        if self.exclusions.is_excluded(offset) {
            return None;
        }
        self.registers.get(&(tid, offset)).filter(|sv| sv.active)
    }

    /// `register.upsert(tid, offset, src)`. Silently no-ops (returns
    /// `None`) for excluded offsets, per Open Question #1's resolution.
    pub fn register_upsert(
        &mut self,
        tid: ThreadId,
        offset: u32,
        src: &ShadowValue,
    ) -> Option<&ShadowValue> {
        if self.exclusions.is_excluded(offset) {
            return None;
        }
        let key = (tid, offset);
        self.registers
            .entry(key)
            .and_modify(|existing| existing.copy_from(src))
            .or_insert_with(|| src.clone());
        self.registers.get(&key)
    }

    /// Deactivate a register shadow.
    pub fn register_deactivate(&mut self, tid: ThreadId, offset: u32) {
        if let Some(sv) = self.registers.get_mut(&(tid, offset)) {
            sv.deactivate();
        }
    }

    /// Resolve a circular register offset per §4.5/§9:
    /// `(base + (ix + bias) mod n_elems)`.
    pub fn circular_offset(base: u32, ix: i64, bias: i64, n_elems: u32) -> u32 {
        let n = i64::from(n_elems).max(1);
        let idx = (ix + bias).rem_euclid(n);
        base + idx as u32
    }

    // --- temps -----------------------------------------------------------

    /// `temp.get(tmp) -> ShadowValue?`: live only if `version` matches
    /// `current_generation` (invariant I1).
    pub fn temp_get(&self, tmp: usize, current_generation: u64) -> Option<&ShadowValue> {
        self.temps
            .get(tmp)
            .and_then(|slot| slot.as_ref())
            .filter(|sv| sv.version == current_generation)
    }

    /// `temp.set(tmp) -> ShadowValue`: reuses the slot if present
    /// (regardless of staleness), bumping `version`; else allocates a new
    /// slot initialized with `value`.
    pub fn temp_set(
        &mut self,
        tmp: usize,
        current_generation: u64,
        value: ShadowValue,
    ) -> crate::error::EngineResult<&ShadowValue> {
        if tmp >= self.temps.len() {
            return Err(crate::error::EngineError::TempOutOfRange {
                index: tmp,
                max: self.temps.len(),
            });
        }
        let mut value = value;
        value.version = current_generation;
        value.active = true;
        self.temps[tmp] = Some(value);
        Ok(self.temps[tmp].as_ref().expect("just inserted"))
    }

    /// The configured maximum number of temps per superblock.
    pub fn max_temps(&self) -> usize {
        self.temps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bigfloat::{BigFloat, DEFAULT_PRECISION};
    use crate::value::OrigValue;

    fn sv(v: f64) -> ShadowValue {
        ShadowValue::from_promoted(
            BigFloat::from_f64(DEFAULT_PRECISION, v),
            OrigValue::F64(v),
        )
    }

    #[test]
    fn upsert_never_double_allocates() {
        let mut store = ShadowStore::new(4, RegisterExclusions::none());
        store.memory_upsert(0x1000, &sv(1.0));
        store.memory_upsert(0x1000, &sv(2.0));
        assert_eq!(store.memory.len(), 1);
        assert_eq!(store.memory_get(0x1000).unwrap().value.to_f64(), 2.0);
    }

    #[test]
    fn deactivate_then_upsert_reuses_slot() {
        let mut store = ShadowStore::new(4, RegisterExclusions::none());
        store.memory_upsert(0x1000, &sv(1.0));
        store.memory_deactivate(0x1000);
        assert!(store.memory_get(0x1000).is_none());
        store.memory_upsert(0x1000, &sv(3.0));
        assert_eq!(store.memory.len(), 1);
        assert_eq!(store.memory_get(0x1000).unwrap().value.to_f64(), 3.0);
    }

    #[test]
    fn temp_liveness_follows_generation() {
        let mut store = ShadowStore::new(4, RegisterExclusions::none());
        store.temp_set(0, 1, sv(5.0)).unwrap();
        assert!(store.temp_get(0, 1).is_some());
        assert!(store.temp_get(0, 2).is_none(), "stale generation is dead");
    }

    #[test]
    fn register_exclusion_blocks_amd64_offset_168() {
        let mut store = ShadowStore::new(4, RegisterExclusions::amd64());
        let tid = ThreadId(0);
        assert!(store.register_upsert(tid, 168, &sv(1.0)).is_none());
        assert!(store.register_get(tid, 168).is_none());
        assert!(store.register_upsert(tid, 8, &sv(1.0)).is_some());
    }

    #[test]
    fn circular_offset_wraps() {
        assert_eq!(ShadowStore::circular_offset(100, 7, 1, 8), 100);
        assert_eq!(ShadowStore::circular_offset(100, 0, -1, 8), 107);
    }
}
