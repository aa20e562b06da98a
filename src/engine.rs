//! The engine context (§2 "SUPPLEMENTED FEATURE: engine context & builder"):
//! a single long-lived struct replacing the original tool's global Valgrind
//! tool state, owning every piece of process-wide state named in §3.
//!
//! Grounded on the teacher's `Interpreter<M, S, Tx, Ecal>` pattern: one
//! struct threaded by reference through every instrumentation point,
//! rather than ambient globals.

use hashbrown::HashSet;

use crate::aggregate::Aggregator;
use crate::bigfloat::BigFloatPool;
use crate::config::EngineConfig;
use crate::debuginfo::DebugInfoProvider;
use crate::interpreter::Interpreter;
use crate::stage::StageTable;
use crate::store::{RegisterExclusions, ShadowStore};

/// A host-assigned guest-thread identifier (§5: "a `u32` newtype,
/// whatever numeric id the host hands in").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

/// The engine: owns the shadow store, aggregator, stage table, unsupported
/// opcode set, scratch pool, and configuration for one analysis run.
///
/// `Engine::new` replaces "init at startup" (§3's process-wide-state
/// lifecycle); there is no explicit teardown beyond ordinary `Drop` —
/// the original's manual frees at `fd_fini` become Rust's drop order, a
/// simplification recorded in DESIGN.md.
pub struct Engine {
    store: ShadowStore,
    aggregator: Aggregator,
    stages: StageTable,
    pool: BigFloatPool,
    unsupported: HashSet<&'static str>,
    config: EngineConfig,
    debug_info: Option<Box<dyn DebugInfoProvider>>,
    generation: u64,
    analysis_enabled: bool,
    superblocks_executed: u64,
    instructions_seen: u64,
}

impl Engine {
    /// Build a fresh engine from a configuration. `max_temps` and
    /// `max_stages` come from the host's superblock/stage limits;
    /// `register_exclusions` from the guest architecture.
    pub fn new(
        config: EngineConfig,
        max_temps: usize,
        max_stages: usize,
        register_exclusions: RegisterExclusions,
    ) -> Self {
        let analysis_enabled = config.analyze_all;
        Engine {
            store: ShadowStore::new(max_temps, register_exclusions),
            aggregator: Aggregator::new(),
            stages: StageTable::new(max_stages),
            pool: BigFloatPool::new(config.precision),
            unsupported: HashSet::new(),
            config,
            debug_info: None,
            generation: 0,
            analysis_enabled,
            superblocks_executed: 0,
            instructions_seen: 0,
        }
    }

    /// Attach a debug-info provider (used by the reporter and by
    /// `ignore-libraries`/`ignore-accurate` filtering, §4.4's
    /// "SUPPLEMENTED FEATURE: debug-info attribution").
    pub fn set_debug_info(&mut self, provider: Box<dyn DebugInfoProvider>) {
        self.debug_info = Some(provider);
    }

    /// The active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shadow store, immutably.
    pub fn store(&self) -> &ShadowStore {
        &self.store
    }

    /// The shadow store, mutably.
    pub fn store_mut(&mut self) -> &mut ShadowStore {
        &mut self.store
    }

    /// The per-site aggregator, immutably.
    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// The per-site aggregator, mutably.
    pub fn aggregator_mut(&mut self) -> &mut Aggregator {
        &mut self.aggregator
    }

    /// The stage table, immutably.
    pub fn stages(&self) -> &StageTable {
        &self.stages
    }

    /// The stage table, mutably.
    pub fn stages_mut(&mut self) -> &mut StageTable {
        &mut self.stages
    }

    /// The scratch pool, mutably.
    pub fn pool_mut(&mut self) -> &mut BigFloatPool {
        &mut self.pool
    }

    /// Borrow the pieces needed to run one interpreter call, at the
    /// engine's current generation and `bad-cancellations` setting.
    pub fn interpreter(&mut self) -> Interpreter<'_> {
        let generation = self.generation;
        let badness_enabled = self.config.bad_cancellations;
        Interpreter::new(
            &mut self.store,
            &mut self.aggregator,
            &mut self.pool,
            &mut self.unsupported,
            generation,
            badness_enabled,
            self.config.sim_original,
            self.config.mean_error,
        )
    }

    /// The unsupported-opcode set, immutably (reported once at shutdown,
    /// §7).
    pub fn unsupported(&self) -> &HashSet<&'static str> {
        &self.unsupported
    }

    /// The unsupported-opcode set, mutably.
    pub fn unsupported_mut(&mut self) -> &mut HashSet<&'static str> {
        &mut self.unsupported
    }

    /// The attached debug-info provider, if any.
    pub fn debug_info(&self) -> Option<&dyn DebugInfoProvider> {
        self.debug_info.as_deref()
    }

    /// The current superblock-execution (generation) counter, compared
    /// against each temp shadow's `version` (invariant I1).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bump the generation counter at superblock entry, bulk-invalidating
    /// every temp shadow (§4.4's "at the head of every superblock").
    pub fn enter_superblock(&mut self) {
        self.generation += 1;
        self.superblocks_executed += 1;
    }

    /// Record one original-program instruction observed, for the run
    /// summary.
    pub fn record_instruction(&mut self) {
        self.instructions_seen += 1;
    }

    /// Whether analysis is currently enabled (gated by `BEGIN`/`END`
    /// client requests when `analyze-all=no`, §4.7).
    pub fn analysis_enabled(&self) -> bool {
        self.analysis_enabled
    }

    /// Enable analysis (`BEGIN` client request).
    pub fn begin(&mut self) {
        self.analysis_enabled = true;
    }

    /// Disable analysis (`END` client request), unless `ignore-end` is
    /// configured.
    pub fn end(&mut self) {
        if !self.config.ignore_end {
            self.analysis_enabled = false;
        }
    }

    /// `RESET` client request (§4.7): deactivate every shadow and bump
    /// the generation so live temps go stale too.
    pub fn reset(&mut self) {
        self.store.memory_deactivate_all();
        self.generation += 1;
        tracing::info!("engine reset: all shadows deactivated");
    }

    /// Superblocks executed so far (run summary).
    pub fn superblocks_executed(&self) -> u64 {
        self.superblocks_executed
    }

    /// Original-program instructions seen so far (run summary).
    pub fn instructions_seen(&self) -> u64 {
        self.instructions_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_superblock_bumps_generation_and_count() {
        let mut engine = Engine::new(
            EngineConfig::default(),
            8,
            4,
            RegisterExclusions::none(),
        );
        assert_eq!(engine.generation(), 0);
        engine.enter_superblock();
        engine.enter_superblock();
        assert_eq!(engine.generation(), 2);
        assert_eq!(engine.superblocks_executed(), 2);
    }

    #[test]
    fn end_respects_ignore_end() {
        let mut config = EngineConfig::default();
        config.analyze_all = true;
        config.ignore_end = true;
        let mut engine = Engine::new(config, 8, 4, RegisterExclusions::none());
        assert!(engine.analysis_enabled());
        engine.end();
        assert!(engine.analysis_enabled(), "ignore-end must keep analysis on");
    }

    #[test]
    fn reset_deactivates_memory_shadows() {
        use crate::bigfloat::{BigFloat, DEFAULT_PRECISION};
        use crate::value::{OrigValue, ShadowValue};

        let mut engine = Engine::new(
            EngineConfig::default(),
            8,
            4,
            RegisterExclusions::none(),
        );
        let sv = ShadowValue::from_promoted(
            BigFloat::from_f64(DEFAULT_PRECISION, 1.0),
            OrigValue::F64(1.0),
        );
        engine.store_mut().memory_upsert(0x1000, &sv);
        assert!(engine.store().memory_get(0x1000).is_some());
        engine.reset();
        assert!(engine.store().memory_get(0x1000).is_none());
    }
}
