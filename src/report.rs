//! Categorized text reports and provenance graphs (§4.6), plus the
//! run-summary counters (§2/§3's ambient "run summary" addition).
//!
//! Grounded on the teacher's `GasProfilingData`/`CoverageProfilingData`
//! `Display` impls (sorted, one line per entry) and on the original
//! tool's `printErrorGraph`/graph dot-like text dump.

use std::fmt;

use hashbrown::HashSet;

use crate::bigfloat::BigFloat;
use crate::engine::Engine;
use crate::value::OrigValue;

/// One line of a categorized report: a single surviving shadow value,
/// traversed off the memory shadow store rather than the per-site
/// aggregator (§4.6: "traversing the memory-shadow sorted by `opCount`").
#[derive(Clone, Debug)]
pub struct ReportLine {
    /// Instruction address of the shadow's backing memory location.
    pub addr: u64,
    /// The untainted machine value, formatted for display.
    pub original: String,
    /// The high-precision shadow value, formatted for display.
    pub shadow: String,
    /// Absolute error against the machine value, formatted for display.
    pub absolute_error: String,
    /// Relative error against the machine value, formatted for display.
    pub relative_error: String,
    /// The same value as `relative_error`, kept unformatted so
    /// categorized reports can sort numerically instead of lexically.
    relative_error_value: BigFloat,
    /// Bits lost to catastrophic cancellation on the worst path into this
    /// value.
    pub canceled: i64,
    /// Instruction address of the last operation that produced this
    /// value.
    pub origin: u64,
    /// Instruction address where the worst cancellation occurred.
    pub cancel_origin: u64,
    /// Length of the longest dataflow path feeding this value; the
    /// primary sort key (§4.6).
    pub op_count: u64,
    /// Debug location label, if a provider was attached.
    pub location: Option<String>,
}

impl fmt::Display for ReportLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x} orig={} shadow={} absErr={} relErr={} canceled={} origin={:#x} cancelOrigin={:#x} opCount={}",
            self.addr,
            self.original,
            self.shadow,
            self.absolute_error,
            self.relative_error,
            self.canceled,
            self.origin,
            self.cancel_origin,
            self.op_count
        )?;
        if let Some(loc) = &self.location {
            write!(f, " ({loc})")?;
        }
        Ok(())
    }
}

fn format_orig(orig: OrigValue) -> String {
    match orig {
        OrigValue::F32(v) => v.to_string(),
        OrigValue::F64(v) => v.to_string(),
        OrigValue::Invalid => "invalid".to_string(),
    }
}

/// The run-level counters printed at shutdown (original's `fd_fini`
/// summary).
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    /// Superblocks executed.
    pub superblocks_executed: u64,
    /// Original-program instructions seen.
    pub instructions_seen: u64,
    /// Distinct sites with at least one recorded sample.
    pub sites_recorded: usize,
    /// Distinct unsupported opcodes encountered.
    pub unsupported_opcodes: usize,
    /// Number of temp slots configured (`max_temps`).
    pub max_temps: usize,
    /// Number of stage slots configured.
    pub stage_slots: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "superblocks executed: {}", self.superblocks_executed)?;
        writeln!(f, "instructions seen: {}", self.instructions_seen)?;
        writeln!(f, "sites recorded: {}", self.sites_recorded)?;
        writeln!(f, "unsupported opcodes seen: {}", self.unsupported_opcodes)?;
        writeln!(f, "max temps: {}", self.max_temps)?;
        write!(f, "stage slots: {}", self.stage_slots)
    }
}

const GRAPH_MAX_DEPTH: usize = 32;

/// Builds the categorized reports and provenance graphs.
pub struct Reporter;

impl Reporter {
    /// All surviving memory shadows, sorted by `opCount` descending then
    /// address (§4.6's sort contract), formatted as [`ReportLine`]s, with
    /// `ignore-libraries`/`ignore-accurate` filtering applied (§4.4/§6).
    fn sorted_lines(engine: &Engine) -> Vec<ReportLine> {
        let config = engine.config();
        let mut lines: Vec<ReportLine> = engine
            .store()
            .memory_iter()
            .filter(|(_, sv)| !config.ignore_accurate || !sv.relative_error().is_zero())
            .filter(|(addr, _)| {
                if !config.ignore_libraries {
                    return true;
                }
                !engine
                    .debug_info()
                    .and_then(|p| p.resolve(**addr))
                    .is_some_and(|loc| loc.is_shared_library())
            })
            .map(|(addr, sv)| {
                let location = engine
                    .debug_info()
                    .and_then(|p| p.resolve(*addr))
                    .map(|loc| {
                        format!(
                            "{}{}",
                            loc.symbol.clone().unwrap_or_else(|| loc.soname.clone()),
                            loc.line.map(|l| format!(":{l}")).unwrap_or_default()
                        )
                    });
                let relative_error_value = sv.relative_error();
                ReportLine {
                    addr: *addr,
                    original: format_orig(sv.orig),
                    shadow: sv.value.format_to_decimal(6),
                    absolute_error: sv.absolute_error().format_to_decimal(6),
                    relative_error: relative_error_value.format_to_decimal(6),
                    relative_error_value,
                    canceled: sv.canceled,
                    origin: sv.origin,
                    cancel_origin: sv.cancel_origin,
                    op_count: sv.op_count,
                    location,
                }
            })
            .collect();
        lines.sort_by(|a, b| b.op_count.cmp(&a.op_count).then_with(|| a.addr.cmp(&b.addr)));
        lines
    }

    /// The "by relative error" category, §4.6.
    pub fn by_relative_error(engine: &Engine) -> String {
        let mut lines = Self::sorted_lines(engine);
        lines.sort_by(|a, b| {
            b.relative_error_value
                .compare(&a.relative_error_value)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.addr.cmp(&b.addr))
        });
        Self::render_lines("by relative error", &lines)
    }

    /// The "by cancelled bits" category, §4.6.
    pub fn by_cancelled_bits(engine: &Engine) -> String {
        let mut lines = Self::sorted_lines(engine);
        lines.sort_by(|a, b| b.canceled.cmp(&a.canceled).then_with(|| a.addr.cmp(&b.addr)));
        Self::render_lines("by cancelled bits", &lines)
    }

    /// The "by special values" category, §4.6: shadows whose relative
    /// error formats as a non-finite marker (NaN/inf propagation).
    pub fn by_special_values(engine: &Engine) -> String {
        let lines: Vec<ReportLine> = Self::sorted_lines(engine)
            .into_iter()
            .filter(|l| l.relative_error.contains("NaN") || l.relative_error.contains("inf"))
            .collect();
        Self::render_lines("by special values", &lines)
    }

    fn render_lines(title: &str, lines: &[ReportLine]) -> String {
        let mut out = format!("== {title} ==\n");
        for line in lines {
            out.push_str(&line.to_string());
            out.push('\n');
        }
        out
    }

    /// Emit all three categorized reports, sorted `opCount` descending
    /// then address within each.
    pub fn write_reports(engine: &Engine) -> [String; 3] {
        [
            Self::by_relative_error(engine),
            Self::by_cancelled_bits(engine),
            Self::by_special_values(engine),
        ]
    }

    /// Render a provenance graph for `addr` in the `graph { node {...}
    /// edge {...} }` text format (§6). Nodes are aggregator entries —
    /// unlike the categorized reports above, the graph walks
    /// `arg1`/`arg2` provenance through the per-site aggregator, since
    /// that's where a result's worst-observed argument addresses are
    /// recorded — following `origin`/`cancel_origin` back with cycle
    /// detection and a capped depth. `filename` is recorded as a graph
    /// attribute, not written to disk — callers own I/O.
    pub fn render_graph(engine: &Engine, addr: u64, filename: &str) -> String {
        let mut out = format!("graph {{\n  // file: {filename}\n");
        let mut visited = HashSet::new();
        Self::graph_node(engine, addr, &mut visited, 0, &mut out);
        out.push_str("}\n");
        out
    }

    fn graph_node(
        engine: &Engine,
        addr: u64,
        visited: &mut HashSet<u64>,
        depth: usize,
        out: &mut String,
    ) {
        if depth >= GRAPH_MAX_DEPTH || !visited.insert(addr) {
            return;
        }
        let Some(mv) = engine.aggregator().get(addr) else {
            out.push_str(&format!("  node {{ addr = {addr:#x} }}\n"));
            return;
        };
        out.push_str(&format!(
            "  node {{ addr = {addr:#x}; op = {}; count = {} }}\n",
            <&'static str>::from(mv.op),
            mv.count
        ));
        if mv.arg1 != 0 {
            out.push_str(&format!("  edge {{ from = {addr:#x}; to = {:#x} }}\n", mv.arg1));
            Self::graph_node(engine, mv.arg1, visited, depth + 1, out);
        }
        if mv.arg2 != 0 {
            out.push_str(&format!("  edge {{ from = {addr:#x}; to = {:#x} }}\n", mv.arg2));
            Self::graph_node(engine, mv.arg2, visited, depth + 1, out);
        }
    }

    /// Build the run summary from the engine's live counters (§2's
    /// "SUPPLEMENTED FEATURE: run summary").
    pub fn summary(engine: &Engine) -> RunSummary {
        RunSummary {
            superblocks_executed: engine.superblocks_executed(),
            instructions_seen: engine.instructions_seen(),
            sites_recorded: engine.aggregator().len(),
            unsupported_opcodes: engine.unsupported().len(),
            max_temps: engine.store().max_temps(),
            stage_slots: engine.stages().len(),
        }
    }
}
