//! The client-request dispatcher (§4.7): a small switch over a numeric
//! op-code, used by instrumented programs to drive resets, dumps,
//! prints, stage control, and error-threshold queries.
//!
//! Grounded on the original tool's `fd_handle_client_request` switch and
//! on the teacher's ecal/dispatch pattern for host-callable operations.

use crate::engine::Engine;
use crate::error::EngineResult;

/// A client request (§6's numeric command set), already decoded from the
/// host's word-argument channel.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientRequest {
    /// Print the relative error at `addr` to the host's message channel.
    PrintError {
        /// A caller-supplied label, surfaced in the printed line.
        label: String,
        /// Address to report on.
        addr: u64,
    },
    /// Like `PrintError`, but only prints when relative error is nonzero.
    CondPrintError {
        /// A caller-supplied label.
        label: String,
        /// Address to report on.
        addr: u64,
    },
    /// Dump a provenance graph for `addr` to `filename`.
    DumpErrorGraph {
        /// Output file name.
        filename: String,
        /// Address to graph.
        addr: u64,
    },
    /// Like `DumpErrorGraph`, but only dumps when relative error is
    /// nonzero.
    CondDumpErrorGraph {
        /// Output file name.
        filename: String,
        /// Address to graph.
        addr: u64,
    },
    /// `BEGIN_STAGE(n)`.
    BeginStage(usize),
    /// `END_STAGE(n)`.
    EndStage(usize),
    /// `CLEAR_STAGE(n)`.
    ClearStage(usize),
    /// `ERROR_GREATER(addr, threshold) -> bool`.
    ErrorGreater {
        /// Address to check.
        addr: u64,
        /// Threshold to compare the relative error against.
        threshold: f64,
    },
    /// `RESET()`.
    Reset,
    /// `INSERT_SHADOW(addr)`: write the shadow's high-precision value
    /// back into the original machine location.
    InsertShadow(u64),
    /// `BEGIN()`: enable analysis globally.
    Begin,
    /// `END()`: disable analysis globally, unless `ignore-end`.
    End,
}

/// The dispatcher's return value.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientResponse {
    /// No return value.
    Unit,
    /// A boolean return value (`ERROR_GREATER`).
    Bool(bool),
    /// The printed/dumped text, for requests that produce output (tests
    /// can assert on this instead of capturing stdout/file writes).
    Written(String),
}

/// Executes [`ClientRequest`]s against an [`Engine`].
pub struct Dispatcher;

impl Dispatcher {
    /// Handle one client request.
    pub fn handle(engine: &mut Engine, request: ClientRequest) -> EngineResult<ClientResponse> {
        match request {
            ClientRequest::PrintError { label, addr } => {
                Ok(ClientResponse::Written(Self::format_print(engine, &label, addr)))
            }
            ClientRequest::CondPrintError { label, addr } => {
                match Self::relative_error_at(engine, addr) {
                    Some(rel) if !rel.is_zero() => {
                        Ok(ClientResponse::Written(Self::format_print(engine, &label, addr)))
                    }
                    _ => Ok(ClientResponse::Unit),
                }
            }
            ClientRequest::DumpErrorGraph { filename, addr } => Ok(ClientResponse::Written(
                crate::report::Reporter::render_graph(engine, addr, &filename),
            )),
            ClientRequest::CondDumpErrorGraph { filename, addr } => {
                match Self::relative_error_at(engine, addr) {
                    Some(rel) if !rel.is_zero() => Ok(ClientResponse::Written(
                        crate::report::Reporter::render_graph(engine, addr, &filename),
                    )),
                    _ => Ok(ClientResponse::Unit),
                }
            }
            ClientRequest::BeginStage(n) => {
                engine.stages_mut().begin_stage(n)?;
                Ok(ClientResponse::Unit)
            }
            ClientRequest::EndStage(n) => {
                let origin_of = |addr: u64| {
                    engine
                        .store()
                        .memory_get(addr)
                        .map(|sv| sv.origin)
                        .unwrap_or(0)
                };
                engine.stages_mut().end_stage(n, origin_of)?;
                Ok(ClientResponse::Unit)
            }
            ClientRequest::ClearStage(n) => {
                engine.stages_mut().clear_stage(n)?;
                Ok(ClientResponse::Unit)
            }
            ClientRequest::ErrorGreater { addr, threshold } => {
                let greater = match Self::relative_error_at(engine, addr) {
                    Some(rel) => {
                        let prec = rel.precision();
                        rel.compare(&crate::bigfloat::BigFloat::from_f64(prec, threshold))
                            == Some(std::cmp::Ordering::Greater)
                    }
                    None => false,
                };
                Ok(ClientResponse::Bool(greater))
            }
            ClientRequest::Reset => {
                engine.reset();
                Ok(ClientResponse::Unit)
            }
            ClientRequest::InsertShadow(addr) => {
                if let Some(shadow) = engine.store().memory_get(addr).cloned() {
                    // Round the shadow down to the original's width and
                    // write it back, simulating `INSERT_SHADOW`'s effect
                    // on the guest's memory; the engine itself holds no
                    // guest memory, so this only reports the rounded
                    // value for the host to apply.
                    let rounded = match shadow.orig {
                        crate::value::OrigValue::F32(_) => {
                            crate::value::OrigValue::F32(shadow.value.to_f32())
                        }
                        crate::value::OrigValue::F64(_) | crate::value::OrigValue::Invalid => {
                            crate::value::OrigValue::F64(shadow.value.to_f64())
                        }
                    };
                    Ok(ClientResponse::Written(format!(
                        "{addr:#x} <- {rounded:?}"
                    )))
                } else {
                    Ok(ClientResponse::Unit)
                }
            }
            ClientRequest::Begin => {
                engine.begin();
                Ok(ClientResponse::Unit)
            }
            ClientRequest::End => {
                engine.end();
                Ok(ClientResponse::Unit)
            }
        }
    }

    fn relative_error_at(engine: &Engine, addr: u64) -> Option<crate::bigfloat::BigFloat> {
        engine.store().memory_get(addr).map(|sv| sv.relative_error())
    }

    fn format_print(engine: &Engine, label: &str, addr: u64) -> String {
        match engine.store().memory_get(addr) {
            Some(sv) => format!(
                "{label}: {addr:#x} rel_err={} canceled={} op_count={}",
                sv.relative_error().format_to_decimal(6),
                sv.canceled,
                sv.op_count
            ),
            None => format!("{label}: {addr:#x} <no shadow>"),
        }
    }
}
