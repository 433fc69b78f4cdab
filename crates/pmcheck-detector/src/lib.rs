//! Crash-consistency detector.
//!
//! Consumes the totally ordered event stream of an instrumented run,
//! keeps the shadow PM model up to date, and checks every read performed
//! by the recovery run against it.
//!
//! ```text
//!  pre-failure events ──▶ live ShadowMemory ──snapshot──▶ post-failure copy
//!                              │                               ▲
//!                      performance/tx findings      recovery events + reads
//!                              ▼                               │
//!                          Diagnostic ◀──── correctness predicate
//! ```
//!
//! # Usage
//!
//! ```
//! use pmcheck_detector::{Detector, DetectorSignal};
//! use pmcheck_protocol::{AddressRange, EventKind, Phase, ThreadId, TraceEvent};
//! use pmcheck_shadow::ShadowConfig;
//!
//! let mut det = Detector::new(ShadowConfig {
//!     pm_window: AddressRange::new(0, u64::MAX),
//! });
//! let ev = |seq, kind| TraceEvent { seq, tid: ThreadId(0), ip: 0x400000, kind };
//!
//! det.process(&ev(0, EventKind::Allocate { range: AddressRange::new(0x1000, 0x100) }), Phase::PreFailure).unwrap();
//! det.process(&ev(1, EventKind::Write { range: AddressRange::new(0x1000, 8), non_temporal: false }), Phase::PreFailure).unwrap();
//! let signal = det.process(&ev(2, EventKind::TraceEnd), Phase::PreFailure).unwrap();
//! assert_eq!(signal, DetectorSignal::FailurePointReached { ip: 0x400000 });
//!
//! det.begin_post_failure();
//! det.process(&ev(0, EventKind::Read { range: AddressRange::new(0x1000, 8) }), Phase::PostFailure).unwrap();
//! assert_eq!(det.diagnostics().len(), 1);
//! ```

pub mod detector;
pub mod diagnostic;
pub mod report;
pub mod symbols;

pub use detector::{Detector, DetectorSignal, DetectorStats};
pub use diagnostic::{Diagnostic, RelatedSite};
pub use report::DiagnosticReport;
pub use symbols::{Addr2Line, NoSymbols, SourceLocation, SymbolResolver};

use pmcheck_shadow::ShadowError;
use thiserror::Error;

/// Fatal errors while applying events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectError {
    #[error("event {seq} ({op}): {source}")]
    Shadow {
        seq: u64,
        op: &'static str,
        #[source]
        source: ShadowError,
    },

    #[error("post-failure event {seq} arrived with no failure point snapshot")]
    NoSnapshot { seq: u64 },

    #[error("trace end at event {seq} in the post-failure run")]
    UnexpectedTraceEnd { seq: u64 },
}
