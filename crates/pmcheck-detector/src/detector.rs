//! Event-driven consistency checking.
//!
//! The [`Detector`] owns the live shadow model for the pre-failure run
//! and, while a failure point is being checked, an independent snapshot
//! that the recovery run's events are applied to.  Every read in the
//! recovery run is judged against that snapshot.

use crate::diagnostic::Diagnostic;
use crate::symbols::{NoSymbols, SymbolResolver};
use crate::DetectError;
use log::{debug, error, info, warn};
use pmcheck_protocol::{AddressRange, EventKind, Phase, TraceEvent};
use pmcheck_shadow::{
    Finding, FindingKind, Severity, ShadowConfig, ShadowError, ShadowMemory,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What the caller should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorSignal {
    Continue,
    /// The pre-failure run is paused at a failure point.
    FailurePointReached { ip: u64 },
    /// The current run has nothing more to test.
    TestingComplete,
}

/// Counters for the end-of-run summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorStats {
    pub pre_failure_events: u64,
    pub post_failure_events: u64,
    /// Recovery reads evaluated against the correctness predicate.
    pub reads_checked: u64,
    /// Recovery reads skipped because the same range was already judged.
    pub reads_cached: u64,
    /// Recovery reads skipped inside a detection-skip region.
    pub reads_skipped: u64,
    /// Recovery reads of memory the model does not track.
    pub reads_untracked: u64,
    /// Failing reads with no traced writer.
    pub reads_unattributed: u64,
}

/// State for the failure point currently being checked.
#[derive(Debug)]
struct PostFailure {
    shadow: ShadowMemory,
    // (base, size) pairs whose verdict holds for every thread at this
    // failure point.
    checked: HashSet<(u64, u64)>,
}

/// Drives the shadow model from trace events and collects diagnostics.
pub struct Detector {
    live: ShadowMemory,
    post: Option<PostFailure>,
    failure_points: u32,
    diagnostics: Vec<Diagnostic>,
    resolver: Box<dyn SymbolResolver>,
    stats: DetectorStats,
}

impl Detector {
    pub fn new(config: ShadowConfig) -> Self {
        Self {
            live: ShadowMemory::new(config),
            post: None,
            failure_points: 0,
            diagnostics: Vec::new(),
            resolver: Box::new(NoSymbols),
            stats: DetectorStats::default(),
        }
    }

    /// Resolve diagnostic addresses through `resolver`.
    pub fn with_resolver(mut self, resolver: Box<dyn SymbolResolver>) -> Self {
        self.set_resolver(resolver);
        self
    }

    pub fn set_resolver(&mut self, resolver: Box<dyn SymbolResolver>) {
        self.resolver = resolver;
    }

    /// Snapshot the live model; post-failure events apply to the copy
    /// until [`end_post_failure`](Self::end_post_failure).
    pub fn begin_post_failure(&mut self) {
        debug!(
            "snapshot at failure point {} (epoch {})",
            self.failure_points,
            self.live.epoch()
        );
        self.post = Some(PostFailure {
            shadow: self.live.snapshot(),
            checked: HashSet::new(),
        });
    }

    /// Drop the snapshot and its check-cache.
    pub fn end_post_failure(&mut self) {
        self.post = None;
    }

    pub fn in_post_failure(&self) -> bool {
        self.post.is_some()
    }

    /// Apply one event.
    pub fn process(&mut self, event: &TraceEvent, phase: Phase) -> Result<DetectorSignal, DetectError> {
        let mut findings = Vec::new();
        let shadow = match phase {
            Phase::PreFailure => {
                self.stats.pre_failure_events += 1;
                &mut self.live
            }
            Phase::PostFailure => {
                self.stats.post_failure_events += 1;
                let post = self
                    .post
                    .as_mut()
                    .ok_or(DetectError::NoSnapshot { seq: event.seq })?;
                if let EventKind::Read { range } = event.kind {
                    findings.extend(check_read(post, event, range, &mut self.stats));
                }
                &mut post.shadow
            }
        };

        apply(shadow, event, phase).map_err(|source| DetectError::Shadow {
            seq: event.seq,
            op: event.kind.name(),
            source,
        })?;
        findings.extend(shadow.take_findings());

        let failure_point = match phase {
            Phase::PreFailure => None,
            Phase::PostFailure => Some(self.failure_points),
        };
        for finding in findings {
            self.record(finding, event, phase, failure_point);
        }

        match event.kind {
            EventKind::TraceEnd => match phase {
                Phase::PreFailure => {
                    self.failure_points += 1;
                    info!(
                        "failure point {} reached at ip={:#x}",
                        self.failure_points, event.ip
                    );
                    Ok(DetectorSignal::FailurePointReached { ip: event.ip })
                }
                Phase::PostFailure => Err(DetectError::UnexpectedTraceEnd { seq: event.seq }),
            },
            EventKind::TestingEnd => {
                debug!("{} testing complete", phase);
                Ok(DetectorSignal::TestingComplete)
            }
            _ => Ok(DetectorSignal::Continue),
        }
    }

    fn record(&mut self, finding: Finding, event: &TraceEvent, phase: Phase, failure_point: Option<u32>) {
        let diag = Diagnostic::from_finding(finding, event, phase, failure_point, self.resolver.as_ref());
        match diag.severity {
            Severity::Warn => warn!("{}: {}", diag.kind, diag.description),
            Severity::Error => error!("{}: {}", diag.kind, diag.description),
        }
        self.diagnostics.push(diag);
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Number of failure points reached so far.
    pub fn failure_points(&self) -> u32 {
        self.failure_points
    }

    pub fn stats(&self) -> &DetectorStats {
        &self.stats
    }

    /// The live (pre-failure) model.
    pub fn shadow(&self) -> &ShadowMemory {
        &self.live
    }

    /// The snapshot of the failure point being checked, if any.
    pub fn post_failure_shadow(&self) -> Option<&ShadowMemory> {
        self.post.as_ref().map(|p| &p.shadow)
    }

    /// Consume the detector, keeping what the report needs.
    pub fn into_parts(self) -> (Vec<Diagnostic>, DetectorStats, u32) {
        (self.diagnostics, self.stats, self.failure_points)
    }
}

/// Forward an event to the matching engine operation.
fn apply(shadow: &mut ShadowMemory, event: &TraceEvent, phase: Phase) -> Result<(), ShadowError> {
    let (tid, ip) = (event.tid, event.ip);
    match event.kind {
        EventKind::TraceBegin | EventKind::TraceEnd | EventKind::TestingEnd => {}
        EventKind::Read { .. } => {}
        EventKind::Write { range, non_temporal } => shadow.write(tid, range, ip, phase, non_temporal)?,
        EventKind::Flush { range } => shadow.flush(range, ip, phase)?,
        EventKind::Drain => {
            shadow.drain(phase);
        }
        EventKind::Allocate { range } => shadow.allocate(range, phase)?,
        EventKind::Deallocate { range } => shadow.deallocate(range)?,
        EventKind::TxBegin => shadow.begin_transaction(tid),
        EventKind::TxEnd => shadow.end_transaction(tid, ip, phase)?,
        EventKind::TxAddrAdd { range } => shadow.add_to_transaction(tid, range, ip, false, phase)?,
        EventKind::TxAlloc { range } => shadow.add_to_transaction(tid, range, ip, true, phase)?,
        EventKind::InternalCallEnter => shadow.enter_internal_call(tid),
        EventKind::InternalCallExit => shadow.exit_internal_call(tid)?,
        EventKind::AddCommitVar { range } => shadow.register_commit_variable(range, phase),
        EventKind::DetectionSkipBegin => shadow.disable_detection(tid)?,
        EventKind::DetectionSkipEnd => shadow.enable_detection(tid)?,
    }
    Ok(())
}

/// Judge a recovery read.  A read is correct if the data is consistent,
/// or written back and ordered before the last commit, or part of a
/// commit variable, or still logged in the reader's open transaction.
fn check_read(
    post: &mut PostFailure,
    event: &TraceEvent,
    range: AddressRange,
    stats: &mut DetectorStats,
) -> Option<Finding> {
    let shadow = &post.shadow;
    if shadow.is_detection_disabled(event.tid) {
        stats.reads_skipped += 1;
        return None;
    }
    let key = (range.base, range.size);
    if post.checked.contains(&key) {
        stats.reads_cached += 1;
        return None;
    }

    let consistent = match shadow.is_consistent(range) {
        Ok(c) => c,
        Err(_) => {
            debug!("read of untracked {} at ip={:#x}", range, event.ip);
            stats.reads_untracked += 1;
            post.checked.insert(key);
            return None;
        }
    };
    stats.reads_checked += 1;
    let written_back = !consistent && shadow.is_written_back(range).unwrap_or(false);
    if consistent
        || (written_back && shadow.is_recent_commit_update(range))
        || shadow.is_commit_variable(range)
    {
        post.checked.insert(key);
        return None;
    }
    // Protected only for the reading thread; another thread's read of the
    // same range is judged again.
    if shadow.is_added(event.tid, range) {
        return None;
    }

    post.checked.insert(key);
    let writers = shadow.last_writers(range);
    if writers.is_empty() {
        debug!("inconsistent read of {} has no traced writer", range);
        stats.reads_unattributed += 1;
        return None;
    }

    let description = if written_back {
        format!("read of {} whose last write is not ordered before the commit variable update", range)
    } else {
        format!("read of {} that was not written back before the failure", range)
    };
    Some(Finding::new(FindingKind::InconsistentRead, range, event.ip, description).with_related(writers))
}
