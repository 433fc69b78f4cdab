//! The shadow memory engine.

use crate::finding::{Finding, FindingKind, Provenance, ProvenanceRole};
use crate::interval::{IntervalMap, IntervalSet};
use crate::{DurabilityStatus, Epoch, ShadowConfig, ShadowError};
use log::{debug, trace};
use pmcheck_protocol::{AddressRange, Phase, ThreadId};
use std::collections::BTreeMap;

/// Who logged a range into the current transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddedBy {
    pub ip: u64,
    /// Logged by a transactional allocation rather than an explicit add.
    pub allocation: bool,
}

impl AddedBy {
    fn role(&self) -> ProvenanceRole {
        if self.allocation {
            ProvenanceRole::TxAlloc
        } else {
            ProvenanceRole::TxAdd
        }
    }
}

/// Per-thread transaction and region bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ThreadState {
    /// Transaction nesting depth.
    pub tx_depth: u32,
    /// Ranges logged in the open transaction.
    pub added: IntervalSet,
    pub added_by: IntervalMap<AddedBy>,
    /// Ranges written in the open transaction without being logged first.
    pub unlogged_writes: IntervalSet,
    /// Nesting depth of trusted library calls.
    pub internal_depth: u32,
    pub detection_disabled: bool,
}

impl ThreadState {
    pub fn in_transaction(&self) -> bool {
        self.tx_depth > 0
    }

    pub fn in_internal_call(&self) -> bool {
        self.internal_depth > 0
    }

    fn close_transaction(&mut self) {
        self.added.clear();
        self.added_by.clear();
        self.unlogged_writes.clear();
    }

    fn added_provenance(&self, range: AddressRange) -> Vec<Provenance> {
        // First entry per role, as the earlier-add report only needs one.
        let mut out: Vec<Provenance> = Vec::new();
        for (piece, by) in self.added_by.overlapping(range) {
            if !out.iter().any(|p| p.role == by.role()) {
                out.push(Provenance {
                    role: by.role(),
                    range: piece,
                    ip: by.ip,
                });
            }
        }
        out
    }
}

/// Durability and ordering state of every tracked PM range.
///
/// Cloning yields a fully independent copy; [`ShadowMemory::snapshot`]
/// additionally resets the per-thread region counters for a recovery run.
#[derive(Debug, Clone)]
pub struct ShadowMemory {
    config: ShadowConfig,
    status: IntervalMap<DurabilityStatus>,
    modified_at: IntervalMap<Epoch>,
    last_writer: IntervalMap<u64>,
    commit_vars: IntervalSet,
    /// Epoch of the latest commit-variable write, if any.
    commit_epoch: Option<Epoch>,
    epoch: Epoch,
    threads: BTreeMap<ThreadId, ThreadState>,
    findings: Vec<Finding>,
}

impl Default for ShadowMemory {
    fn default() -> Self {
        Self::new(ShadowConfig::default())
    }
}

impl ShadowMemory {
    pub fn new(config: ShadowConfig) -> Self {
        Self {
            config,
            status: IntervalMap::new(),
            modified_at: IntervalMap::new(),
            last_writer: IntervalMap::new(),
            commit_vars: IntervalSet::new(),
            commit_epoch: None,
            epoch: 0,
            threads: BTreeMap::new(),
            findings: Vec::new(),
        }
    }

    pub fn config(&self) -> &ShadowConfig {
        &self.config
    }

    /// Independent copy for a post-failure run.
    ///
    /// Interval maps, per-thread logged/unlogged sets, the epoch and the
    /// commit registry are carried over.  Nesting counters start at zero
    /// and queued findings stay with the original.
    pub fn snapshot(&self) -> Self {
        let mut copy = self.clone();
        for state in copy.threads.values_mut() {
            state.tx_depth = 0;
            state.internal_depth = 0;
            state.detection_disabled = false;
        }
        copy.findings.clear();
        copy
    }

    /// Drain the findings raised since the last call.
    pub fn take_findings(&mut self) -> Vec<Finding> {
        std::mem::take(&mut self.findings)
    }

    fn thread_mut(threads: &mut BTreeMap<ThreadId, ThreadState>, tid: ThreadId) -> &mut ThreadState {
        threads.entry(tid).or_default()
    }

    fn check_pm(&self, op: &'static str, range: AddressRange) -> Result<(), ShadowError> {
        if self.config.pm_window.contains_range(&range) {
            Ok(())
        } else {
            Err(ShadowError::NonPm { op, range })
        }
    }

    // ───────────────────────────────────────────────────────────────
    //  Address space
    // ───────────────────────────────────────────────────────────────

    /// Start tracking `range` as `Clean`.  No-op after a failure: the
    /// recovery run inherits the address space.
    pub fn allocate(&mut self, range: AddressRange, phase: Phase) -> Result<(), ShadowError> {
        if range.is_empty() {
            return Err(ShadowError::ZeroSized {
                op: "allocation",
                addr: range.base,
            });
        }
        if phase == Phase::PostFailure {
            return Ok(());
        }
        if self.status.intersects(range) {
            return Err(ShadowError::Overlap { range });
        }
        debug!("allocate {}", range);
        self.status.assign(range, DurabilityStatus::Clean);
        Ok(())
    }

    /// Stop tracking `range`.  The whole range must be tracked.
    pub fn deallocate(&mut self, range: AddressRange) -> Result<(), ShadowError> {
        if !self.status.covers(range) {
            return Err(ShadowError::Unallocated { range });
        }
        debug!("deallocate {}", range);
        self.status.remove(range);
        self.modified_at.remove(range);
        self.last_writer.remove(range);
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────
    //  Memory operations
    // ───────────────────────────────────────────────────────────────

    /// Apply a store to `range`.
    pub fn write(
        &mut self,
        tid: ThreadId,
        range: AddressRange,
        ip: u64,
        phase: Phase,
        non_temporal: bool,
    ) -> Result<(), ShadowError> {
        self.check_pm("write", range)?;
        if range.is_empty() {
            return Ok(());
        }

        if phase == Phase::PreFailure && self.commit_vars.contains(range) {
            debug!("commit variable {} updated at epoch {}", range, self.epoch);
            self.commit_epoch = Some(self.epoch);
        }
        self.last_writer.assign(range, ip);
        self.modified_at.assign(range, self.epoch);

        let thread = Self::thread_mut(&mut self.threads, tid);
        let trusted = phase == Phase::PostFailure || thread.detection_disabled;
        if trusted || thread.in_internal_call() {
            trace!("{} trusted write {}", tid, range);
            self.status.assign(range, DurabilityStatus::Consistent);
            return Ok(());
        }

        if thread.in_transaction() && !thread.added.contains(range) {
            thread.unlogged_writes.insert(range);
            self.findings.push(Finding::new(
                FindingKind::ModifyBeforeAdd,
                range,
                ip,
                format!("{} wrote {} inside a transaction without logging it first", tid, range),
            ));
        }

        let status = if non_temporal {
            DurabilityStatus::WritebackPending
        } else {
            DurabilityStatus::Modified
        };
        self.status.assign(range, status);
        Ok(())
    }

    /// Start writeback of the modified parts of `range`.  Ignored after a
    /// failure.
    pub fn flush(&mut self, range: AddressRange, ip: u64, phase: Phase) -> Result<(), ShadowError> {
        if phase == Phase::PostFailure {
            return Ok(());
        }
        self.check_pm("flush", range)?;

        let mut pending = false;
        let mut modified = Vec::new();
        for (piece, status) in self.status.overlapping(range) {
            match status {
                DurabilityStatus::WritebackPending => pending = true,
                DurabilityStatus::Modified => modified.push(piece),
                _ => {}
            }
        }

        if pending {
            let related = self.last_writers(range);
            self.findings.push(
                Finding::new(
                    FindingKind::UnnecessaryFlush,
                    range,
                    ip,
                    format!("{} already has a writeback pending", range),
                )
                .with_related(related),
            );
        }
        for piece in modified {
            self.status.assign(piece, DurabilityStatus::WritebackPending);
        }
        Ok(())
    }

    /// Complete every pending writeback.  Advances the epoch before a
    /// failure only.  Returns the number of pieces that became durable.
    pub fn drain(&mut self, phase: Phase) -> usize {
        let mut drained = 0;
        for status in self.status.values_mut() {
            if *status == DurabilityStatus::WritebackPending {
                *status = DurabilityStatus::WrittenBack;
                drained += 1;
            }
        }
        if phase == Phase::PreFailure {
            self.epoch += 1;
        }
        trace!("drain: {} pieces written back, epoch {}", drained, self.epoch);
        drained
    }

    // ───────────────────────────────────────────────────────────────
    //  Transactions
    // ───────────────────────────────────────────────────────────────

    pub fn begin_transaction(&mut self, tid: ThreadId) {
        let thread = Self::thread_mut(&mut self.threads, tid);
        thread.tx_depth += 1;
        trace!("{} tx depth {}", tid, thread.tx_depth);
    }

    /// Close one transaction level.  Closing the outermost level commits
    /// every logged range.
    pub fn end_transaction(&mut self, tid: ThreadId, ip: u64, phase: Phase) -> Result<(), ShadowError> {
        let thread = Self::thread_mut(&mut self.threads, tid);
        if thread.tx_depth == 0 {
            return Err(ShadowError::UnbalancedTransaction { tid });
        }
        thread.tx_depth -= 1;
        if thread.tx_depth > 0 {
            return Ok(());
        }

        let logged: Vec<AddressRange> = thread.added.iter().collect();
        for &range in &logged {
            let never_modified = self
                .status
                .overlapping(range)
                .all(|(_, status)| status.is_consistent());
            if phase == Phase::PreFailure && never_modified {
                self.findings.push(
                    Finding::new(
                        FindingKind::UnnecessaryAdd,
                        range,
                        ip,
                        format!("{} was logged but never modified", range),
                    )
                    .with_related(thread.added_provenance(range)),
                );
            }
            self.status.assign(range, DurabilityStatus::Consistent);
        }
        debug!("{} committed {} logged ranges", tid, logged.len());
        thread.close_transaction();
        Ok(())
    }

    /// Log `range` into the thread's open transaction.
    pub fn add_to_transaction(
        &mut self,
        tid: ThreadId,
        range: AddressRange,
        ip: u64,
        allocation: bool,
        phase: Phase,
    ) -> Result<(), ShadowError> {
        if range.is_empty() {
            return Err(ShadowError::ZeroSized {
                op: "transaction add",
                addr: range.base,
            });
        }
        let related_writes: Vec<Provenance> = self
            .last_writer
            .overlapping(range)
            .map(|(piece, &wip)| Provenance {
                role: ProvenanceRole::Write,
                range: piece,
                ip: wip,
            })
            .collect();

        let thread = Self::thread_mut(&mut self.threads, tid);
        if thread.unlogged_writes.contains(range) {
            self.findings.push(
                Finding::new(
                    FindingKind::AddAfterModify,
                    range,
                    ip,
                    format!("{} logged after it was already modified", range),
                )
                .with_related(related_writes),
            );
        }
        if phase == Phase::PreFailure && thread.added.contains(range) {
            self.findings.push(
                Finding::new(
                    FindingKind::UnnecessaryAdd,
                    range,
                    ip,
                    format!("{} already logged in this transaction", range),
                )
                .with_related(thread.added_provenance(range)),
            );
        }

        thread.added.insert(range);
        thread.added_by.assign(range, AddedBy { ip, allocation });
        Ok(())
    }

    /// Whether `range` is logged in the thread's open transaction.
    pub fn is_added(&self, tid: ThreadId, range: AddressRange) -> bool {
        self.threads
            .get(&tid)
            .is_some_and(|t| t.added.contains(range))
    }

    // ───────────────────────────────────────────────────────────────
    //  Trusted regions
    // ───────────────────────────────────────────────────────────────

    pub fn enter_internal_call(&mut self, tid: ThreadId) {
        Self::thread_mut(&mut self.threads, tid).internal_depth += 1;
    }

    pub fn exit_internal_call(&mut self, tid: ThreadId) -> Result<(), ShadowError> {
        let thread = Self::thread_mut(&mut self.threads, tid);
        if thread.internal_depth == 0 {
            return Err(ShadowError::UnbalancedCall { tid });
        }
        thread.internal_depth -= 1;
        Ok(())
    }

    pub fn disable_detection(&mut self, tid: ThreadId) -> Result<(), ShadowError> {
        let thread = Self::thread_mut(&mut self.threads, tid);
        if thread.detection_disabled {
            return Err(ShadowError::DetectionAlreadyDisabled { tid });
        }
        thread.detection_disabled = true;
        Ok(())
    }

    pub fn enable_detection(&mut self, tid: ThreadId) -> Result<(), ShadowError> {
        let thread = Self::thread_mut(&mut self.threads, tid);
        if !thread.detection_disabled {
            return Err(ShadowError::DetectionAlreadyEnabled { tid });
        }
        thread.detection_disabled = false;
        Ok(())
    }

    pub fn is_detection_disabled(&self, tid: ThreadId) -> bool {
        self.threads.get(&tid).is_some_and(|t| t.detection_disabled)
    }

    // ───────────────────────────────────────────────────────────────
    //  Commit variables
    // ───────────────────────────────────────────────────────────────

    /// Register `range` as a commit variable.  Only meaningful before a
    /// failure.
    pub fn register_commit_variable(&mut self, range: AddressRange, phase: Phase) {
        if phase == Phase::PreFailure {
            debug!("commit variable {}", range);
            self.commit_vars.insert(range);
        }
    }

    /// Whether `range` touches a registered commit variable.
    pub fn is_commit_variable(&self, range: AddressRange) -> bool {
        self.commit_vars.intersects(range)
    }

    /// Whether the last modification of `range` happened before the most
    /// recent commit-variable update.  Vacuously true with no commit yet.
    pub fn is_recent_commit_update(&self, range: AddressRange) -> bool {
        let Some(commit) = self.commit_epoch else {
            return true;
        };
        match self.modified_at.overlapping(range).map(|(_, &e)| e).max() {
            Some(latest) => commit > latest,
            None => true,
        }
    }

    // ───────────────────────────────────────────────────────────────
    //  Queries
    // ───────────────────────────────────────────────────────────────

    /// Every tracked part of `range` is `Clean` or `Consistent`.
    pub fn is_consistent(&self, range: AddressRange) -> Result<bool, ShadowError> {
        self.all_tracked(range, |s| s.is_consistent())
    }

    /// Every tracked part of `range` is exactly `WrittenBack`.
    pub fn is_written_back(&self, range: AddressRange) -> Result<bool, ShadowError> {
        self.all_tracked(range, |s| s == DurabilityStatus::WrittenBack)
    }

    fn all_tracked(
        &self,
        range: AddressRange,
        pred: impl Fn(DurabilityStatus) -> bool,
    ) -> Result<bool, ShadowError> {
        let mut seen = false;
        let mut ok = true;
        for (_, &status) in self.status.overlapping(range) {
            seen = true;
            ok &= pred(status);
        }
        if seen {
            Ok(ok)
        } else {
            Err(ShadowError::Untracked { range })
        }
    }

    /// Status pieces overlapping `range`.
    pub fn status_of(&self, range: AddressRange) -> Vec<(AddressRange, DurabilityStatus)> {
        self.status.overlapping(range).map(|(r, &s)| (r, s)).collect()
    }

    /// Last writer of each piece of `range`.
    pub fn last_writers(&self, range: AddressRange) -> Vec<Provenance> {
        self.last_writer
            .overlapping(range)
            .map(|(piece, &ip)| Provenance {
                role: ProvenanceRole::Write,
                range: piece,
                ip,
            })
            .collect()
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn commit_epoch(&self) -> Option<Epoch> {
        self.commit_epoch
    }

    pub fn thread(&self, tid: ThreadId) -> Option<&ThreadState> {
        self.threads.get(&tid)
    }
}
