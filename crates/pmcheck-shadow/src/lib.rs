//! Shadow model of persistent memory.
//!
//! [`ShadowMemory`] tracks, for every known PM address range, whether the
//! data stored there is guaranteed to survive a crash:
//!
//! ```text
//!            write             flush              drain
//!   Clean ──────────▶ Modified ──────▶ WritebackPending ──────▶ WrittenBack
//!     │                  │                     │                     │
//!     └──────────────────┴─────── commit ──────┴─────────────────────┘
//!                                   ▼
//!                               Consistent
//! ```
//!
//! "Commit" is a transaction closing, a write inside trusted library code,
//! or any write in the recovery run.  A logical epoch, advanced by every
//! drain, orders modifications against the most recent update of a
//! registered commit variable.
//!
//! The engine is a plain value with no I/O and no interior locking.  It is
//! driven one event at a time and copied wholesale at each failure point.

pub mod engine;
pub mod finding;
pub mod interval;

pub use engine::{ShadowMemory, ThreadState};
pub use finding::{Finding, FindingKind, Provenance, ProvenanceRole, Severity};
pub use interval::{IntervalMap, IntervalSet};

use pmcheck_protocol::{AddressRange, ThreadId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Logical persistence time.  Advanced only by pre-failure drains.
pub type Epoch = u64;

/// Durability state of one address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DurabilityStatus {
    /// Allocated, never written.
    Clean,
    /// Written, still only in the cache.
    Modified,
    /// Flushed, waiting for a fence.
    WritebackPending,
    /// Flushed and fenced.
    WrittenBack,
    /// Committed; safe to read after a crash.
    Consistent,
}

impl DurabilityStatus {
    /// Safe to read regardless of ordering.
    pub fn is_consistent(self) -> bool {
        matches!(self, Self::Clean | Self::Consistent)
    }
}

impl fmt::Display for DurabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Clean => "clean",
            Self::Modified => "modified",
            Self::WritebackPending => "writeback-pending",
            Self::WrittenBack => "written-back",
            Self::Consistent => "consistent",
        };
        f.write_str(s)
    }
}

/// Default base of the PM window (pools are mapped at a fixed hint).
pub const DEFAULT_PM_BASE: u64 = 0x100_0000_0000;

/// Default size of the PM window.
pub const DEFAULT_PM_SIZE: u64 = 0x100_0000_0000;

/// Configuration for the shadow engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowConfig {
    /// Addresses outside this window are never persistent memory.
    pub pm_window: AddressRange,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            pm_window: AddressRange::new(DEFAULT_PM_BASE, DEFAULT_PM_SIZE),
        }
    }
}

/// A trace violated a contract the model depends on.  Always fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShadowError {
    #[error("allocation {range} overlaps already tracked PM")]
    Overlap { range: AddressRange },

    #[error("deallocation of untracked range {range}")]
    Unallocated { range: AddressRange },

    #[error("{op} of {range} outside the PM window")]
    NonPm { op: &'static str, range: AddressRange },

    #[error("zero-sized {op} at {addr:#x}")]
    ZeroSized { op: &'static str, addr: u64 },

    #[error("transaction end without matching begin on thread {tid}")]
    UnbalancedTransaction { tid: ThreadId },

    #[error("internal call exit without matching enter on thread {tid}")]
    UnbalancedCall { tid: ThreadId },

    #[error("detection already disabled on thread {tid}")]
    DetectionAlreadyDisabled { tid: ThreadId },

    #[error("detection already enabled on thread {tid}")]
    DetectionAlreadyEnabled { tid: ThreadId },

    #[error("query of untracked range {range}")]
    Untracked { range: AddressRange },
}
