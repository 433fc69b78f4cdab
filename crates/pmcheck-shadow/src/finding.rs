//! Consistency and performance findings raised while updating the model.
//!
//! Findings never change shadow state; the engine queues them and the
//! detector drains the queue after each event.

use pmcheck_protocol::AddressRange;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Performance issue; the program is still crash-consistent.
    Warn,
    /// Crash-consistency bug.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warn => f.write_str("WARN"),
            Self::Error => f.write_str("ERROR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FindingKind {
    /// Flush of a range whose writeback is already pending.
    UnnecessaryFlush,
    /// Range logged twice, or logged but never modified before commit.
    UnnecessaryAdd,
    /// Write inside a transaction to a range that was not logged first.
    ModifyBeforeAdd,
    /// Range logged after an unprotected write to it.
    AddAfterModify,
    /// Recovery read data not guaranteed durable and ordered.
    InconsistentRead,
}

impl FindingKind {
    pub fn severity(&self) -> Severity {
        match self {
            Self::UnnecessaryFlush | Self::UnnecessaryAdd => Severity::Warn,
            Self::ModifyBeforeAdd | Self::AddAfterModify | Self::InconsistentRead => {
                Severity::Error
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::UnnecessaryFlush => "unnecessary flush",
            Self::UnnecessaryAdd => "unnecessary transaction add",
            Self::ModifyBeforeAdd => "modify before transaction add",
            Self::AddAfterModify => "transaction add after modify",
            Self::InconsistentRead => "inconsistent read",
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where an earlier operation related to a finding came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvenanceRole {
    /// Last store to the range.
    Write,
    /// Transaction log of the range.
    TxAdd,
    /// Transactional allocation of the range.
    TxAlloc,
}

impl fmt::Display for ProvenanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write => f.write_str("written by"),
            Self::TxAdd => f.write_str("added by (tx add)"),
            Self::TxAlloc => f.write_str("added by (tx alloc)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub role: ProvenanceRole,
    pub range: AddressRange,
    pub ip: u64,
}

/// One raised finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    /// Range the triggering operation touched.
    pub range: AddressRange,
    /// Instruction pointer of the triggering operation.
    pub ip: u64,
    pub description: String,
    pub related: Vec<Provenance>,
}

impl Finding {
    pub fn new(kind: FindingKind, range: AddressRange, ip: u64, description: impl Into<String>) -> Self {
        Self {
            kind,
            range,
            ip,
            description: description.into(),
            related: Vec::new(),
        }
    }

    pub fn with_related(mut self, related: impl IntoIterator<Item = Provenance>) -> Self {
        self.related.extend(related);
        self
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {} at ip={:#x} ({})",
            self.severity(),
            self.kind,
            self.range,
            self.ip,
            self.description
        )
    }
}
