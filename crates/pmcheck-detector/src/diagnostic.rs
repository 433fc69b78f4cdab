//! Diagnostics surfaced to the user.

use crate::symbols::{SourceLocation, SymbolResolver};
use pmcheck_protocol::{AddressRange, Phase, TraceEvent};
use pmcheck_shadow::{Finding, FindingKind, Provenance, Severity};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An earlier operation related to a diagnostic (last writer, earlier add).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedSite {
    pub label: String,
    pub range: AddressRange,
    pub ip: u64,
    pub location: Option<SourceLocation>,
}

impl RelatedSite {
    fn from_provenance(p: &Provenance, resolver: &dyn SymbolResolver) -> Self {
        Self {
            label: p.role.to_string(),
            range: p.range,
            ip: p.ip,
            location: resolver.resolve(p.ip),
        }
    }
}

/// One consistency or performance issue, with everything needed to
/// report it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: FindingKind,
    pub phase: Phase,
    /// Failure point being checked (1-based); `None` before any failure.
    pub failure_point: Option<u32>,
    pub event: TraceEvent,
    pub description: String,
    /// Source location of the triggering instruction.
    pub location: Option<SourceLocation>,
    pub related: Vec<RelatedSite>,
}

impl Diagnostic {
    pub(crate) fn from_finding(
        finding: Finding,
        event: &TraceEvent,
        phase: Phase,
        failure_point: Option<u32>,
        resolver: &dyn SymbolResolver,
    ) -> Self {
        Self {
            severity: finding.severity(),
            kind: finding.kind,
            phase,
            failure_point,
            event: event.clone(),
            location: resolver.resolve(finding.ip),
            related: finding
                .related
                .iter()
                .map(|p| RelatedSite::from_provenance(p, resolver))
                .collect(),
            description: finding.description,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.kind)?;
        if let Some(fp) = self.failure_point {
            write!(f, " (failure point {}, {})", fp, self.phase)?;
        }
        writeln!(f)?;
        writeln!(f, "    {}", self.description)?;
        write!(f, "    at ip={:#x}", self.event.ip)?;
        if let Some(loc) = &self.location {
            write!(f, " ({})", loc)?;
        }
        writeln!(f, " on {}", self.event.tid)?;
        for site in &self.related {
            write!(f, "    {} ip={:#x} {}", site.label, site.ip, site.range)?;
            if let Some(loc) = &site.location {
                write!(f, " ({})", loc)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
