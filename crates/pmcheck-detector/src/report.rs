//! End-of-run diagnostic report.

use crate::detector::{Detector, DetectorStats};
use crate::diagnostic::Diagnostic;
use pmcheck_shadow::Severity;
use serde::{Deserialize, Serialize};

/// Everything the detector found during one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub failure_points: u32,
    pub stats: DetectorStats,
    pub diagnostics: Vec<Diagnostic>,
}

impl DiagnosticReport {
    pub fn from_detector(detector: Detector) -> Self {
        let (diagnostics, stats, failure_points) = detector.into_parts();
        Self {
            failure_points,
            stats,
            diagnostics,
        }
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.severity == Severity::Warn)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.severity == Severity::Error)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable report: summary, then warnings, then errors.
    pub fn render(&self) -> String {
        let mut output = String::new();

        output.push_str("═══════════════════════════════════════════════════════════════════════\n");
        output.push_str("  pmcheck Crash-Consistency Report\n");
        output.push_str("═══════════════════════════════════════════════════════════════════════\n\n");

        let warnings: Vec<_> = self.warnings().collect();
        let errors: Vec<_> = self.errors().collect();

        output.push_str(&format!("Failure points tested:  {}\n", self.failure_points));
        output.push_str(&format!("Pre-failure events:     {}\n", self.stats.pre_failure_events));
        output.push_str(&format!("Post-failure events:    {}\n", self.stats.post_failure_events));
        output.push_str(&format!("Reads checked:          {}\n", self.stats.reads_checked));
        output.push_str(&format!("Performance warnings:   {}\n", warnings.len()));
        output.push_str(&format!("Consistency errors:     {}\n", errors.len()));
        output.push('\n');

        if !warnings.is_empty() {
            output.push_str("─── Performance Warnings ──────────────────────────────────────────────\n");
            for (i, diag) in warnings.iter().enumerate() {
                output.push_str(&format!("\n{}. {}", i + 1, diag));
            }
            output.push('\n');
        }

        if !errors.is_empty() {
            output.push_str("─── Consistency Errors ────────────────────────────────────────────────\n");
            for (i, diag) in errors.iter().enumerate() {
                output.push_str(&format!("\n{}. {}", i + 1, diag));
            }
            output.push('\n');
        } else {
            output.push_str("─── No Consistency Errors ─────────────────────────────────────────────\n");
            output.push_str("No inconsistent recovery reads or transaction misuse detected.\n\n");
        }

        output.push_str("═══════════════════════════════════════════════════════════════════════\n");
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::SourceLocation;
    use pmcheck_protocol::{AddressRange, EventKind, Phase, ThreadId, TraceEvent};
    use pmcheck_shadow::FindingKind;

    fn diag(kind: FindingKind) -> Diagnostic {
        Diagnostic {
            severity: kind.severity(),
            kind,
            phase: Phase::PostFailure,
            failure_point: Some(3),
            event: TraceEvent {
                seq: 9,
                tid: ThreadId(2),
                ip: 0x401234,
                kind: EventKind::Read { range: AddressRange::new(0x1000, 8) },
            },
            description: "read of [0x1000, 0x1008) that was not written back before the failure".into(),
            location: Some(SourceLocation {
                file: "recover.c".into(),
                line: 42,
            }),
            related: Vec::new(),
        }
    }

    #[test]
    fn render_lists_warnings_then_errors() {
        let report = DiagnosticReport {
            failure_points: 3,
            stats: DetectorStats::default(),
            diagnostics: vec![diag(FindingKind::InconsistentRead), diag(FindingKind::UnnecessaryFlush)],
        };
        let text = report.render();
        assert!(text.contains("Failure points tested:  3"));
        assert!(text.contains("Consistency errors:     1"));
        let warn_at = text.find("Performance Warnings").unwrap();
        let err_at = text.find("Consistency Errors ─").unwrap();
        assert!(warn_at < err_at);
        assert!(text.contains("recover.c:42"));
        assert!(report.has_errors());
    }

    #[test]
    fn render_without_errors() {
        let report = DiagnosticReport::default();
        assert!(report.render().contains("No Consistency Errors"));
        assert!(!report.has_errors());
    }

    #[test]
    fn json_carries_diagnostics() {
        let report = DiagnosticReport {
            failure_points: 1,
            stats: DetectorStats::default(),
            diagnostics: vec![diag(FindingKind::ModifyBeforeAdd)],
        };
        let json = report.to_json().unwrap();
        assert!(json.contains("ModifyBeforeAdd"));
        assert_eq!(serde_json::from_str::<DiagnosticReport>(&json).unwrap(), report);
    }
}
