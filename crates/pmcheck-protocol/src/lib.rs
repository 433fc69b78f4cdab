//! Wire protocol between the PM instrumentation layer and pmcheck.
//!
//! The instrumented target (running under a dynamic binary instrumentation
//! tool) observes every persistent-memory operation and streams it to the
//! orchestrator as a dense sequence of fixed-size [`RawTraceEntry`]
//! records.  This crate defines that record, the typed [`TraceEvent`] it
//! decodes into, and the naming of the channels that carry it.
//!
//! # Transport
//!
//! Three named pipes per session:
//!
//! ```text
//! instrumented pre-failure run ──pre_fifo──▶  orchestrator
//! instrumented recovery run    ──post_fifo─▶  orchestrator
//! orchestrator ◀──signal_fifo──▶ instrumented pre-failure run
//! ```
//!
//! 1. The pre-failure run streams events until it reaches a failure point,
//!    emits `TraceEnd`, and blocks reading the signal pipe.
//! 2. The orchestrator runs recovery against a copy of the PM image and
//!    consumes the post-failure stream until `TestingEnd`.
//! 3. The orchestrator writes [`CONTINUE_SIGNAL`] and the pre-failure run
//!    proceeds to its next failure point.
//!
//! Channel names carry a session id so concurrent sessions never collide.

pub mod decoder;
pub mod events;

pub use decoder::RecordDecoder;
pub use events::{
    AddressRange, EventKind, Phase, RawTraceEntry, ThreadId, TraceEvent, WireKind,
    RAW_ENTRY_SIZE,
};

use std::path::{Path, PathBuf};
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════
//  Channel naming
// ═══════════════════════════════════════════════════════════════════════

/// Base name of the pre-failure trace pipe.
pub const PRE_FAILURE_FIFO: &str = "pmcheck_pre_fifo";

/// Base name of the post-failure trace pipe.
pub const POST_FAILURE_FIFO: &str = "pmcheck_post_fifo";

/// Base name of the bidirectional control pipe.
pub const SIGNAL_FIFO: &str = "pmcheck_signal_fifo";

/// Default directory the pipes are created in.
pub const DEFAULT_FIFO_DIR: &str = "/tmp";

/// Message that resumes a pre-failure run paused at a failure point.
pub const CONTINUE_SIGNAL: &str = "CONTINUE";

/// Longest control message the producer will read.
pub const MAX_SIGNAL_LEN: usize = 100;

/// Placeholder in the target command line that is replaced by the path of
/// the PM image the run should operate on.
pub const POOL_IMAGE_PLACEHOLDER: &str = "__POOL_IMAGE__";

/// Control message encoded the way the producer reads it (NUL-terminated).
pub fn encode_signal(message: &str) -> Vec<u8> {
    debug_assert!(message.len() < MAX_SIGNAL_LEN);
    let mut buf = Vec::with_capacity(message.len() + 1);
    buf.extend_from_slice(message.as_bytes());
    buf.push(0);
    buf
}

/// The three pipe paths belonging to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    pub pre_failure: PathBuf,
    pub post_failure: PathBuf,
    pub signal: PathBuf,
}

impl ChannelPaths {
    /// Paths for `session` under `dir`.
    pub fn for_session(dir: &Path, session: u32) -> Self {
        let name = |base: &str| dir.join(format!("{base}.{session}"));
        Self {
            pre_failure: name(PRE_FAILURE_FIFO),
            post_failure: name(POST_FAILURE_FIFO),
            signal: name(SIGNAL_FIFO),
        }
    }

    pub fn all(&self) -> [&Path; 3] {
        [&self.pre_failure, &self.post_failure, &self.signal]
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

/// A record on the wire violates the producer contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid trace record (kind 0) at record {index}")]
    InvalidRecord { index: u64 },

    #[error("unknown trace record kind {kind} at record {index}")]
    UnknownKind { kind: u32, index: u64 },

    #[error("negative thread id {tid} at record {index}")]
    BadThreadId { tid: i32, index: u64 },

    #[error("thread id {tid} of event {index} does not fit the wire format")]
    UnencodableThreadId { tid: u32, index: u64 },

    #[error("stream ended inside a record ({0} trailing bytes)")]
    Truncated(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_paths_are_distinct_per_session() {
        let a = ChannelPaths::for_session(Path::new("/tmp"), 1);
        let b = ChannelPaths::for_session(Path::new("/tmp"), 2);
        assert_ne!(a, b);
        assert_eq!(a.pre_failure, PathBuf::from("/tmp/pmcheck_pre_fifo.1"));
        assert_eq!(b.signal, PathBuf::from("/tmp/pmcheck_signal_fifo.2"));
    }

    #[test]
    fn signal_is_nul_terminated() {
        let buf = encode_signal(CONTINUE_SIGNAL);
        assert_eq!(buf.last(), Some(&0));
        assert_eq!(&buf[..buf.len() - 1], b"CONTINUE");
    }
}
