//! Two-phase failure injection for persistent-memory programs.
//!
//! The [`Orchestrator`] runs the target under instrumentation, and every
//! time the instrumented run pauses at a failure point it:
//!
//! 1. snapshots the shadow model,
//! 2. copies the PM image to a scratch file,
//! 3. runs the recovery program against the copy (bounded by a timeout),
//!    checking each of its reads against the snapshot,
//! 4. deletes the copy and tells the paused run to continue.
//!
//! ```text
//!   Idle ─▶ PreFailureRunning ─▶ PostFailureRunning ─▶ AwaitingFailurePoint ─┐
//!                 │                      ▲                    │              │
//!                 │                      └────── TraceEnd ────┘              │
//!                 └──────────── TestingEnd ─────────────▶ Done ◀─────────────┘
//! ```
//!
//! Process control and channels sit behind the [`Launcher`] and
//! [`Transport`] traits; [`PinLauncher`] and [`FifoTransport`] are the
//! real implementations.

pub mod channel;
pub mod config;
pub mod launch;
pub mod orchestrator;
pub mod record;

pub use channel::{ChannelError, ControlSink, FifoTransport, TraceSource, Transport};
pub use config::{LaunchConfig, OrchestratorConfig};
pub use launch::{ExitOutcome, LaunchError, Launcher, PinLauncher, TargetProcess};
pub use orchestrator::{
    FailurePointRecord, Orchestrator, PostFailureOutcome, RunReport, State,
};
pub use record::{
    post_failure_path, pre_failure_path, replay_recording, RecordingSource, ReplayError,
};

use pmcheck_detector::DetectError;
use pmcheck_protocol::{Phase, ProtocolError};
use std::time::Duration;
use thiserror::Error;

/// Fatal errors that abort a run.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("malformed trace: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("trace contract violation: {0}")]
    Detect(#[from] DetectError),

    #[error("no trace data on the {phase} channel for {idle:?}")]
    ChannelTimeout { phase: Phase, idle: Duration },

    #[error("pre-failure process exited before testing completed ({outcome})")]
    PreFailureExited { outcome: ExitOutcome },

    #[error("post-failure run for failure point {index} failed ({outcome})")]
    PostFailureFailed { index: u32, outcome: ExitOutcome },

    #[error("trace recording failed: {0}")]
    Record(#[source] std::io::Error),
}
