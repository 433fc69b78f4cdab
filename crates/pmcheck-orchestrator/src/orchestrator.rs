//! The two-phase failure-injection loop.

use crate::channel::{ControlSink, TraceSource, Transport};
use crate::config::OrchestratorConfig;
use crate::launch::{ExitOutcome, Launcher, TargetProcess};
use crate::record::{post_failure_path, pre_failure_path, RecordingSource};
use crate::OrchestratorError;
use log::{debug, info, warn};
use pmcheck_detector::{
    Detector, DetectorSignal, DiagnosticReport, SymbolResolver,
};
use pmcheck_protocol::{Phase, RecordDecoder, TraceEvent, RAW_ENTRY_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    /// Pre-failure run started, no failure point reached yet.
    PreFailureRunning,
    /// Pre-failure run resumed after a failure point.
    AwaitingFailurePoint,
    PostFailureRunning,
    Done,
}

/// How one recovery run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostFailureOutcome {
    /// Sent its testing-end marker and exited cleanly.
    Completed,
    /// Exited cleanly without a testing-end marker.
    ExitedEarly,
    /// Killed after exceeding the post-failure timeout.
    TimedOut,
    /// Exited non-zero or was killed by someone else.
    Failed(ExitOutcome),
}

impl fmt::Display for PostFailureOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::ExitedEarly => write!(f, "exited early"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Failed(exit) => write!(f, "failed ({})", exit),
        }
    }
}

/// One failure point and its recovery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePointRecord {
    /// 1-based.
    pub index: u32,
    /// Instruction at which the pre-failure run paused.
    pub ip: u64,
    /// Pre-failure time since the previous failure point (or start).
    pub pre_failure_ms: u64,
    pub post_failure_ms: u64,
    pub outcome: PostFailureOutcome,
}

/// Result of a complete session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub failure_points: Vec<FailurePointRecord>,
    pub total_ms: u64,
    pub diagnostics: DiagnosticReport,
}

impl RunReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Diagnostic report followed by the per-failure-point timings.
    pub fn render(&self) -> String {
        let mut output = self.diagnostics.render();

        output.push_str("\n─── Failure Points ────────────────────────────────────────────────────\n");
        if self.failure_points.is_empty() {
            output.push_str("(none reached)\n");
        }
        for fp in &self.failure_points {
            output.push_str(&format!(
                "#{:<4} ip={:#x}  pre {} ms  post {} ms  {}\n",
                fp.index, fp.ip, fp.pre_failure_ms, fp.post_failure_ms, fp.outcome
            ));
        }
        output.push_str(&format!("\nTotal time:             {} ms\n", self.total_ms));
        output
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().try_into().unwrap_or(u64::MAX)
}

// ═══════════════════════════════════════════════════════════════════════
//  Event stream
// ═══════════════════════════════════════════════════════════════════════

/// Decodes events from a non-blocking trace source.
struct EventStream {
    source: Box<dyn TraceSource>,
    decoder: RecordDecoder,
    pending: VecDeque<TraceEvent>,
    buf: Vec<u8>,
    last_data: Instant,
}

impl EventStream {
    fn new(source: Box<dyn TraceSource>) -> Self {
        Self {
            source,
            decoder: RecordDecoder::new(),
            pending: VecDeque::new(),
            buf: vec![0; RAW_ENTRY_SIZE * 1024],
            last_data: Instant::now(),
        }
    }

    /// Next decoded event, or `None` if the channel has nothing right now.
    fn poll(&mut self) -> Result<Option<TraceEvent>, OrchestratorError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            let n = self.source.read_available(&mut self.buf)?;
            if n == 0 {
                return Ok(None);
            }
            self.last_data = Instant::now();
            self.pending.extend(self.decoder.feed(&self.buf[..n])?);
        }
    }

    /// Time since bytes last arrived.
    fn idle(&self) -> Duration {
        self.last_data.elapsed()
    }

    /// Restart the idle clock after the producer was held paused.
    fn reset_idle(&mut self) {
        self.last_data = Instant::now();
    }

    /// Bytes of a partial record left when the channel was abandoned.
    fn close(&self, phase: Phase) -> usize {
        let torn = self.decoder.pending_bytes();
        debug!("{} stream closed after {} records", phase, self.decoder.records_seen());
        if torn > 0 {
            warn!("{} stream ended inside a record, {} bytes dropped", phase, torn);
        }
        torn
    }
}

fn settle(exit: ExitOutcome, saw_end: bool) -> PostFailureOutcome {
    match (exit.success(), saw_end) {
        (true, true) => PostFailureOutcome::Completed,
        (true, false) => PostFailureOutcome::ExitedEarly,
        (false, _) => PostFailureOutcome::Failed(exit),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Orchestrator
// ═══════════════════════════════════════════════════════════════════════

/// Drives the pre-failure run, a recovery run per failure point, and the
/// detector that judges them.
pub struct Orchestrator<L, T> {
    config: OrchestratorConfig,
    launcher: L,
    transport: T,
    detector: Detector,
    state: State,
    records: Vec<FailurePointRecord>,
}

impl<L: Launcher, T: Transport> Orchestrator<L, T> {
    pub fn new(config: OrchestratorConfig, launcher: L, transport: T) -> Self {
        let detector = Detector::new(config.shadow.clone());
        Self {
            config,
            launcher,
            transport,
            detector,
            state: State::Idle,
            records: Vec::new(),
        }
    }

    /// Resolve diagnostic addresses through `resolver`.
    pub fn with_resolver(mut self, resolver: Box<dyn SymbolResolver>) -> Self {
        self.detector.set_resolver(resolver);
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    pub fn records(&self) -> &[FailurePointRecord] {
        &self.records
    }

    fn set_state(&mut self, state: State) {
        debug!("state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Run the whole session.  On any fatal error the pre-failure process
    /// is killed before the error is returned.
    pub fn run(&mut self) -> Result<RunReport, OrchestratorError> {
        let started = Instant::now();
        info!("starting pre-failure run");

        let source = self.transport.open_pre_failure()?;
        let source = self.recorded(source, pre_failure_path)?;
        let mut stream = EventStream::new(source);
        let mut control = self.transport.open_control()?;
        let mut pre = self.launcher.spawn_pre_failure()?;
        self.set_state(State::PreFailureRunning);

        let result = self.drive(pre.as_mut(), &mut stream, control.as_mut());
        stream.close(Phase::PreFailure);
        self.set_state(State::Done);
        if let Err(e) = &result {
            warn!("aborting: {}", e);
            if let Err(kill_err) = pre.kill().and_then(|()| pre.wait().map(drop)) {
                warn!("failed to stop pre-failure process {}: {}", pre.pid(), kill_err);
            }
        }
        result?;

        let report = RunReport {
            failure_points: self.records.clone(),
            total_ms: millis(started.elapsed()),
            diagnostics: DiagnosticReport {
                failure_points: self.detector.failure_points(),
                stats: self.detector.stats().clone(),
                diagnostics: self.detector.diagnostics().to_vec(),
            },
        };
        info!(
            "testing complete: {} failure points, {} diagnostics in {} ms",
            report.failure_points.len(),
            report.diagnostics.diagnostics.len(),
            report.total_ms
        );
        Ok(report)
    }

    fn recorded(
        &self,
        source: Box<dyn TraceSource>,
        path: impl FnOnce(&Path) -> PathBuf,
    ) -> Result<Box<dyn TraceSource>, OrchestratorError> {
        match &self.config.record_dir {
            None => Ok(source),
            Some(dir) => {
                let recording =
                    RecordingSource::create(source, &path(dir)).map_err(OrchestratorError::Record)?;
                Ok(Box::new(recording))
            }
        }
    }

    fn drive(
        &mut self,
        pre: &mut dyn TargetProcess,
        stream: &mut EventStream,
        control: &mut dyn ControlSink,
    ) -> Result<(), OrchestratorError> {
        let mut segment = Instant::now();
        loop {
            let event = self.next_pre_failure_event(pre, stream)?;
            match self.detector.process(&event, Phase::PreFailure)? {
                DetectorSignal::Continue => {}
                DetectorSignal::FailurePointReached { ip } => {
                    let index = self.detector.failure_points();
                    let pre_failure_ms = millis(segment.elapsed());

                    self.set_state(State::PostFailureRunning);
                    let post_started = Instant::now();
                    let outcome = self.check_failure_point(index)?;
                    let post_failure_ms = millis(post_started.elapsed());
                    info!("failure point {} checked ({}, {} ms)", index, outcome, post_failure_ms);

                    self.records.push(FailurePointRecord {
                        index,
                        ip,
                        pre_failure_ms,
                        post_failure_ms,
                        outcome,
                    });
                    control.send_continue()?;
                    stream.reset_idle();
                    self.set_state(State::AwaitingFailurePoint);
                    segment = Instant::now();
                }
                DetectorSignal::TestingComplete => {
                    self.reap_pre_failure(pre)?;
                    return Ok(());
                }
            }
        }
    }

    fn next_pre_failure_event(
        &self,
        pre: &mut dyn TargetProcess,
        stream: &mut EventStream,
    ) -> Result<TraceEvent, OrchestratorError> {
        loop {
            if let Some(event) = stream.poll()? {
                return Ok(event);
            }
            if let Some(outcome) = pre.try_wait()? {
                // Records written just before exit may still be buffered.
                if let Some(event) = stream.poll()? {
                    return Ok(event);
                }
                return Err(OrchestratorError::PreFailureExited { outcome });
            }
            let idle = stream.idle();
            if idle > self.config.idle_timeout {
                return Err(OrchestratorError::ChannelTimeout {
                    phase: Phase::PreFailure,
                    idle,
                });
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    /// Snapshot, run recovery on a scratch image, drop the snapshot.
    fn check_failure_point(&mut self, index: u32) -> Result<PostFailureOutcome, OrchestratorError> {
        self.detector.begin_post_failure();
        let result = self.recover_on_scratch_image(index);
        self.detector.end_post_failure();

        let outcome = result?;
        if let PostFailureOutcome::Failed(exit) = outcome {
            return Err(OrchestratorError::PostFailureFailed {
                index,
                outcome: exit,
            });
        }
        Ok(outcome)
    }

    fn recover_on_scratch_image(&mut self, index: u32) -> Result<PostFailureOutcome, OrchestratorError> {
        let image = self.launcher.prepare_image()?;
        let result = self.run_recovery(index, &image);
        if let Err(e) = self.launcher.discard_image(&image) {
            warn!("{}", e);
        }
        result
    }

    fn run_recovery(&mut self, index: u32, image: &Path) -> Result<PostFailureOutcome, OrchestratorError> {
        let mut post = self.launcher.spawn_post_failure(image)?;
        let result = match self.open_recovery_stream(index) {
            Ok(mut stream) => {
                let result = self.pump_recovery(post.as_mut(), &mut stream);
                stream.close(Phase::PostFailure);
                result
            }
            Err(e) => Err(e),
        };
        if result.is_err() {
            if let Err(e) = post.kill().and_then(|()| post.wait().map(drop)) {
                warn!("failed to stop post-failure process {}: {}", post.pid(), e);
            }
        }
        result
    }

    fn open_recovery_stream(&mut self, index: u32) -> Result<EventStream, OrchestratorError> {
        let source = self.transport.open_post_failure()?;
        let source = self.recorded(source, |dir| post_failure_path(dir, index))?;
        Ok(EventStream::new(source))
    }

    fn pump_recovery(
        &mut self,
        post: &mut dyn TargetProcess,
        stream: &mut EventStream,
    ) -> Result<PostFailureOutcome, OrchestratorError> {
        let deadline = Instant::now() + self.config.post_timeout;
        loop {
            if let Some(event) = stream.poll()? {
                if self.detector.process(&event, Phase::PostFailure)? == DetectorSignal::TestingComplete {
                    return self.await_recovery_exit(post, deadline);
                }
                continue;
            }
            if let Some(exit) = post.try_wait()? {
                let mut saw_end = false;
                while let Some(event) = stream.poll()? {
                    if self.detector.process(&event, Phase::PostFailure)? == DetectorSignal::TestingComplete {
                        saw_end = true;
                        break;
                    }
                }
                if !saw_end {
                    debug!("post-failure process {} exited before testing end ({})", post.pid(), exit);
                }
                return Ok(settle(exit, saw_end));
            }
            if Instant::now() >= deadline {
                return self.kill_recovery(post);
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn await_recovery_exit(
        &self,
        post: &mut dyn TargetProcess,
        deadline: Instant,
    ) -> Result<PostFailureOutcome, OrchestratorError> {
        loop {
            if let Some(exit) = post.try_wait()? {
                return Ok(settle(exit, true));
            }
            if Instant::now() >= deadline {
                return self.kill_recovery(post);
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn kill_recovery(&self, post: &mut dyn TargetProcess) -> Result<PostFailureOutcome, OrchestratorError> {
        warn!(
            "post-failure process {} exceeded {:?}, killing it",
            post.pid(),
            self.config.post_timeout
        );
        post.kill()?;
        post.wait()?;
        Ok(PostFailureOutcome::TimedOut)
    }

    fn reap_pre_failure(&self, pre: &mut dyn TargetProcess) -> Result<(), OrchestratorError> {
        let deadline = Instant::now() + self.config.pre_exit_grace;
        loop {
            if let Some(exit) = pre.try_wait()? {
                info!("pre-failure process {} finished ({})", pre.pid(), exit);
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    "pre-failure process {} still running {:?} after testing end, killing it",
                    pre.pid(),
                    self.config.pre_exit_grace
                );
                pre.kill()?;
                pre.wait()?;
                return Ok(());
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }
}
