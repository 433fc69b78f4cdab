//! Drives the orchestrator through scripted processes and channels.

use pmcheck_orchestrator::{
    ChannelError, ControlSink, ExitOutcome, LaunchError, Launcher, Orchestrator,
    OrchestratorConfig, OrchestratorError, PostFailureOutcome, State, TargetProcess, TraceSource,
    Transport,
};
use pmcheck_protocol::{AddressRange, EventKind, Phase, ThreadId, TraceEvent, RAW_ENTRY_SIZE};
use pmcheck_shadow::FindingKind;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

const BASE: u64 = 0x100_0000_0000;
const SIGKILL: i32 = 9;

type Log = Rc<RefCell<Vec<String>>>;

fn encode(events: &[EventKind]) -> Vec<u8> {
    events
        .iter()
        .enumerate()
        .flat_map(|(i, kind)| {
            TraceEvent {
                seq: 0,
                tid: ThreadId(1),
                ip: 0x400000 + i as u64,
                kind: *kind,
            }
            .to_raw()
            .unwrap()
            .to_bytes()
        })
        .collect()
}

// ─── Channels ───────────────────────────────────────────────────────────

struct Scripted(VecDeque<Vec<u8>>);

impl TraceSource for Scripted {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        match self.0.pop_front() {
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }
}

struct Control(Log);

impl ControlSink for Control {
    fn send_continue(&mut self) -> Result<(), ChannelError> {
        self.0.borrow_mut().push("continue".to_string());
        Ok(())
    }
}

struct MockTransport {
    /// Pre-failure reads in order; an empty chunk is a read that finds nothing.
    pre: VecDeque<Vec<u8>>,
    posts: VecDeque<Vec<u8>>,
    log: Log,
}

impl Transport for MockTransport {
    fn open_pre_failure(&mut self) -> Result<Box<dyn TraceSource>, ChannelError> {
        Ok(Box::new(Scripted(std::mem::take(&mut self.pre))))
    }

    fn open_post_failure(&mut self) -> Result<Box<dyn TraceSource>, ChannelError> {
        let chunks = self.posts.pop_front().into_iter().collect();
        Ok(Box::new(Scripted(chunks)))
    }

    fn open_control(&mut self) -> Result<Box<dyn ControlSink>, ChannelError> {
        Ok(Box::new(Control(self.log.clone())))
    }
}

// ─── Processes ──────────────────────────────────────────────────────────

struct MockProcess {
    name: &'static str,
    pid: u32,
    exit: Option<ExitOutcome>,
    killed: bool,
    log: Log,
}

impl TargetProcess for MockProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> Result<Option<ExitOutcome>, LaunchError> {
        if self.killed {
            return Ok(Some(ExitOutcome::Signaled(SIGKILL)));
        }
        Ok(self.exit)
    }

    fn kill(&mut self) -> Result<(), LaunchError> {
        self.log.borrow_mut().push(format!("kill {}", self.name));
        self.killed = true;
        Ok(())
    }

    fn wait(&mut self) -> Result<ExitOutcome, LaunchError> {
        Ok(self.try_wait()?.unwrap_or(ExitOutcome::Exited(0)))
    }
}

struct MockLauncher {
    /// `None` keeps the pre-failure process running until killed.
    pre_exit: Option<ExitOutcome>,
    post_exits: VecDeque<Option<ExitOutcome>>,
    images: u32,
    log: Log,
}

impl Launcher for MockLauncher {
    fn spawn_pre_failure(&mut self) -> Result<Box<dyn TargetProcess>, LaunchError> {
        self.log.borrow_mut().push("spawn pre".to_string());
        Ok(Box::new(MockProcess {
            name: "pre",
            pid: 100,
            exit: self.pre_exit,
            killed: false,
            log: self.log.clone(),
        }))
    }

    fn prepare_image(&mut self) -> Result<PathBuf, LaunchError> {
        self.images += 1;
        Ok(PathBuf::from(format!("/scratch/pool_{}", self.images)))
    }

    fn spawn_post_failure(&mut self, image: &Path) -> Result<Box<dyn TargetProcess>, LaunchError> {
        self.log.borrow_mut().push(format!("spawn post {}", image.display()));
        let exit = self.post_exits.pop_front().unwrap_or(Some(ExitOutcome::Exited(0)));
        Ok(Box::new(MockProcess {
            name: "post",
            pid: 200 + self.images,
            exit,
            killed: false,
            log: self.log.clone(),
        }))
    }

    fn discard_image(&mut self, image: &Path) -> Result<(), LaunchError> {
        self.log.borrow_mut().push(format!("discard {}", image.display()));
        Ok(())
    }
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        idle_timeout: Duration::from_millis(50),
        post_timeout: Duration::from_millis(50),
        pre_exit_grace: Duration::from_millis(20),
        poll_interval: Duration::from_millis(1),
        ..Default::default()
    }
}

struct Harness {
    log: Log,
    orchestrator: Orchestrator<MockLauncher, MockTransport>,
}

fn harness(
    config: OrchestratorConfig,
    pre: &[EventKind],
    posts: &[&[EventKind]],
    pre_exit: Option<ExitOutcome>,
    post_exits: Vec<Option<ExitOutcome>>,
) -> Harness {
    chunked_harness(config, vec![encode(pre)], posts, pre_exit, post_exits)
}

fn chunked_harness(
    config: OrchestratorConfig,
    pre_chunks: Vec<Vec<u8>>,
    posts: &[&[EventKind]],
    pre_exit: Option<ExitOutcome>,
    post_exits: Vec<Option<ExitOutcome>>,
) -> Harness {
    let log: Log = Rc::default();
    let launcher = MockLauncher {
        pre_exit,
        post_exits: post_exits.into(),
        images: 0,
        log: log.clone(),
    };
    let transport = MockTransport {
        pre: pre_chunks.into(),
        posts: posts.iter().map(|p| encode(p)).collect(),
        log: log.clone(),
    };
    Harness {
        log,
        orchestrator: Orchestrator::new(config, launcher, transport),
    }
}

fn logged(log: &Log, entry: &str) -> usize {
    log.borrow().iter().filter(|e| e.as_str() == entry).count()
}

#[test]
fn full_loop_checks_each_failure_point() {
    let x = AddressRange::new(BASE, 8);
    let pre = [
        EventKind::Allocate { range: AddressRange::new(BASE, 4096) },
        EventKind::Write { range: x, non_temporal: false },
        EventKind::TraceEnd,
        EventKind::Flush { range: x },
        EventKind::Drain,
        EventKind::TraceEnd,
        EventKind::TestingEnd,
    ];
    let recovery: &[EventKind] = &[EventKind::Read { range: x }, EventKind::TestingEnd];
    // First failure point in one read, nothing on the next read, then the
    // rest with a record split across two reads.
    let bytes = encode(&pre);
    let (first, rest) = bytes.split_at(RAW_ENTRY_SIZE * 3);
    let (middle, last) = rest.split_at(RAW_ENTRY_SIZE + 20);
    let mut h = chunked_harness(
        fast_config(),
        vec![first.to_vec(), Vec::new(), middle.to_vec(), Vec::new(), last.to_vec()],
        &[recovery, recovery],
        None,
        vec![],
    );

    let report = h.orchestrator.run().unwrap();
    assert_eq!(h.orchestrator.state(), State::Done);

    assert_eq!(report.failure_points.len(), 2);
    assert_eq!(report.failure_points[0].index, 1);
    assert_eq!(report.failure_points[1].index, 2);
    assert!(report
        .failure_points
        .iter()
        .all(|fp| fp.outcome == PostFailureOutcome::Completed));

    let errors: Vec<_> = report.diagnostics.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, FindingKind::InconsistentRead);
    assert_eq!(errors[0].phase, Phase::PostFailure);
    assert_eq!(errors[0].failure_point, Some(1));

    assert_eq!(logged(&h.log, "continue"), 2);
    assert_eq!(logged(&h.log, "discard /scratch/pool_1"), 1);
    assert_eq!(logged(&h.log, "discard /scratch/pool_2"), 1);
    // Still running after testing end, so it is killed once the grace ends.
    assert_eq!(logged(&h.log, "kill pre"), 1);
    assert!(!h.orchestrator.detector().in_post_failure());
}

#[test]
fn silent_pre_failure_channel_times_out() {
    let mut h = harness(fast_config(), &[], &[], None, vec![]);

    let err = h.orchestrator.run().unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::ChannelTimeout { phase: Phase::PreFailure, .. }
    ));
    assert_eq!(logged(&h.log, "kill pre"), 1);
}

#[test]
fn pre_failure_exit_before_testing_end_is_fatal() {
    let mut h = harness(
        fast_config(),
        &[EventKind::TraceBegin],
        &[],
        Some(ExitOutcome::Exited(0)),
        vec![],
    );

    let err = h.orchestrator.run().unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::PreFailureExited { outcome: ExitOutcome::Exited(0) }
    ));
}

#[test]
fn failed_recovery_aborts_the_run() {
    let mut h = harness(
        fast_config(),
        &[EventKind::TraceEnd, EventKind::TestingEnd],
        &[&[EventKind::TraceBegin]],
        None,
        vec![Some(ExitOutcome::Exited(1))],
    );

    let err = h.orchestrator.run().unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::PostFailureFailed { index: 1, outcome: ExitOutcome::Exited(1) }
    ));
    assert_eq!(logged(&h.log, "discard /scratch/pool_1"), 1);
    assert_eq!(logged(&h.log, "continue"), 0);
    assert_eq!(logged(&h.log, "kill pre"), 1);
    assert!(!h.orchestrator.detector().in_post_failure());
}

#[test]
fn hung_recovery_is_killed_and_run_continues() {
    let mut h = harness(
        fast_config(),
        &[EventKind::TraceEnd, EventKind::TestingEnd],
        &[&[]],
        None,
        vec![None],
    );

    let report = h.orchestrator.run().unwrap();
    assert_eq!(report.failure_points.len(), 1);
    assert_eq!(report.failure_points[0].outcome, PostFailureOutcome::TimedOut);
    assert_eq!(logged(&h.log, "kill post"), 1);
    assert_eq!(logged(&h.log, "continue"), 1);
    // Pre-failure run never exits on its own; the grace period ends in a kill.
    assert_eq!(logged(&h.log, "kill pre"), 1);
}

#[test]
fn recovery_exiting_without_testing_end() {
    let mut h = harness(
        fast_config(),
        &[EventKind::TraceEnd, EventKind::TestingEnd],
        &[&[EventKind::TraceBegin]],
        Some(ExitOutcome::Exited(0)),
        vec![Some(ExitOutcome::Exited(0))],
    );

    let report = h.orchestrator.run().unwrap();
    assert_eq!(report.failure_points[0].outcome, PostFailureOutcome::ExitedEarly);
    assert_eq!(report.diagnostics.stats.post_failure_events, 1);
}

#[test]
fn record_dir_captures_raw_streams() {
    let dir = tempfile::tempdir().unwrap();
    let config = OrchestratorConfig {
        record_dir: Some(dir.path().to_path_buf()),
        ..fast_config()
    };
    let pre = [EventKind::TraceEnd, EventKind::TestingEnd];
    let post: &[EventKind] = &[EventKind::TestingEnd];
    let mut h = harness(config, &pre, &[post], Some(ExitOutcome::Exited(0)), vec![]);

    h.orchestrator.run().unwrap();
    assert_eq!(std::fs::read(dir.path().join("pre.trace")).unwrap(), encode(&pre));
    assert_eq!(std::fs::read(dir.path().join("post.1.trace")).unwrap(), encode(post));
}

#[test]
fn resumed_run_gets_a_fresh_idle_timeout() {
    let config = OrchestratorConfig {
        idle_timeout: Duration::from_millis(50),
        post_timeout: Duration::from_millis(150),
        ..fast_config()
    };
    let mut h = chunked_harness(
        config,
        vec![
            encode(&[EventKind::TraceEnd]),
            Vec::new(),
            encode(&[EventKind::TestingEnd]),
        ],
        &[&[]],
        None,
        vec![None],
    );

    // The recovery run hangs past the idle timeout before it is killed.
    let report = h.orchestrator.run().unwrap();
    assert_eq!(report.failure_points.len(), 1);
    assert_eq!(report.failure_points[0].outcome, PostFailureOutcome::TimedOut);
    assert_eq!(logged(&h.log, "continue"), 1);
    assert_eq!(h.orchestrator.state(), State::Done);
}
