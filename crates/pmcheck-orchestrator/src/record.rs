//! Raw trace recording and offline replay.
//!
//! With a record directory configured, every byte read from the trace
//! channels is also written to disk: the pre-failure stream to
//! `pre.trace` and the recovery stream of failure point `n` to
//! `post.<n>.trace`.  [`replay_recording`] feeds those files back through
//! a [`Detector`] exactly as the live loop would, without spawning
//! anything.

use crate::channel::{ChannelError, TraceSource};
use log::{debug, info, warn};
use pmcheck_detector::{DetectError, Detector, DetectorSignal, DiagnosticReport, SymbolResolver};
use pmcheck_protocol::{Phase, ProtocolError, RecordDecoder, TraceEvent};
use pmcheck_shadow::ShadowConfig;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed trace in {path}: {source}")]
    Protocol {
        path: PathBuf,
        #[source]
        source: ProtocolError,
    },

    #[error(transparent)]
    Detect(#[from] DetectError),
}

/// Recording file for the pre-failure stream.
pub fn pre_failure_path(dir: &Path) -> PathBuf {
    dir.join("pre.trace")
}

/// Recording file for the recovery run of failure point `index` (1-based).
pub fn post_failure_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("post.{}.trace", index))
}

/// A [`TraceSource`] that copies everything it reads to a file.
pub struct RecordingSource {
    inner: Box<dyn TraceSource>,
    file: File,
}

impl RecordingSource {
    pub fn create(inner: Box<dyn TraceSource>, path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        debug!("recording trace to {}", path.display());
        Ok(Self { inner, file })
    }
}

impl TraceSource for RecordingSource {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        let n = self.inner.read_available(buf)?;
        if n > 0 {
            self.file.write_all(&buf[..n]).map_err(ChannelError::Record)?;
        }
        Ok(n)
    }
}

fn load_events(path: &Path) -> Result<Vec<TraceEvent>, ReplayError> {
    let bytes = std::fs::read(path).map_err(|source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let protocol = |source| ReplayError::Protocol {
        path: path.to_path_buf(),
        source,
    };
    let mut decoder = RecordDecoder::new();
    let events = decoder.feed(&bytes).map_err(protocol)?;
    decoder.finish().map_err(protocol)?;
    debug!(
        "{}: {} records, {} events",
        path.display(),
        decoder.records_seen(),
        events.len()
    );
    Ok(events)
}

/// Re-run the checker over recorded streams.
///
/// `posts[i]` is the recovery stream of the `i+1`th failure point.  A
/// failure point without a recording is skipped with a warning.
pub fn replay_recording(
    pre: &Path,
    posts: &[PathBuf],
    config: ShadowConfig,
    resolver: Box<dyn SymbolResolver>,
) -> Result<DiagnosticReport, ReplayError> {
    let mut detector = Detector::new(config).with_resolver(resolver);
    let mut remaining = posts.iter();

    for event in load_events(pre)? {
        match detector.process(&event, Phase::PreFailure)? {
            DetectorSignal::Continue => {}
            DetectorSignal::FailurePointReached { ip } => {
                let Some(path) = remaining.next() else {
                    warn!(
                        "no recovery recording for failure point {} (ip={:#x})",
                        detector.failure_points(),
                        ip
                    );
                    continue;
                };
                info!("replaying failure point {} from {}", detector.failure_points(), path.display());
                detector.begin_post_failure();
                for post_event in load_events(path)? {
                    if detector.process(&post_event, Phase::PostFailure)? == DetectorSignal::TestingComplete {
                        break;
                    }
                }
                detector.end_post_failure();
            }
            DetectorSignal::TestingComplete => break,
        }
    }

    let unused = remaining.count();
    if unused > 0 {
        warn!("{} recovery recordings had no matching failure point", unused);
    }
    Ok(DiagnosticReport::from_detector(detector))
}
