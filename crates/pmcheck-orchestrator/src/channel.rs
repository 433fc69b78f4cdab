//! Trace and control channels.
//!
//! [`FifoTransport`] creates the three named pipes of a session.  Trace
//! pipes are opened non-blocking so the orchestrator can enforce its own
//! timeouts; the control pipe is opened read-write so opening it never
//! waits for the peer.

use log::{debug, warn};
use pmcheck_protocol::{encode_signal, ChannelPaths, CONTINUE_SIGNAL};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("failed to create pipe {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open pipe {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read trace: {0}")]
    Read(#[source] io::Error),

    #[error("failed to send control signal: {0}")]
    Write(#[source] io::Error),

    #[error("failed to record trace: {0}")]
    Record(#[source] io::Error),
}

/// A byte stream of trace records.
pub trait TraceSource {
    /// Copy whatever bytes are available into `buf` without blocking.
    /// Returns 0 when nothing is available right now.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError>;
}

/// Sends control messages to the paused pre-failure run.
pub trait ControlSink {
    fn send_continue(&mut self) -> Result<(), ChannelError>;
}

/// Opens the channels of one session.
pub trait Transport {
    fn open_pre_failure(&mut self) -> Result<Box<dyn TraceSource>, ChannelError>;
    fn open_post_failure(&mut self) -> Result<Box<dyn TraceSource>, ChannelError>;
    fn open_control(&mut self) -> Result<Box<dyn ControlSink>, ChannelError>;
}

// ═══════════════════════════════════════════════════════════════════════
//  Named pipes
// ═══════════════════════════════════════════════════════════════════════

/// Named-pipe transport.  Pipes are removed when the transport is dropped.
#[derive(Debug)]
pub struct FifoTransport {
    paths: ChannelPaths,
}

impl FifoTransport {
    /// Create fresh pipes for `session` under `dir`, replacing stale ones.
    pub fn create(dir: &Path, session: u32) -> Result<Self, ChannelError> {
        let paths = ChannelPaths::for_session(dir, session);
        for path in paths.all() {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("removed stale pipe {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(ChannelError::Create {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }
            mkfifo(path).map_err(|source| ChannelError::Create {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &ChannelPaths {
        &self.paths
    }
}

impl Drop for FifoTransport {
    fn drop(&mut self) {
        for path in self.paths.all() {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("failed to remove pipe {}: {}", path.display(), e);
                }
            }
        }
    }
}

fn mkfifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string for the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn open_trace(path: &Path) -> Result<Box<dyn TraceSource>, ChannelError> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|source| ChannelError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Box::new(FifoSource { file }))
}

impl Transport for FifoTransport {
    fn open_pre_failure(&mut self) -> Result<Box<dyn TraceSource>, ChannelError> {
        open_trace(&self.paths.pre_failure)
    }

    fn open_post_failure(&mut self) -> Result<Box<dyn TraceSource>, ChannelError> {
        open_trace(&self.paths.post_failure)
    }

    fn open_control(&mut self) -> Result<Box<dyn ControlSink>, ChannelError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.paths.signal)
            .map_err(|source| ChannelError::Open {
                path: self.paths.signal.clone(),
                source,
            })?;
        Ok(Box::new(FifoControl { file }))
    }
}

/// Non-blocking reader end of a trace pipe.
#[derive(Debug)]
pub struct FifoSource {
    file: File,
}

impl TraceSource for FifoSource {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        match self.file.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(ChannelError::Read(e)),
        }
    }
}

/// Control pipe.
#[derive(Debug)]
pub struct FifoControl {
    file: File,
}

impl ControlSink for FifoControl {
    fn send_continue(&mut self) -> Result<(), ChannelError> {
        debug!("sending {}", CONTINUE_SIGNAL);
        self.file
            .write_all(&encode_signal(CONTINUE_SIGNAL))
            .map_err(ChannelError::Write)
    }
}
