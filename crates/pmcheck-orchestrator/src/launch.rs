//! Launching the instrumented target.
//!
//! Both runs use the same command line under the instrumentation tool:
//!
//! ```text
//! $PIN_ROOT/pin -t <pintool> <tool options> -- <target with image path>
//! ```
//!
//! The pre-failure run operates on the PM image itself, each recovery run
//! on a scratch copy of it.

use crate::config::{LaunchConfig, POST_FAILURE_ENV};
use log::{debug, info};
use pmcheck_protocol::{Phase, POOL_IMAGE_PLACEHOLDER};
use rand::Rng;
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("PIN_ROOT is not set")]
    PinRootUnset,

    #[error("no target argument contains __POOL_IMAGE__")]
    NoImagePlaceholder,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to copy PM image {from} to {to}: {source}")]
    CopyImage {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove scratch image {path}: {source}")]
    RemoveImage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("process {pid}: {source}")]
    Process {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// How a target process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(sig)) => Self::Signaled(sig),
            (None, None) => Self::Exited(-1),
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit status {}", code),
            Self::Signaled(sig) => write!(f, "killed by signal {}", sig),
        }
    }
}

/// A running target.
pub trait TargetProcess {
    fn pid(&self) -> u32;
    /// Exit outcome if the process has already ended.
    fn try_wait(&mut self) -> Result<Option<ExitOutcome>, LaunchError>;
    /// Send SIGKILL.  Killing an exited process is not an error.
    fn kill(&mut self) -> Result<(), LaunchError>;
    fn wait(&mut self) -> Result<ExitOutcome, LaunchError>;
}

/// Starts target runs and manages scratch images.
pub trait Launcher {
    fn spawn_pre_failure(&mut self) -> Result<Box<dyn TargetProcess>, LaunchError>;
    /// Copy the PM image to a fresh scratch file.
    fn prepare_image(&mut self) -> Result<PathBuf, LaunchError>;
    fn spawn_post_failure(&mut self, image: &Path) -> Result<Box<dyn TargetProcess>, LaunchError>;
    fn discard_image(&mut self, image: &Path) -> Result<(), LaunchError>;
}

// ═══════════════════════════════════════════════════════════════════════
//  Child process
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    fn process_error(&self, source: io::Error) -> LaunchError {
        LaunchError::Process {
            pid: self.child.id(),
            source,
        }
    }
}

impl TargetProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<ExitOutcome>, LaunchError> {
        match self.child.try_wait() {
            Ok(status) => Ok(status.map(ExitOutcome::from)),
            Err(e) => Err(self.process_error(e)),
        }
    }

    fn kill(&mut self) -> Result<(), LaunchError> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(self.process_error(e)),
        }
    }

    fn wait(&mut self) -> Result<ExitOutcome, LaunchError> {
        match self.child.wait() {
            Ok(status) => Ok(status.into()),
            Err(e) => Err(self.process_error(e)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Pin launcher
// ═══════════════════════════════════════════════════════════════════════

/// Runs the target under Pin with the tracing tool.
#[derive(Debug)]
pub struct PinLauncher {
    config: LaunchConfig,
    pin: PathBuf,
    image_arg: usize,
    pm_image: PathBuf,
}

impl PinLauncher {
    pub fn new(config: LaunchConfig) -> Result<Self, LaunchError> {
        let pin_root = config
            .pin_root
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(LaunchError::PinRootUnset)?;
        let image_arg = config
            .target
            .iter()
            .position(|arg| arg.contains(POOL_IMAGE_PLACEHOLDER))
            .ok_or(LaunchError::NoImagePlaceholder)?;
        let pm_image = PathBuf::from(
            config.target[image_arg]
                .replace(POOL_IMAGE_PLACEHOLDER, &config.pool_image.to_string_lossy()),
        );
        info!("pintool:   {}", config.pintool.display());
        info!("PM image:  {}", pm_image.display());
        info!("target:    {}", config.target.join(" "));
        if let Some(fp) = &config.failure_points {
            info!("failure points: {}", fp.display());
        }
        Ok(Self {
            pin: pin_root.join("pin"),
            config,
            image_arg,
            pm_image,
        })
    }

    /// PM image the pre-failure run operates on.
    pub fn pm_image(&self) -> &Path {
        &self.pm_image
    }

    fn tool_options(&self, phase: Phase) -> Vec<String> {
        let session = self.config.session.to_string();
        match phase {
            Phase::PreFailure => {
                let mut opts: Vec<String> = ["-f", "1", "-t", "1", "-i", &session]
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
                if let Some(fp) = &self.config.failure_points {
                    opts.push("-l".to_string());
                    opts.push(fp.to_string_lossy().into_owned());
                }
                opts
            }
            Phase::PostFailure => vec![
                "-r".to_string(),
                "1".to_string(),
                "-t".to_string(),
                "1".to_string(),
                "-o".to_string(),
                self.config.post_output.to_string_lossy().into_owned(),
                "-i".to_string(),
                session,
            ],
        }
    }

    /// Full command for one run against `image`.
    pub fn command(&self, phase: Phase, image: &Path) -> Command {
        let mut cmd = Command::new(&self.pin);
        cmd.arg("-t").arg(&self.config.pintool);
        cmd.args(self.tool_options(phase));
        cmd.arg("--");
        for (i, arg) in self.config.target.iter().enumerate() {
            if i == self.image_arg {
                cmd.arg(image);
            } else {
                cmd.arg(arg);
            }
        }

        cmd.env_remove(crate::config::PRELOAD_ENV);
        if let Some(preload) = &self.config.preload {
            cmd.env("LD_PRELOAD", preload);
        }
        if phase == Phase::PostFailure {
            cmd.env(POST_FAILURE_ENV, "1");
        }
        cmd
    }

    fn spawn(&self, phase: Phase, image: &Path) -> Result<Box<dyn TargetProcess>, LaunchError> {
        let mut cmd = self.command(phase, image);
        debug!("{} command: {:?}", phase, cmd);
        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: self.pin.clone(),
            source,
        })?;
        info!("{} run started (pid {})", phase, child.id());
        Ok(Box::new(ChildProcess { child }))
    }
}

impl Launcher for PinLauncher {
    fn spawn_pre_failure(&mut self) -> Result<Box<dyn TargetProcess>, LaunchError> {
        self.spawn(Phase::PreFailure, &self.pm_image)
    }

    fn prepare_image(&mut self) -> Result<PathBuf, LaunchError> {
        let suffix: u32 = rand::thread_rng().gen();
        let mut name = self.pm_image.clone().into_os_string();
        name.push(format!("_pmcheck_{}", suffix));
        let copy = PathBuf::from(name);
        std::fs::copy(&self.pm_image, &copy).map_err(|source| LaunchError::CopyImage {
            from: self.pm_image.clone(),
            to: copy.clone(),
            source,
        })?;
        debug!("scratch image {}", copy.display());
        Ok(copy)
    }

    fn spawn_post_failure(&mut self, image: &Path) -> Result<Box<dyn TargetProcess>, LaunchError> {
        self.spawn(Phase::PostFailure, image)
    }

    fn discard_image(&mut self, image: &Path) -> Result<(), LaunchError> {
        std::fs::remove_file(image).map_err(|source| LaunchError::RemoveImage {
            path: image.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn config(dir: &Path) -> LaunchConfig {
        let mut config = LaunchConfig::new(
            "/opt/tool.so",
            dir.join("pool"),
            vec!["./btree".into(), "__POOL_IMAGE__".into(), "insert".into()],
        );
        config.pin_root = Some(PathBuf::from("/opt/pin"));
        config.session = 42;
        config
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    fn env<'a>(cmd: &'a Command, key: &str) -> Option<Option<&'a OsStr>> {
        cmd.get_envs().find(|(k, _)| *k == OsStr::new(key)).map(|(_, v)| v)
    }

    #[test]
    fn missing_pin_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.pin_root = None;
        assert!(matches!(PinLauncher::new(cfg), Err(LaunchError::PinRootUnset)));
    }

    #[test]
    fn target_needs_image_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.target = vec!["./btree".into()];
        assert!(matches!(PinLauncher::new(cfg), Err(LaunchError::NoImagePlaceholder)));
    }

    #[test]
    fn pre_failure_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.failure_points = Some(PathBuf::from("/tmp/points.txt"));
        cfg.preload = Some("/opt/libpm.so".into());
        let launcher = PinLauncher::new(cfg).unwrap();
        let pool = dir.path().join("pool");
        assert_eq!(launcher.pm_image(), pool.as_path());

        let cmd = launcher.command(Phase::PreFailure, launcher.pm_image());
        assert_eq!(cmd.get_program(), OsStr::new("/opt/pin/pin"));
        assert_eq!(
            args(&cmd),
            vec![
                "-t".to_string(),
                "/opt/tool.so".into(),
                "-f".into(),
                "1".into(),
                "-t".into(),
                "1".into(),
                "-i".into(),
                "42".into(),
                "-l".into(),
                "/tmp/points.txt".into(),
                "--".into(),
                "./btree".into(),
                pool.to_string_lossy().into_owned(),
                "insert".into(),
            ]
        );
        assert_eq!(env(&cmd, "LD_PRELOAD"), Some(Some(OsStr::new("/opt/libpm.so"))));
        assert_eq!(env(&cmd, "PMCHECK_LD_PRELOAD"), Some(None));
        assert_eq!(env(&cmd, "POST_FAILURE"), None);
    }

    #[test]
    fn post_failure_command_uses_copy() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = PinLauncher::new(config(dir.path())).unwrap();
        let cmd = launcher.command(Phase::PostFailure, Path::new("/tmp/pool_copy"));
        let a = args(&cmd);
        assert_eq!(&a[2..10], &["-r", "1", "-t", "1", "-o", "pmcheck_post.out", "-i", "42"]);
        assert_eq!(a.last().map(String::as_str), Some("insert"));
        assert!(a.contains(&"/tmp/pool_copy".to_string()));
        assert_eq!(env(&cmd, "POST_FAILURE"), Some(Some(OsStr::new("1"))));
    }

    #[test]
    fn scratch_image_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pool"), b"pm contents").unwrap();
        let mut launcher = PinLauncher::new(config(dir.path())).unwrap();

        let copy = launcher.prepare_image().unwrap();
        assert!(copy.to_string_lossy().contains("pool_pmcheck_"));
        assert_eq!(std::fs::read(&copy).unwrap(), b"pm contents");

        launcher.discard_image(&copy).unwrap();
        assert!(!copy.exists());
    }

    #[test]
    fn child_process_outcomes() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let mut proc = ChildProcess { child };
        assert_eq!(proc.wait().unwrap(), ExitOutcome::Exited(3));
        proc.kill().unwrap();

        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut proc = ChildProcess { child };
        assert_eq!(proc.try_wait().unwrap(), None);
        proc.kill().unwrap();
        assert_eq!(proc.wait().unwrap(), ExitOutcome::Signaled(libc::SIGKILL));
    }
}
