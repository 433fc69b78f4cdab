//! Run configuration.

use pmcheck_shadow::ShadowConfig;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the instrumentation framework's root.
pub const PIN_ROOT_ENV: &str = "PIN_ROOT";

/// Preload library passed through to the target as `LD_PRELOAD`.  Kept
/// under a different name so it does not apply to pmcheck itself.
pub const PRELOAD_ENV: &str = "PMCHECK_LD_PRELOAD";

/// Set in the recovery run's environment.
pub const POST_FAILURE_ENV: &str = "POST_FAILURE";

/// Timing and model configuration for the orchestration loop.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// A pre-failure channel silent for longer than this aborts the run.
    pub idle_timeout: Duration,
    /// Wall-clock budget of one recovery run.
    pub post_timeout: Duration,
    /// How long the pre-failure process may take to exit after testing ends.
    pub pre_exit_grace: Duration,
    /// Sleep between empty channel reads.
    pub poll_interval: Duration,
    /// Save raw trace streams here when set.
    pub record_dir: Option<PathBuf>,
    pub shadow: ShadowConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            post_timeout: Duration::from_secs(20),
            pre_exit_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
            record_dir: None,
            shadow: ShadowConfig::default(),
        }
    }
}

/// How to launch the instrumented target.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Root of the instrumentation framework (`$PIN_ROOT`).
    pub pin_root: Option<PathBuf>,
    /// Instrumentation tool loaded into the target.
    pub pintool: PathBuf,
    /// PM image substituted for the placeholder in the target command.
    pub pool_image: PathBuf,
    /// Manually supplied failure-point list.
    pub failure_points: Option<PathBuf>,
    /// Target command line; one argument contains the pool placeholder.
    pub target: Vec<String>,
    /// Session id shared with the instrumentation tool.
    pub session: u32,
    /// Where the recovery run's tool output goes.
    pub post_output: PathBuf,
    /// Value for the target's `LD_PRELOAD`.
    pub preload: Option<OsString>,
}

impl LaunchConfig {
    pub fn new(pintool: impl Into<PathBuf>, pool_image: impl Into<PathBuf>, target: Vec<String>) -> Self {
        Self {
            pin_root: None,
            pintool: pintool.into(),
            pool_image: pool_image.into(),
            failure_points: None,
            target,
            session: std::process::id(),
            post_output: PathBuf::from("pmcheck_post.out"),
            preload: None,
        }
    }

    /// Fill `pin_root` and `preload` from the process environment.
    pub fn with_env(mut self) -> Self {
        self.pin_root = std::env::var_os(PIN_ROOT_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        self.preload = std::env::var_os(PRELOAD_ENV);
        self
    }
}
