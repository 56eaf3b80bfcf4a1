use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".firstrun";

fn default_deadline_secs() -> u64 {
    300
}

fn default_poll_interval_millis() -> u64 {
    100
}

fn default_quiet_secs() -> u64 {
    5
}

fn default_stable_observations() -> u32 {
    1
}

fn default_settle_millis() -> u64 {
    1000
}

fn default_verify_interval_secs() -> u64 {
    5
}

fn default_max_verification_resets() -> u32 {
    3
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_markers() -> Vec<String> {
    vec![
        "To see the GUI go to:".to_string(),
        "http://127.0.0.1:8188".to_string(),
    ]
}

fn default_layout_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("ComfyUI_windows_portable_nvidia").join("ComfyUI_windows_portable"),
        PathBuf::from("ComfyUI_windows_portable"),
    ]
}

fn default_launch_script() -> String {
    "run_nvidia_gpu.bat".to_string()
}

fn default_artifact() -> PathBuf {
    PathBuf::from("python_embeded").join("python.exe")
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".firstrun").join("logs")
}

/// Timing and bounds for one supervised first run.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
    #[serde(default = "default_quiet_secs")]
    pub quiet_secs: u64,
    #[serde(default = "default_stable_observations")]
    pub stable_observations: u32,
    #[serde(default = "default_settle_millis")]
    pub settle_millis: u64,
    #[serde(default = "default_verify_interval_secs")]
    pub verify_interval_secs: u64,
    #[serde(default = "default_max_verification_resets")]
    pub max_verification_resets: u32,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            poll_interval_millis: default_poll_interval_millis(),
            quiet_secs: default_quiet_secs(),
            stable_observations: default_stable_observations(),
            settle_millis: default_settle_millis(),
            verify_interval_secs: default_verify_interval_secs(),
            max_verification_resets: default_max_verification_resets(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

impl SupervisorSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis.max(1))
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_secs(self.quiet_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_millis)
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_secs(self.verify_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Literal strings the supervised runtime prints once its service is up.
///
/// ```toml
/// [readiness]
/// markers = ["To see the GUI go to:", "http://127.0.0.1:8188"]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ReadinessSettings {
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            markers: default_markers(),
        }
    }
}

/// On-disk shape of an extracted install.
#[derive(Debug, Clone, Deserialize)]
pub struct LayoutSettings {
    /// Base directory candidates relative to the install root, highest priority first.
    #[serde(default = "default_layout_candidates")]
    pub candidates: Vec<PathBuf>,
    #[serde(default = "default_launch_script")]
    pub launch_script: String,
    /// Completion artifact relative to the resolved base directory.
    #[serde(default = "default_artifact")]
    pub artifact: PathBuf,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            candidates: default_layout_candidates(),
            launch_script: default_launch_script(),
            artifact: default_artifact(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Relative paths are resolved against the install root.
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub readiness: ReadinessSettings,
    #[serde(default)]
    pub layout: LayoutSettings,
    #[serde(default)]
    pub log: LogSettings,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.firstrun/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}
