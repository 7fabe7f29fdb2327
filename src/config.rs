use crate::submit::RetryPolicy;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Session policy knobs. The instruction-wait duration and the pass mark
/// are deliberately configuration, not constants: the flows this replaces
/// disagreed on both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Minimum wait in the Gate phase before the exam may start.
    pub gate_dwell_secs: u64,
    /// Exam duration; the absolute deadline is fixed when InProgress begins.
    pub exam_secs: u64,
    /// Proctoring violations tolerated before a forced submission.
    pub violation_threshold: u32,
    pub retry: RetryPolicy,
    /// Pass/fail presentation of a receipt's score; never drives transitions.
    pub pass_mark_percent: f64,
    /// When true, failure to enter the enforced presentation mode aborts
    /// the session instead of proceeding degraded.
    pub require_presentation: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gate_dwell_secs: 60,
            exam_secs: 5400,
            violation_threshold: 3,
            retry: RetryPolicy::default(),
            pass_mark_percent: 40.0,
            require_presentation: false,
        }
    }
}

pub trait ConfigStore {
    fn load(&self) -> SessionConfig;
    fn save(&self, cfg: &SessionConfig) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let path = if let Some(pd) = ProjectDirs::from("", "", "invigil") {
            pd.config_dir().join("config.json")
        } else {
            PathBuf::from("invigil_config.json")
        };
        Self { path }
    }

    pub fn with_path<P: AsRef<Path>>(p: P) -> Self {
        Self {
            path: p.as_ref().to_path_buf(),
        }
    }
}

impl Default for FileConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> SessionConfig {
        if let Ok(bytes) = fs::read(&self.path) {
            if let Ok(cfg) = serde_json::from_slice::<SessionConfig>(&bytes) {
                return cfg;
            }
        }
        SessionConfig::default()
    }

    fn save(&self, cfg: &SessionConfig) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(cfg).unwrap_or_default();
        fs::write(&self.path, data)
    }
}
