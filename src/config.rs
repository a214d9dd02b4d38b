use std::path::PathBuf;

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// pipeline configuration, constructor-injected everywhere
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// directory holding per-document rule yaml files
    pub rules_dir: PathBuf,
    /// anchor signature file for the splitter
    pub signatures_path: PathBuf,
    /// root for per-workflow document directories
    pub upload_root: PathBuf,
    /// root for per-run artifact directories
    pub output_root: PathBuf,
    /// minimum text yield before falling back to ocr
    pub min_text_len: usize,
    pub mismo: MismoConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rules_dir: PathBuf::from("rules"),
            signatures_path: PathBuf::from("rules/signatures.yaml"),
            upload_root: PathBuf::from("uploads"),
            output_root: PathBuf::from("output"),
            min_text_len: 50,
            mismo: MismoConfig::default(),
        }
    }
}

/// mismo emission configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MismoConfig {
    pub version: MismoVersion,
}

/// supported mismo schema versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MismoVersion {
    #[default]
    #[serde(rename = "3.4")]
    V3_4,
    #[serde(rename = "3.6")]
    V3_6,
}

impl MismoVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            MismoVersion::V3_4 => "3.4",
            MismoVersion::V3_6 => "3.6",
        }
    }
}

/// activity retry policy for the durable runtime
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::seconds(1),
            backoff_coefficient: 2.0,
            maximum_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// child workflows never retry
    pub fn no_retry() -> Self {
        Self {
            maximum_attempts: 1,
            ..Self::default()
        }
    }

    /// backoff delay before the given attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_coefficient.powi(attempt.saturating_sub(1) as i32);
        let millis = self.initial_interval.num_milliseconds() as f64 * factor;
        Duration::milliseconds(millis as i64)
    }
}
