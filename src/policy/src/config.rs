//! Compiler configuration loading and validation

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{PolicyError, Result};

/// Complete compiler configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CompilerConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub resync: ResyncSection,

    #[serde(default)]
    pub validator: ValidatorSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerSection {
    /// Debounce between a trigger and the compilation it starts
    #[serde(default = "default_coalesce_window")]
    pub coalesce_window_ms: u64,
    /// Upper bound on one background compilation, up to and including
    /// the assignment swap
    #[serde(default = "default_compile_timeout")]
    pub compile_timeout_ms: u64,
    /// Upper bound on delivering a pass's resync requests
    #[serde(default = "default_resync_timeout")]
    pub resync_timeout_ms: u64,
    /// Compilations allowed to run at once across all rules
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Idle time before a per-rule worker exits
    #[serde(default = "default_idle_retire")]
    pub idle_retire_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResyncSection {
    /// Above this many targets a plan escalates to all machines
    #[serde(default = "default_max_targeted")]
    pub max_targeted: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValidatorSection {
    #[serde(default = "default_max_expression_len")]
    pub max_expression_len: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            coalesce_window_ms: default_coalesce_window(),
            compile_timeout_ms: default_compile_timeout(),
            resync_timeout_ms: default_resync_timeout(),
            max_concurrent: default_max_concurrent(),
            idle_retire_ms: default_idle_retire(),
        }
    }
}

impl Default for ResyncSection {
    fn default() -> Self {
        Self {
            max_targeted: default_max_targeted(),
        }
    }
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            max_expression_len: default_max_expression_len(),
        }
    }
}

// Default value functions
fn default_coalesce_window() -> u64 { 50 }
fn default_compile_timeout() -> u64 { 30_000 }
fn default_resync_timeout() -> u64 { 10_000 }
fn default_max_concurrent() -> usize { 8 }
fn default_idle_retire() -> u64 { 30_000 }
fn default_max_targeted() -> usize { 500 }
fn default_max_expression_len() -> usize { 4096 }

impl SchedulerSection {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    pub fn resync_timeout(&self) -> Duration {
        Duration::from_millis(self.resync_timeout_ms)
    }

    pub fn idle_retire(&self) -> Duration {
        Duration::from_millis(self.idle_retire_ms)
    }
}

impl CompilerConfig {
    /// Load configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PolicyError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: CompilerConfig = toml::from_str(contents)
            .map_err(|e| PolicyError::Config(format!("Failed to parse configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.compile_timeout_ms == 0 {
            return Err(PolicyError::Config(
                "scheduler.compile_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.scheduler.resync_timeout_ms == 0 {
            return Err(PolicyError::Config(
                "scheduler.resync_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.scheduler.max_concurrent == 0 {
            return Err(PolicyError::Config(
                "scheduler.max_concurrent must be greater than zero".to_string(),
            ));
        }

        if self.resync.max_targeted == 0 {
            return Err(PolicyError::Config(
                "resync.max_targeted must be greater than zero".to_string(),
            ));
        }

        if self.validator.max_expression_len == 0 {
            return Err(PolicyError::Config(
                "validator.max_expression_len must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
