//! Dispatch configuration.
//!
//! Sources, lowest to highest priority:
//! 1. Built-in defaults
//! 2. A JSON configuration file (`DispatchConfig::from_json_file`)
//! 3. `KTUNE_*` environment variables

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default per-launch execution ceiling in microseconds.
pub const DEFAULT_MAX_KERNEL_EXEC_TIME_US: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DispatchConfig {
    /// Search launch geometries for keys missing from the tuning table.
    pub tuning: bool,
    /// Maximum number of outstanding enqueues before a forced wait (0 disables).
    pub queue_window_size: i64,
    /// Split long launches into blocks along the slowest-varying axis.
    pub limit_kernel_time: bool,
    /// Execution ceiling used when `limit_kernel_time` is on.
    pub max_kernel_exec_time_us: f64,
    /// Build kernels with the out-of-range flag and check it after each run.
    pub out_of_range_check: bool,
    /// Allow non-uniform work-groups when the device supports them.
    pub non_uniform_work_groups: bool,
    /// Export kernels under opaque symbol names.
    pub obfuscate_symbols: bool,
    /// JSON file backing the tuning table. In-memory only when unset.
    pub tuning_params_path: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tuning: false,
            queue_window_size: 0,
            limit_kernel_time: false,
            max_kernel_exec_time_us: DEFAULT_MAX_KERNEL_EXEC_TIME_US,
            out_of_range_check: false,
            non_uniform_work_groups: true,
            obfuscate_symbols: false,
            tuning_params_path: None,
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl DispatchConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides_with(|key| std::env::var(key).ok());
        config
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: DispatchConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?;
        config.apply_env_overrides_with(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `KTUNE_*` overrides from an arbitrary lookup. Unparseable values
    /// are ignored.
    pub fn apply_env_overrides_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("KTUNE_TUNING").as_deref().and_then(parse_bool) {
            self.tuning = v;
        }
        if let Some(v) = lookup("KTUNE_QUEUE_WINDOW_SIZE").and_then(|s| s.trim().parse().ok()) {
            self.queue_window_size = v;
        }
        if let Some(v) = lookup("KTUNE_LIMIT_KERNEL_TIME")
            .as_deref()
            .and_then(parse_bool)
        {
            self.limit_kernel_time = v;
        }
        if let Some(v) = lookup("KTUNE_MAX_KERNEL_EXEC_TIME_US")
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|v| *v > 0.0)
        {
            self.max_kernel_exec_time_us = v;
        }
        if let Some(v) = lookup("KTUNE_OUT_OF_RANGE_CHECK")
            .as_deref()
            .and_then(parse_bool)
        {
            self.out_of_range_check = v;
        }
        if let Some(v) = lookup("KTUNE_NON_UNIFORM_WORK_GROUPS")
            .as_deref()
            .and_then(parse_bool)
        {
            self.non_uniform_work_groups = v;
        }
        if let Some(v) = lookup("KTUNE_OBFUSCATE_SYMBOLS")
            .as_deref()
            .and_then(parse_bool)
        {
            self.obfuscate_symbols = v;
        }
        if let Some(v) = lookup("KTUNE_TUNING_PARAMS_PATH") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.tuning_params_path = Some(PathBuf::from(trimmed));
            }
        }
        debug!("dispatch config: {self:?}");
    }

    /// Default location for a persisted tuning table.
    pub fn default_tuning_params_path() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("ktune").join("tuned_params.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let cfg = DispatchConfig::default();
        assert!(!cfg.tuning);
        assert_eq!(cfg.queue_window_size, 0);
        assert!(!cfg.limit_kernel_time);
        assert_eq!(cfg.max_kernel_exec_time_us, 1000.0);
        assert!(cfg.non_uniform_work_groups);
        assert!(cfg.tuning_params_path.is_none());
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("KTUNE_TUNING", "yes"),
            ("KTUNE_QUEUE_WINDOW_SIZE", "16"),
            ("KTUNE_LIMIT_KERNEL_TIME", "on"),
            ("KTUNE_MAX_KERNEL_EXEC_TIME_US", "not-a-number"),
            ("KTUNE_NON_UNIFORM_WORK_GROUPS", "0"),
        ]
        .into_iter()
        .collect();
        let mut cfg = DispatchConfig::default();
        cfg.apply_env_overrides_with(|k| env.get(k).map(|v| v.to_string()));
        assert!(cfg.tuning);
        assert_eq!(cfg.queue_window_size, 16);
        assert!(cfg.limit_kernel_time);
        assert_eq!(cfg.max_kernel_exec_time_us, 1000.0);
        assert!(!cfg.non_uniform_work_groups);
    }

    #[test]
    fn json_is_kebab_case_with_defaults() {
        let cfg: DispatchConfig =
            serde_json::from_str(r#"{ "queue-window-size": 4, "out-of-range-check": true }"#)
                .expect("parse");
        assert_eq!(cfg.queue_window_size, 4);
        assert!(cfg.out_of_range_check);
        assert!(!cfg.tuning);
        assert!(cfg.non_uniform_work_groups);
    }
}
