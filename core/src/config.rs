//! Runtime configuration: a base `mcpl.toml` merged with overrides, plus the
//! path conventions the rest of `mcpl-core` uses to find its state on disk.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

const CONFIG_TOML_FILE: &str = "mcpl.toml";

/// Runtime configuration for a host process, loaded from `MCPL_HOME/mcpl.toml`
/// and merged with programmatic overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub mcpl_home: PathBuf,

    /// Event Queue (§4.6).
    pub max_pushes_per_hour: u32,
    pub idempotency_window: Duration,
    pub max_queue_size: usize,

    /// Inference Broker (§4.7).
    pub max_inferences_per_hour: u32,

    /// Hook Manager (§4.5).
    pub before_inference_timeout: Duration,
    pub hook_rate_limit_per_minute: u32,

    /// Scope Subsystem (§4.9).
    pub scope_change_timeout: Duration,
    pub scope_elevate_default_timeout: Duration,

    /// State Manager (§4.8).
    pub checkpoint_interval: u64,
    pub max_state_bytes: usize,
    pub max_checkpoint_nodes: usize,
    pub max_tombstones: usize,

    /// Delegate Manager (§4.3).
    pub default_tool_call_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mcpl_home: PathBuf::new(),
            max_pushes_per_hour: 60,
            idempotency_window: Duration::from_secs(30 * 60),
            max_queue_size: 100,
            max_inferences_per_hour: 30,
            before_inference_timeout: Duration::from_secs(5),
            hook_rate_limit_per_minute: 10,
            scope_change_timeout: Duration::from_secs(5 * 60),
            scope_elevate_default_timeout: Duration::from_secs(60),
            checkpoint_interval: 10,
            max_state_bytes: 256 * 1024,
            max_checkpoint_nodes: 50,
            max_tombstones: 200,
            default_tool_call_timeout: Duration::from_secs(30),
        }
    }
}

/// Strongly-typed mirror of `mcpl.toml`; every field is optional so a
/// partial file only overrides what it names.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct ConfigToml {
    max_pushes_per_hour: Option<u32>,
    idempotency_window_secs: Option<u64>,
    max_queue_size: Option<usize>,
    max_inferences_per_hour: Option<u32>,
    before_inference_timeout_secs: Option<u64>,
    hook_rate_limit_per_minute: Option<u32>,
    scope_change_timeout_secs: Option<u64>,
    scope_elevate_default_timeout_secs: Option<u64>,
    checkpoint_interval: Option<u64>,
    max_state_bytes: Option<usize>,
    max_checkpoint_nodes: Option<usize>,
    max_tombstones: Option<usize>,
    default_tool_call_timeout_secs: Option<u64>,
}

/// Caller-supplied overrides, applied after the file is parsed. Used by CLI
/// flags and by tests that want a hermetic configuration.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub mcpl_home: Option<PathBuf>,
}

impl Config {
    pub fn load_with_overrides(overrides: ConfigOverrides) -> Result<Self> {
        let mcpl_home = match overrides.mcpl_home {
            Some(dir) => dir,
            None => find_mcpl_home()?,
        };
        let toml = load_config_as_toml(&mcpl_home)?;
        Ok(Self::from_toml(toml, mcpl_home))
    }

    fn from_toml(toml: ConfigToml, mcpl_home: PathBuf) -> Self {
        let defaults = Self::default();
        Self {
            mcpl_home,
            max_pushes_per_hour: toml.max_pushes_per_hour.unwrap_or(defaults.max_pushes_per_hour),
            idempotency_window: toml
                .idempotency_window_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.idempotency_window),
            max_queue_size: toml.max_queue_size.unwrap_or(defaults.max_queue_size),
            max_inferences_per_hour: toml
                .max_inferences_per_hour
                .unwrap_or(defaults.max_inferences_per_hour),
            before_inference_timeout: toml
                .before_inference_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.before_inference_timeout),
            hook_rate_limit_per_minute: toml
                .hook_rate_limit_per_minute
                .unwrap_or(defaults.hook_rate_limit_per_minute),
            scope_change_timeout: toml
                .scope_change_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.scope_change_timeout),
            scope_elevate_default_timeout: toml
                .scope_elevate_default_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.scope_elevate_default_timeout),
            checkpoint_interval: toml.checkpoint_interval.unwrap_or(defaults.checkpoint_interval),
            max_state_bytes: toml.max_state_bytes.unwrap_or(defaults.max_state_bytes),
            max_checkpoint_nodes: toml
                .max_checkpoint_nodes
                .unwrap_or(defaults.max_checkpoint_nodes),
            max_tombstones: toml.max_tombstones.unwrap_or(defaults.max_tombstones),
            default_tool_call_timeout: toml
                .default_tool_call_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_tool_call_timeout),
        }
    }
}

/// Reads `mcpl_home/mcpl.toml`. Returns defaults (an empty table) when the
/// file does not exist; a parse error is surfaced to the caller.
fn load_config_as_toml(mcpl_home: &Path) -> Result<ConfigToml> {
    let path = mcpl_home.join(CONFIG_TOML_FILE);
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "mcpl.toml not found, using defaults");
            Ok(ConfigToml::default())
        }
        Err(e) => Err(e.into()),
    }
}

/// Resolves the directory that stores MCPL state, honoring the `MCPL_HOME`
/// environment variable and defaulting to `~/.mcpl`.
pub fn find_mcpl_home() -> Result<PathBuf> {
    if let Ok(val) = std::env::var("MCPL_HOME")
        && !val.is_empty()
    {
        return Ok(PathBuf::from(val));
    }
    let mut p = dirs::home_dir().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "could not find home directory")
    })?;
    p.push(".mcpl");
    Ok(p)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = Config::load_with_overrides(ConfigOverrides {
            mcpl_home: Some(dir.path().to_path_buf()),
        })
        .expect("loads with defaults");
        assert_eq!(cfg.max_pushes_per_hour, 60);
        assert_eq!(cfg.max_inferences_per_hour, 30);
    }

    #[test]
    fn partial_file_only_overrides_named_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(CONFIG_TOML_FILE),
            "max_pushes_per_hour = 5\n",
        )
        .expect("write config");
        let cfg = Config::load_with_overrides(ConfigOverrides {
            mcpl_home: Some(dir.path().to_path_buf()),
        })
        .expect("loads");
        assert_eq!(cfg.max_pushes_per_hour, 5);
        assert_eq!(cfg.max_queue_size, 100);
    }
}
