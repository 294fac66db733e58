//! Persisted settings – reads/writes `~/.timberline/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use timberline_runtime::CoordinatorConfig;
use timberline_types::TimberError;

/// Persisted user configuration stored in `~/.timberline/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root directory of every topic (`/<root>/user_checkin_topic`, …).
    #[serde(default = "default_topic_root")]
    pub topic_root: String,

    /// Expected spacing of AR client heartbeats.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How often the liveness scheduler sweeps the registry.
    #[serde(default = "default_sweep_period_ms")]
    pub sweep_period_ms: u64,

    /// How often the controller re-checks the confirmation barrier.
    #[serde(default = "default_barrier_poll_ms")]
    pub barrier_poll_ms: u64,

    /// Per-topic buffer of the in-process bus.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// Let a step proceed when no AR user is present.
    #[serde(default)]
    pub allow_empty_barrier: bool,

    /// Number of simulated AR observers spawned by the demo run.
    #[serde(default = "default_mock_observers")]
    pub mock_observers: usize,

    /// Delay before a simulated observer confirms a step.
    #[serde(default = "default_mock_confirm_delay_ms")]
    pub mock_confirm_delay_ms: u64,

    /// External broker the AR clients talk to.  Shown for reference only;
    /// the demo runs on the in-process bus.
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
}

fn default_topic_root() -> String {
    "T2_command_test".to_string()
}
fn default_heartbeat_interval_ms() -> u64 {
    2000
}
fn default_sweep_period_ms() -> u64 {
    500
}
fn default_barrier_poll_ms() -> u64 {
    100
}
fn default_bus_capacity() -> usize {
    256
}
fn default_mock_observers() -> usize {
    2
}
fn default_mock_confirm_delay_ms() -> u64 {
    300
}
fn default_broker_url() -> String {
    "broker.hivemq.com".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topic_root: default_topic_root(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            sweep_period_ms: default_sweep_period_ms(),
            barrier_poll_ms: default_barrier_poll_ms(),
            bus_capacity: default_bus_capacity(),
            allow_empty_barrier: false,
            mock_observers: default_mock_observers(),
            mock_confirm_delay_ms: default_mock_confirm_delay_ms(),
            broker_url: default_broker_url(),
        }
    }
}

impl Config {
    /// Runtime view of the settings.  Validation happens when the
    /// coordinator is built.
    pub fn to_coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            topic_root: self.topic_root.clone(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            sweep_period: Duration::from_millis(self.sweep_period_ms),
            barrier_poll: Duration::from_millis(self.barrier_poll_ms),
            allow_empty_barrier: self.allow_empty_barrier,
        }
    }
}

/// Return the path to `~/.timberline/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".timberline").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, TimberError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, TimberError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        TimberError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| TimberError::Config(format!("failed to parse config: {e}")))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `TIMBERLINE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TIMBERLINE_TOPIC_ROOT` | `topic_root` |
/// | `TIMBERLINE_HEARTBEAT_MS` | `heartbeat_interval_ms` |
/// | `TIMBERLINE_POLL_MS` | `barrier_poll_ms` |
/// | `TIMBERLINE_MOCK_OBSERVERS` | `mock_observers` |
///
/// Numeric values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TIMBERLINE_TOPIC_ROOT") {
        cfg.topic_root = v;
    }
    if let Ok(v) = std::env::var("TIMBERLINE_HEARTBEAT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.heartbeat_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("TIMBERLINE_POLL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.barrier_poll_ms = ms;
    }
    if let Ok(v) = std::env::var("TIMBERLINE_MOCK_OBSERVERS")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.mock_observers = n;
    }
}

/// Save the config to disk, creating `~/.timberline/` if necessary.
pub fn save(cfg: &Config) -> Result<(), TimberError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), TimberError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| TimberError::Config(format!("failed to create config directory: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                TimberError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| TimberError::Config(format!("failed to serialize config: {e}")))?;
    let write_err =
        |e: std::io::Error| TimberError::Config(format!("failed to write config at {}: {e}", path.display()));
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");
        let loaded = load_from(&path).expect("load ok").expect("some");

        assert_eq!(loaded.sweep_period_ms, 500);
        assert_eq!(loaded.mock_confirm_delay_ms, 300);
        assert_eq!(loaded.broker_url, "broker.hivemq.com");
        assert!(!loaded.allow_empty_barrier);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "topic_root = \"site_b\"\nmock_observers = 5\n").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.mock_observers, 5);
        assert_eq!(loaded.sweep_period_ms, 500);
        assert_eq!(loaded.bus_capacity, 256);
    }

    #[test]
    fn unparsable_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "heartbeat_interval_ms = \"soon\"").unwrap();
        assert!(matches!(load_from(&path), Err(TimberError::Config(_))));
    }

    #[test]
    fn config_path_points_to_timberline_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".timberline"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn coordinator_config_carries_durations() {
        let cfg = Config {
            heartbeat_interval_ms: 1500,
            allow_empty_barrier: true,
            ..Config::default()
        };
        let runtime = cfg.to_coordinator_config();
        assert_eq!(runtime.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(runtime.sweep_period, Duration::from_millis(500));
        assert!(runtime.allow_empty_barrier);
        assert!(runtime.validate().is_ok());
    }

    #[test]
    fn bad_topic_root_fails_validation() {
        let cfg = Config {
            topic_root: "T2 command".into(),
            ..Config::default()
        };
        assert!(matches!(
            cfg.to_coordinator_config().validate(),
            Err(TimberError::Config(_))
        ));
    }

    #[test]
    fn apply_env_overrides_changes_topic_root() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("TIMBERLINE_TOPIC_ROOT", "site_c") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.topic_root, "site_c");
        unsafe { std::env::remove_var("TIMBERLINE_TOPIC_ROOT") };
    }

    #[test]
    fn apply_env_overrides_changes_heartbeat() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("TIMBERLINE_HEARTBEAT_MS", "750") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.heartbeat_interval_ms, 750);
        unsafe { std::env::remove_var("TIMBERLINE_HEARTBEAT_MS") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_observer_count() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("TIMBERLINE_MOCK_OBSERVERS", "many") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.mock_observers, 2);
        unsafe { std::env::remove_var("TIMBERLINE_MOCK_OBSERVERS") };
    }

    #[test]
    fn apply_env_overrides_changes_poll() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("TIMBERLINE_POLL_MS", "25") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.barrier_poll_ms, 25);
        unsafe { std::env::remove_var("TIMBERLINE_POLL_MS") };
    }
}
