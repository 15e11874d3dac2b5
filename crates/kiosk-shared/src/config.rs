//! Configuration management for kioskd.
//!
//! Loads settings from /etc/kiosk/supervisor.toml (or $KIOSK_CONFIG) or uses
//! defaults. Every key is optional; missing keys take the documented default.

use crate::error::{KioskError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/kiosk/supervisor.toml";

/// Environment override for the config file path
pub const CONFIG_ENV: &str = "KIOSK_CONFIG";

/// Names of the supervised services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// The display application (content server)
    #[serde(default = "default_application")]
    pub application: String,

    /// The browser/renderer showing the application
    #[serde(default = "default_renderer")]
    pub renderer: String,

    /// The X server / display manager unit
    #[serde(default = "default_display_server")]
    pub display_server: String,
}

fn default_application() -> String {
    "kiosk-app.service".to_string()
}

fn default_renderer() -> String {
    "kiosk-browser.service".to_string()
}

fn default_display_server() -> String {
    "display-manager.service".to_string()
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            application: default_application(),
            renderer: default_renderer(),
            display_server: default_display_server(),
        }
    }
}

/// Health probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Title of the kiosk window that must be visible
    #[serde(default = "default_window_title")]
    pub window_title: String,

    /// X display the introspection commands talk to
    #[serde(default = "default_display")]
    pub display: String,

    /// HTTP liveness timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Timeout for display/service query commands in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Endpoint served during normal hours
    #[serde(default = "default_normal_endpoint")]
    pub normal_endpoint: String,

    /// Endpoint served during the quiet window
    #[serde(default = "default_quiet_endpoint")]
    pub quiet_endpoint: String,

    /// First hour (0-23, local time) of the quiet window
    #[serde(default = "default_quiet_start")]
    pub quiet_start_hour: u32,

    /// Hour (0-23, local time) at which the quiet window ends
    #[serde(default = "default_quiet_end")]
    pub quiet_end_hour: u32,
}

fn default_window_title() -> String {
    "Kiosk".to_string()
}

fn default_display() -> String {
    ":0".to_string()
}

fn default_http_timeout() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    5
}

fn default_normal_endpoint() -> String {
    "http://127.0.0.1:8080/".to_string()
}

fn default_quiet_endpoint() -> String {
    "http://127.0.0.1:8080/screensaver".to_string()
}

fn default_quiet_start() -> u32 {
    22
}

fn default_quiet_end() -> u32 {
    6
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            window_title: default_window_title(),
            display: default_display(),
            http_timeout_secs: default_http_timeout(),
            command_timeout_secs: default_command_timeout(),
            normal_endpoint: default_normal_endpoint(),
            quiet_endpoint: default_quiet_endpoint(),
            quiet_start_hour: default_quiet_start(),
            quiet_end_hour: default_quiet_end(),
        }
    }
}

impl ProbeConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Seconds to wait after each remediation before re-probing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleConfig {
    #[serde(default = "default_settle_service")]
    pub service_restart: u64,

    #[serde(default = "default_settle_cache")]
    pub cache_clear_restart: u64,

    #[serde(default = "default_settle_display")]
    pub display_server_restart: u64,
}

fn default_settle_service() -> u64 {
    30
}

fn default_settle_cache() -> u64 {
    45
}

fn default_settle_display() -> u64 {
    60
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            service_restart: default_settle_service(),
            cache_clear_restart: default_settle_cache(),
            display_server_restart: default_settle_display(),
        }
    }
}

/// Recovery ladder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Healthy spell after which escalation history is forgiven
    #[serde(default = "default_quiescence_window")]
    pub quiescence_window_secs: u64,

    #[serde(default)]
    pub settle: SettleConfig,

    /// Delay between the terminal log write and the reboot
    #[serde(default = "default_reboot_grace")]
    pub reboot_grace_secs: u64,

    /// Age past which a held supervisor lock is reclaimed
    #[serde(default = "default_lock_stale_after")]
    pub lock_stale_after_secs: u64,

    /// Renderer cache/profile directories cleared at severity 2
    #[serde(default = "default_renderer_cache_dirs")]
    pub renderer_cache_dirs: Vec<PathBuf>,

    #[serde(default = "default_reboot_command")]
    pub reboot_command: Vec<String>,
}

fn default_quiescence_window() -> u64 {
    3600
}

fn default_reboot_grace() -> u64 {
    10
}

fn default_lock_stale_after() -> u64 {
    900 // > 2x the slowest action plus its settle time
}

fn default_renderer_cache_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/home/kiosk/.cache/chromium"),
        PathBuf::from("/home/kiosk/.config/chromium/Default/Cache"),
    ]
}

fn default_reboot_command() -> Vec<String> {
    vec!["systemctl".to_string(), "reboot".to_string()]
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            quiescence_window_secs: default_quiescence_window(),
            settle: SettleConfig::default(),
            reboot_grace_secs: default_reboot_grace(),
            lock_stale_after_secs: default_lock_stale_after(),
            renderer_cache_dirs: default_renderer_cache_dirs(),
            reboot_command: default_reboot_command(),
        }
    }
}

impl RecoveryConfig {
    pub fn quiescence_window(&self) -> Duration {
        Duration::from_secs(self.quiescence_window_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_after_secs)
    }

    pub fn reboot_grace(&self) -> Duration {
        Duration::from_secs(self.reboot_grace_secs)
    }
}

/// Resource pressure thresholds and cleanup targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default = "default_memory_cleanup_pct")]
    pub memory_cleanup_pct: f64,

    #[serde(default = "default_memory_restart_pct")]
    pub memory_restart_pct: f64,

    /// Mount point whose usage drives the disk ladder
    #[serde(default = "default_disk_mount")]
    pub disk_mount: PathBuf,

    #[serde(default = "default_disk_cleanup_pct")]
    pub disk_cleanup_pct: f64,

    #[serde(default = "default_disk_critical_pct")]
    pub disk_critical_pct: f64,

    /// Per-core CPU percentage that counts as pinned
    #[serde(default = "default_cpu_pin_pct")]
    pub cpu_pin_pct: f32,

    /// Seconds a process must have been pinned before it is killed
    #[serde(default = "default_cpu_pin_secs")]
    pub cpu_pin_secs: u64,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_noisy_peers")]
    pub noisy_peers_to_close: usize,

    #[serde(default = "default_temp_dirs")]
    pub temp_dirs: Vec<PathBuf>,

    #[serde(default = "default_temp_max_age_hours")]
    pub temp_max_age_hours: u64,

    #[serde(default = "default_log_dirs")]
    pub log_dirs: Vec<PathBuf>,

    /// Logs larger than this are truncated to their tail
    #[serde(default = "default_log_max_bytes")]
    pub log_max_bytes: u64,

    #[serde(default = "default_log_tail_bytes")]
    pub log_tail_bytes: u64,

    /// Destructive pass: logs untouched for this many days are emptied
    #[serde(default = "default_log_stale_days")]
    pub log_stale_days: u64,

    /// Destructive pass: retained runtime artifacts (rotated logs, crash dumps)
    #[serde(default = "default_artifact_dirs")]
    pub artifact_dirs: Vec<PathBuf>,

    #[serde(default = "default_package_cache_command")]
    pub package_cache_command: Vec<String>,

    #[serde(default = "default_journal_vacuum_command")]
    pub journal_vacuum_command: Vec<String>,

    /// Process names the CPU breaker never kills
    #[serde(default = "default_protected_processes")]
    pub protected_processes: Vec<String>,
}

fn default_memory_cleanup_pct() -> f64 {
    85.0
}

fn default_memory_restart_pct() -> f64 {
    90.0
}

fn default_disk_mount() -> PathBuf {
    PathBuf::from("/")
}

fn default_disk_cleanup_pct() -> f64 {
    80.0
}

fn default_disk_critical_pct() -> f64 {
    95.0
}

fn default_cpu_pin_pct() -> f32 {
    90.0
}

fn default_cpu_pin_secs() -> u64 {
    300
}

fn default_max_connections() -> usize {
    512
}

fn default_noisy_peers() -> usize {
    3
}

fn default_temp_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/tmp"), PathBuf::from("/var/tmp")]
}

fn default_temp_max_age_hours() -> u64 {
    24
}

fn default_log_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/var/log")]
}

fn default_log_max_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_log_tail_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_log_stale_days() -> u64 {
    7
}

fn default_artifact_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/var/crash"),
        PathBuf::from("/var/lib/systemd/coredump"),
    ]
}

fn default_package_cache_command() -> Vec<String> {
    vec!["apt-get".to_string(), "clean".to_string()]
}

fn default_journal_vacuum_command() -> Vec<String> {
    vec!["journalctl".to_string(), "--vacuum-time=2d".to_string()]
}

fn default_protected_processes() -> Vec<String> {
    vec![
        "systemd".to_string(),
        "Xorg".to_string(),
        "kioskd".to_string(),
    ]
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            memory_cleanup_pct: default_memory_cleanup_pct(),
            memory_restart_pct: default_memory_restart_pct(),
            disk_mount: default_disk_mount(),
            disk_cleanup_pct: default_disk_cleanup_pct(),
            disk_critical_pct: default_disk_critical_pct(),
            cpu_pin_pct: default_cpu_pin_pct(),
            cpu_pin_secs: default_cpu_pin_secs(),
            max_connections: default_max_connections(),
            noisy_peers_to_close: default_noisy_peers(),
            temp_dirs: default_temp_dirs(),
            temp_max_age_hours: default_temp_max_age_hours(),
            log_dirs: default_log_dirs(),
            log_max_bytes: default_log_max_bytes(),
            log_tail_bytes: default_log_tail_bytes(),
            log_stale_days: default_log_stale_days(),
            artifact_dirs: default_artifact_dirs(),
            package_cache_command: default_package_cache_command(),
            journal_vacuum_command: default_journal_vacuum_command(),
            protected_processes: default_protected_processes(),
        }
    }
}

/// On-disk locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_decision_log_max")]
    pub decision_log_max_entries: usize,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/kiosk")
}

fn default_decision_log_max() -> usize {
    10_000
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            decision_log_max_entries: default_decision_log_max(),
        }
    }
}

impl PathsConfig {
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("recovery_state.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join("supervisor.lock")
    }

    pub fn decision_log(&self) -> PathBuf {
        self.state_dir.join("decisions.jsonl")
    }
}

/// Intervals used by `kioskd watch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_probe_interval() -> u64 {
    120
}

fn default_sweep_interval() -> u64 {
    900
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Full supervisor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub services: ServicesConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub resources: ResourcesConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl Config {
    /// Resolve the config path: explicit path, then $KIOSK_CONFIG, then the default.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_PATH))
    }

    /// Load config from the resolved path.
    ///
    /// A missing file yields defaults; a file that does not parse is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(explicit);
        if !path.exists() {
            warn!("Config {} not found, using defaults", path.display());
            return Ok(Config::default());
        }
        Self::load_from_path(&path)
    }

    /// Load config from specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let probe = &self.probe;
        if probe.quiet_start_hour > 23 || probe.quiet_end_hour > 23 {
            return Err(KioskError::Config(format!(
                "quiet hours must be 0-23, got {}..{}",
                probe.quiet_start_hour, probe.quiet_end_hour
            )));
        }
        let res = &self.resources;
        if res.memory_restart_pct < res.memory_cleanup_pct {
            return Err(KioskError::Config(
                "memory_restart_pct must not be below memory_cleanup_pct".to_string(),
            ));
        }
        if res.disk_critical_pct < res.disk_cleanup_pct {
            return Err(KioskError::Config(
                "disk_critical_pct must not be below disk_cleanup_pct".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.probe.http_timeout_secs, 5);
        assert_eq!(config.recovery.quiescence_window_secs, 3600);
        assert_eq!(config.resources.memory_cleanup_pct, 85.0);
        assert_eq!(config.resources.disk_critical_pct, 95.0);
        assert_eq!(config.schedule.probe_interval_secs, 120);
        assert_eq!(
            config.paths.state_file(),
            PathBuf::from("/var/lib/kiosk/recovery_state.json")
        );
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
[services]
renderer = "chromium-kiosk.service"

[recovery.settle]
service_restart = 5

[resources]
disk_cleanup_pct = 70
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.services.renderer, "chromium-kiosk.service");
        assert_eq!(config.services.application, "kiosk-app.service");
        assert_eq!(config.recovery.settle.service_restart, 5);
        assert_eq!(config.recovery.settle.display_server_restart, 60);
        assert_eq!(config.resources.disk_cleanup_pct, 70.0);
        assert_eq!(config.resources.log_stale_days, 7);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.services.display_server, "display-manager.service");
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("supervisor.toml");
        fs::write(
            &path,
            "[resources]\nmemory_cleanup_pct = 95\nmemory_restart_pct = 90\n",
        )
        .unwrap();
        assert!(Config::load_from_path(&path).is_err());
    }

    #[test]
    fn test_malformed_toml_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("supervisor.toml");
        fs::write(&path, "[probe\nwindow_title = ").unwrap();
        assert!(matches!(
            Config::load(Some(&path)),
            Err(KioskError::Toml(_))
        ));
    }
}
