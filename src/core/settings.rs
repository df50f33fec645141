//! Service settings management

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Identity of the hard-wired primary admin
pub const DEFAULT_PRIMARY_ADMIN_ID: &str = "1061287786755395585";

/// A way to pay for credits, shown by `.buyc`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub name: String,
    pub details: String,
}

/// Service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // General
    /// Custom data directory holding the JSON tables
    pub data_directory: Option<PathBuf>,
    /// Primary admin, always authorized and never stored in the roster
    pub primary_admin_id: String,
    /// Enable debug logging
    pub debug_logging: bool,

    // Container runtime
    /// Container runtime CLI binary
    pub runtime_binary: String,
    /// Image used for launch and reinstall
    pub base_image: String,
    /// Storage pool new containers are placed on
    pub storage_pool: String,
    /// Storage for admin-created containers when none is given
    pub default_custom_storage_gb: u32,
    /// Default runtime command timeout
    pub command_timeout_secs: u64,
    /// Timeout for `start`
    pub start_timeout_secs: u64,
    /// Timeout for `stop`
    pub stop_timeout_secs: u64,
    /// Timeout for each best-effort filesystem growth step
    pub filesystem_grow_timeout_secs: u64,
    /// Pause between opening a tmate session and querying it
    pub ssh_settle_secs: u64,

    // CPU guard
    /// Host CPU percentage above which all containers are stopped
    pub cpu_threshold_percent: f32,
    /// Seconds between CPU samples
    pub cpu_check_interval_secs: u64,
    /// Initial guard state
    pub cpu_guard_enabled: bool,

    // Confirmations
    /// Lifetime of reinstall / stop-all confirmation tokens
    pub confirmation_ttl_secs: u64,

    // Credits
    /// Payment options listed to users buying credits
    pub payment_methods: Vec<PaymentMethod>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            // General
            data_directory: None,
            primary_admin_id: DEFAULT_PRIMARY_ADMIN_ID.to_string(),
            debug_logging: false,

            // Container runtime
            runtime_binary: "lxc".to_string(),
            base_image: "debian:12".to_string(),
            storage_pool: "btrpool".to_string(),
            default_custom_storage_gb: 10,
            command_timeout_secs: 300,
            start_timeout_secs: 120,
            stop_timeout_secs: 300,
            filesystem_grow_timeout_secs: 240,
            ssh_settle_secs: 3,

            // CPU guard
            cpu_threshold_percent: 90.0,
            cpu_check_interval_secs: 60,
            cpu_guard_enabled: true,

            // Confirmations
            confirmation_ttl_secs: 60,

            // Credits
            payment_methods: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, falling back to defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No settings file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;
        let mut settings: Settings = match serde_json::from_str(&text) {
            Ok(s) => s,
            Err(e) => {
                warn!("Settings file {:?} is invalid ({}), using defaults", path, e);
                Settings::default()
            }
        };
        // Validate and fix any invalid values after deserialization
        settings.validate();
        Ok(settings)
    }

    /// Save settings as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vps-manager")
        })
    }

    /// Default location of the settings file
    pub fn default_settings_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vps-manager")
            .join("settings.json")
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.cpu_threshold_percent = self.cpu_threshold_percent.clamp(1.0, 100.0);
        self.cpu_check_interval_secs = self.cpu_check_interval_secs.max(5);
        self.command_timeout_secs = self.command_timeout_secs.max(1);
        self.start_timeout_secs = self.start_timeout_secs.max(1);
        self.stop_timeout_secs = self.stop_timeout_secs.max(1);
        self.filesystem_grow_timeout_secs = self.filesystem_grow_timeout_secs.max(1);
        self.confirmation_ttl_secs = self.confirmation_ttl_secs.max(1);
        self.default_custom_storage_gb = self.default_custom_storage_gb.max(1);
        if self.primary_admin_id.trim().is_empty() {
            self.primary_admin_id = DEFAULT_PRIMARY_ADMIN_ID.to_string();
        }
    }

    /// Runtime timeouts derived from settings
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            default: Duration::from_secs(self.command_timeout_secs),
            start: Duration::from_secs(self.start_timeout_secs),
            stop: Duration::from_secs(self.stop_timeout_secs),
            filesystem_grow: Duration::from_secs(self.filesystem_grow_timeout_secs),
        }
    }

    /// Provisioning parameters derived from settings
    pub fn provisioning(&self) -> Provisioning {
        Provisioning {
            image: self.base_image.clone(),
            storage_pool: self.storage_pool.clone(),
            timeouts: self.timeouts(),
            confirmation_ttl: Duration::from_secs(self.confirmation_ttl_secs),
            ssh_settle: Duration::from_secs(self.ssh_settle_secs),
        }
    }
}

/// Timeout budget per runtime verb class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub default: Duration,
    pub start: Duration,
    pub stop: Duration,
    pub filesystem_grow: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Settings::default().timeouts()
    }
}

/// What the lifecycle manager needs from settings
#[derive(Debug, Clone)]
pub struct Provisioning {
    pub image: String,
    pub storage_pool: String,
    pub timeouts: Timeouts,
    pub confirmation_ttl: Duration,
    pub ssh_settle: Duration,
}

impl Default for Provisioning {
    fn default() -> Self {
        Settings::default().provisioning()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_gets_a_longer_budget_than_start() {
        let t = Settings::default().timeouts();
        assert!(t.stop > t.start);
    }

    #[test]
    fn validate_clamps_out_of_range_values() {
        let mut s = Settings {
            cpu_threshold_percent: 250.0,
            cpu_check_interval_secs: 0,
            stop_timeout_secs: 0,
            primary_admin_id: "  ".into(),
            ..Default::default()
        };
        s.validate();
        assert_eq!(s.cpu_threshold_percent, 100.0);
        assert_eq!(s.cpu_check_interval_secs, 5);
        assert_eq!(s.stop_timeout_secs, 1);
        assert_eq!(s.primary_admin_id, DEFAULT_PRIMARY_ADMIN_ID);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "storage_pool": "default", "cpu_threshold_percent": 75 }"#)
            .unwrap();

        let s = Settings::load(&path).unwrap();
        assert_eq!(s.storage_pool, "default");
        assert_eq!(s.cpu_threshold_percent, 75.0);
        assert_eq!(s.base_image, "debian:12");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(s.runtime_binary, "lxc");
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let s = Settings {
            base_image: "ubuntu:24.04".into(),
            ..Default::default()
        };
        s.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap().base_image, "ubuntu:24.04");
    }
}
