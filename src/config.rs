use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::paths;

/// Lets the property engine stop a running VM on its own
pub const ENV_AUTO_STOP_VMS: &str = "ENGINECTL_AUTO_STOP_VMS";

/// Ignore user scope settings entirely
pub const ENV_SYSTEM_SETTINGS_ONLY: &str = "ENGINECTL_SYSTEM_SETTINGS_ONLY";

// ============================================================================
// App Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Program used to talk to VirtualBox
    pub vboxmanage: String,
    /// Optional program implementing the script hook functions
    pub hook: Option<String>,
    /// Only read installation provided settings, never write user ones
    pub system_settings_only: bool,
    /// Device models an emulator may be configured with
    pub device_models: Vec<DeviceModel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceModel {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            vboxmanage: "VBoxManage".to_string(),
            hook: None,
            system_settings_only: false,
            device_models: vec![
                DeviceModel {
                    name: "Sailfish OS Emulator".to_string(),
                    width: 480,
                    height: 854,
                },
                DeviceModel {
                    name: "Sailfish OS Emulator Large".to_string(),
                    width: 720,
                    height: 1280,
                },
            ],
        }
    }
}

impl AppConfig {
    /// Load `config.toml` from `dir`, falling back to defaults if absent
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(paths::APP_CONFIG_FILE);
        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Could not read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Invalid {} format", path.display()))?
        } else {
            log::debug!("No {} found, using defaults", path.display());
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if env_flag(ENV_SYSTEM_SETTINGS_ONLY) {
            self.system_settings_only = true;
        }
    }
}

/// Whether the user allowed stopping running VMs without asking
pub fn auto_stop_vms() -> bool {
    env_flag(ENV_AUTO_STOP_VMS)
}

/// Non-zero integer environment flag
fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .is_some_and(|v| v != 0)
}
