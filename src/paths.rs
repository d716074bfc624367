//! Centralized path resolution for enginectl
//!
//! # Environment Variables
//!
//! - `ENGINECTL_CONFIG_DIR` - Override the user config directory
//! - `ENGINECTL_SYSTEM_CONFIG_DIR` - Override the system settings directory
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `ENGINECTL_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/enginectl` (if set)
//! 3. `~/.config/enginectl`
//!
//! For system_config_dir():
//! 1. `ENGINECTL_SYSTEM_CONFIG_DIR` environment variable
//! 2. `/usr/share/enginectl`

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "ENGINECTL_CONFIG_DIR";

/// Environment variable for system settings directory override
pub const ENV_SYSTEM_CONFIG_DIR: &str = "ENGINECTL_SYSTEM_CONFIG_DIR";

/// Installation provided settings
pub const DEFAULT_SYSTEM_CONFIG_DIR: &str = "/usr/share/enginectl";

/// Application config file name inside the config directory
pub const APP_CONFIG_FILE: &str = "config.toml";

/// Build engine settings file name
pub const ENGINES_FILE: &str = "engines.json";

/// Emulator settings file name
pub const EMULATORS_FILE: &str = "emulators.json";

/// Get the user config directory path
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = expand(&dir);
        log::debug!(
            "Using config dir from {}: {}",
            ENV_CONFIG_DIR,
            path.display()
        );
        return Ok(path);
    }

    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config).join("enginectl");
        log::debug!("Using XDG_CONFIG_HOME: {}", path.display());
        return Ok(path);
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".config").join("enginectl");
    log::debug!("Using default config dir: {}", path.display());
    Ok(path)
}

/// Get the system settings directory path
pub fn system_config_dir() -> PathBuf {
    match std::env::var(ENV_SYSTEM_CONFIG_DIR) {
        Ok(dir) => expand(&dir),
        Err(_) => PathBuf::from(DEFAULT_SYSTEM_CONFIG_DIR),
    }
}

/// Root of the per-target tool wrappers below `config_dir`
pub fn targets_tools_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("targets-tools")
}

/// Expand ~ and environment variables in a path string.
///
/// # Examples
///
/// ```ignore
/// use enginectl::paths;
///
/// let shared = paths::expand("~/SailfishOS/mersdk/targets");
/// let custom = paths::expand("$SDK_ROOT/targets");
/// ```
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Helper to run a test with temporary env var
    ///
    /// # Safety
    /// This function uses unsafe env::set_var/remove_var which can cause issues
    /// if other threads read environment variables concurrently.
    fn with_env_var<F, R>(key: &str, value: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let original = env::var(key).ok();
        // SAFETY: Tests run in isolation and don't read env vars concurrently
        unsafe { env::set_var(key, value) };
        let result = f();
        match original {
            // SAFETY: Tests run in isolation
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
        result
    }

    fn without_env_var<F, R>(key: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let original = env::var(key).ok();
        // SAFETY: Tests run in isolation and don't read env vars concurrently
        unsafe { env::remove_var(key) };
        let result = f();
        if let Some(v) = original {
            // SAFETY: Tests run in isolation
            unsafe { env::set_var(key, v) };
        }
        result
    }

    #[test]
    fn test_config_dir_env_override() {
        with_env_var(ENV_CONFIG_DIR, "/custom/enginectl", || {
            assert_eq!(config_dir().unwrap(), PathBuf::from("/custom/enginectl"));
        });
    }

    #[test]
    fn test_config_dir_xdg() {
        without_env_var(ENV_CONFIG_DIR, || {
            with_env_var("XDG_CONFIG_HOME", "/tmp/xdg-enginectl-test", || {
                assert_eq!(
                    config_dir().unwrap(),
                    PathBuf::from("/tmp/xdg-enginectl-test/enginectl")
                );
            });
        });
    }

    #[test]
    fn test_system_config_dir_default() {
        without_env_var(ENV_SYSTEM_CONFIG_DIR, || {
            assert_eq!(
                system_config_dir(),
                PathBuf::from(DEFAULT_SYSTEM_CONFIG_DIR)
            );
        });
    }

    #[test]
    fn test_system_config_dir_override_expands_tilde() {
        let home = dirs::home_dir().unwrap();
        with_env_var(ENV_SYSTEM_CONFIG_DIR, "~/sdk-system-test", || {
            assert_eq!(system_config_dir(), home.join("sdk-system-test"));
        });
    }

    #[test]
    fn test_targets_tools_dir() {
        assert_eq!(
            targets_tools_dir(Path::new("/cfg")),
            PathBuf::from("/cfg/targets-tools")
        );
    }

    #[test]
    fn test_expand_unknown_env_var_unchanged() {
        let result = expand("/path/$NONEXISTENT_ENGINECTL_VAR/file");
        assert_eq!(
            result,
            PathBuf::from("/path/$NONEXISTENT_ENGINECTL_VAR/file")
        );
    }
}
