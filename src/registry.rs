//! The set of known build engines and emulators
//!
//! [`Sdk`] is built once at startup from the persisted settings, user scope
//! first and installation provided (system) scope second, and handed to the
//! commands by reference. Mutations are written back with [`Sdk::save`].

use crate::config::DeviceModel;
use crate::emulator::Emulator;
use crate::engine::{BuildEngine, KEY_VM, parse_creation_time};
use crate::error::{Error, Result};
use crate::paths;
use crate::settings::SettingsMap;
use crate::vm::{HostCapacity, PowerControl, VirtualMachine};
use chrono::{DateTime, Utc};
use reconcile::{Identity, Scope, ScopedEntry, plan_merge};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;

const SETTINGS_VERSION: i64 = 1;

const KEY_VERSION: &str = "Version";
const KEY_INSTALL_DIR: &str = "InstallDir";
const KEY_CUSTOM_BUILD_HOST_NAME: &str = "CustomBuildHostName";
const KEY_BUILD_ENVIRONMENT_FILTER: &str = "BuildEnvironmentFilter";
const KEY_ENGINES_COUNT: &str = "BuildEnginesCount";
const KEY_ENGINE_PREFIX: &str = "BuildEngine.";
const KEY_EMULATORS_COUNT: &str = "EmulatorsCount";
const KEY_EMULATOR_PREFIX: &str = "Emulator.";

const DEFAULT_BUILD_HOST_NAME: &str = "localhost";

// ============================================================================
// Environment
// ============================================================================

/// What every resource needs from the process it lives in
pub struct Environment {
    pub handle: Handle,
    pub backend: Arc<dyn PowerControl>,
    pub host: HostCapacity,
    /// Parent of the per engine tool wrapper directories
    pub tools_root: PathBuf,
    /// Binary the tool wrappers forward to
    pub program: PathBuf,
    pub system_settings_only: bool,
    pub device_models: Vec<DeviceModel>,
    machines: Mutex<HashMap<String, Arc<VirtualMachine>>>,
}

impl Environment {
    pub fn new(
        handle: Handle,
        backend: Arc<dyn PowerControl>,
        host: HostCapacity,
        tools_root: PathBuf,
        program: PathBuf,
        system_settings_only: bool,
        device_models: Vec<DeviceModel>,
    ) -> Self {
        Self {
            handle,
            backend,
            host,
            tools_root,
            program,
            system_settings_only,
            device_models,
            machines: Mutex::new(HashMap::new()),
        }
    }

    /// The VM called `name`, shared by everything referring to it
    pub fn machine(&self, name: &str) -> Arc<VirtualMachine> {
        let mut machines = self.machines.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(machines.entry(name.to_string()).or_insert_with(|| {
            VirtualMachine::new(&self.handle, name, Arc::clone(&self.backend), self.host)
        }))
    }

    pub fn device_model(&self, name: &str) -> Option<&DeviceModel> {
        self.device_models.iter().find(|m| m.name == name)
    }
}

// ============================================================================
// Sdk
// ============================================================================

/// Settings every build engine applies to builds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildDefaults {
    /// Host name builds see; empty for the default one
    pub custom_build_host_name: String,
    /// Host environment variables forwarded into builds
    pub build_environment_filter: Vec<String>,
}

pub struct Sdk {
    env: Environment,
    user_dir: PathBuf,
    install_dir: String,
    pub build: BuildDefaults,
    engines: Vec<BuildEngine>,
    emulators: Vec<Emulator>,
}

impl std::fmt::Debug for Sdk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sdk")
            .field("user_dir", &self.user_dir)
            .field("install_dir", &self.install_dir)
            .finish_non_exhaustive()
    }
}

impl Sdk {
    /// Read settings from `user_dir` (unless system settings only) and `system_dir`
    pub fn load(env: Environment, user_dir: &Path, system_dir: &Path) -> Result<Self> {
        let mut sdk = Self {
            env,
            user_dir: user_dir.to_path_buf(),
            install_dir: String::new(),
            build: BuildDefaults::default(),
            engines: Vec::new(),
            emulators: Vec::new(),
        };

        let mut scopes = Vec::new();
        if !sdk.env.system_settings_only {
            scopes.push((user_dir, Scope::User));
        }
        scopes.push((system_dir, Scope::System));

        for (dir, scope) in scopes {
            if let Some(data) = SettingsMap::load(&dir.join(paths::ENGINES_FILE))? {
                log::debug!("Reading {scope:?} engine settings from {}", dir.display());
                sdk.apply_engines(&data, scope)?;
            }
            if let Some(data) = SettingsMap::load(&dir.join(paths::EMULATORS_FILE))? {
                log::debug!("Reading {scope:?} emulator settings from {}", dir.display());
                sdk.apply_emulators(&data, scope)?;
            }
        }

        Ok(sdk)
    }

    pub fn apply_engines(&mut self, data: &SettingsMap, scope: Scope) -> Result<()> {
        check_version(data, paths::ENGINES_FILE)?;
        let install_dir = data.str_or(KEY_INSTALL_DIR, "");
        if install_dir.is_empty() {
            return Err(Error::Corruption(format!(
                "{}: {KEY_INSTALL_DIR} is empty",
                paths::ENGINES_FILE
            )));
        }
        self.install_dir = install_dir;

        let system = scope == Scope::System;
        if !(system && !self.build.custom_build_host_name.is_empty()) {
            self.build.custom_build_host_name = data.str_or(KEY_CUSTOM_BUILD_HOST_NAME, "");
        }
        if !(system && !self.build.build_environment_filter.is_empty()) {
            self.build.build_environment_filter = data.strings(KEY_BUILD_ENVIRONMENT_FILTER);
        }

        let incoming = data.read_list(KEY_ENGINES_COUNT, KEY_ENGINE_PREFIX, Incoming::from_map)?;
        let env = &self.env;
        merge(
            &mut self.engines,
            &incoming,
            scope,
            |engine, data| engine.apply_map(data).map(drop),
            |data| BuildEngine::from_map(env, data),
        )
    }

    pub fn apply_emulators(&mut self, data: &SettingsMap, scope: Scope) -> Result<()> {
        check_version(data, paths::EMULATORS_FILE)?;
        let incoming = data.read_list(KEY_EMULATORS_COUNT, KEY_EMULATOR_PREFIX, Incoming::from_map)?;
        let env = &self.env;
        merge(
            &mut self.emulators,
            &incoming,
            scope,
            Emulator::apply_map,
            |data| Emulator::from_map(env, data),
        )
    }

    /// Write user scope settings
    pub fn save(&self) -> Result<()> {
        if self.env.system_settings_only {
            log::warn!("Not saving settings while using system settings only");
            return Ok(());
        }

        let mut engines = SettingsMap::new();
        engines.set(KEY_VERSION, SETTINGS_VERSION);
        engines.set(KEY_INSTALL_DIR, self.install_dir.as_str());
        engines.set(
            KEY_CUSTOM_BUILD_HOST_NAME,
            self.build.custom_build_host_name.as_str(),
        );
        engines.set(
            KEY_BUILD_ENVIRONMENT_FILTER,
            self.build.build_environment_filter.clone(),
        );
        let maps = self
            .engines
            .iter()
            .map(BuildEngine::to_map)
            .collect::<Result<Vec<_>>>()?;
        engines.write_list(KEY_ENGINES_COUNT, KEY_ENGINE_PREFIX, maps);
        engines.save(&self.user_dir.join(paths::ENGINES_FILE))?;

        let mut emulators = SettingsMap::new();
        emulators.set(KEY_VERSION, SETTINGS_VERSION);
        emulators.write_list(
            KEY_EMULATORS_COUNT,
            KEY_EMULATOR_PREFIX,
            self.emulators.iter().map(Emulator::to_map),
        );
        emulators.save(&self.user_dir.join(paths::EMULATORS_FILE))?;

        log::debug!("Saved settings to {}", self.user_dir.display());
        Ok(())
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn install_dir(&self) -> &str {
        &self.install_dir
    }

    /// Host name builds see
    pub fn effective_build_host_name(&self) -> String {
        if !self.build.custom_build_host_name.is_empty() {
            return self.build.custom_build_host_name.clone();
        }
        std::fs::read_to_string("/proc/sys/kernel/hostname")
            .map(|name| name.trim().to_string())
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_BUILD_HOST_NAME.to_string())
    }

    pub fn engines(&self) -> &[BuildEngine] {
        &self.engines
    }

    /// The engine called `name`, or the first one
    pub fn engine(&self, name: Option<&str>) -> Result<&BuildEngine> {
        let index = self.engine_index(name)?;
        Ok(&self.engines[index])
    }

    pub fn engine_mut(&mut self, name: Option<&str>) -> Result<&mut BuildEngine> {
        let index = self.engine_index(name)?;
        Ok(&mut self.engines[index])
    }

    /// An engine together with the build defaults, for editing both at once
    pub fn engine_and_defaults(
        &mut self,
        name: Option<&str>,
    ) -> Result<(&mut BuildEngine, &mut BuildDefaults)> {
        let index = self.engine_index(name)?;
        Ok((&mut self.engines[index], &mut self.build))
    }

    fn engine_index(&self, name: Option<&str>) -> Result<usize> {
        find(&self.engines, name, BuildEngine::name, "build engine")
    }

    pub fn emulators(&self) -> &[Emulator] {
        &self.emulators
    }

    /// The emulator called `name`, or the first one
    pub fn emulator(&self, name: Option<&str>) -> Result<&Emulator> {
        let index = find(&self.emulators, name, Emulator::name, "emulator")?;
        Ok(&self.emulators[index])
    }

    /// An emulator together with the device models it may switch to
    pub fn emulator_and_models(
        &mut self,
        name: Option<&str>,
    ) -> Result<(&mut Emulator, &[DeviceModel])> {
        let index = find(&self.emulators, name, Emulator::name, "emulator")?;
        Ok((&mut self.emulators[index], &self.env.device_models))
    }
}

fn check_version(data: &SettingsMap, file: &str) -> Result<()> {
    let version = data.i64_or(KEY_VERSION, 0);
    if version != SETTINGS_VERSION {
        return Err(Error::Corruption(format!(
            "{file}: unsupported version {version}"
        )));
    }
    Ok(())
}

fn find<E>(entries: &[E], name: Option<&str>, name_of: fn(&E) -> &str, kind: &str) -> Result<usize> {
    match name {
        Some(name) => entries
            .iter()
            .position(|e| name_of(e) == name)
            .ok_or_else(|| Error::Usage(format!("No such {kind}: \"{name}\""))),
        None if entries.is_empty() => Err(Error::Usage(format!("No {kind} configured"))),
        None => Ok(0),
    }
}

/// A persisted resource not yet turned into a live one
struct Incoming {
    name: String,
    creation_time: DateTime<Utc>,
    data: SettingsMap,
}

impl Incoming {
    fn from_map(data: SettingsMap) -> Result<Self> {
        Ok(Self {
            name: data.require_str(KEY_VM)?,
            creation_time: parse_creation_time(&data)?,
            data,
        })
    }
}

impl Identity for Incoming {
    type Key = String;
    type Stamp = DateTime<Utc>;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn stamp(&self) -> DateTime<Utc> {
        self.creation_time
    }
}

/// Apply a scoped merge plan to `existing`
fn merge<E>(
    existing: &mut Vec<E>,
    incoming: &[Incoming],
    scope: Scope,
    mut update: impl FnMut(&mut E, &SettingsMap) -> Result<()>,
    mut create: impl FnMut(&SettingsMap) -> Result<E>,
) -> Result<()>
where
    E: ScopedEntry<Key = String, Stamp = DateTime<Utc>>,
{
    let plan = plan_merge(existing, incoming, scope);

    // Indices are stable until the first drop
    for &(i, j) in &plan.update {
        update(&mut existing[i], &incoming[j].data)?;
    }
    for &i in plan.drop.iter().rev() {
        existing.remove(i);
    }
    for &j in &plan.add {
        existing.push(create(&incoming[j].data)?);
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::environment;
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn engine(name: &str, autodetected: bool) -> serde_json::Value {
        json!({
            "VirtualMachine": name,
            "CreationTime": "2024-03-01T10:00:00Z",
            "Autodetected": autodetected,
            "SshPort": 2222,
        })
    }

    fn write_engines(dir: &Path, host_name: &str, engines: &[serde_json::Value]) {
        let mut doc = json!({
            "Version": 1,
            "InstallDir": "/opt/SailfishOS",
            "CustomBuildHostName": host_name,
            "BuildEnvironmentFilter": ["LANG", "LC_*"],
            "BuildEnginesCount": engines.len(),
        });
        for (i, engine) in engines.iter().enumerate() {
            doc[format!("BuildEngine.{i}")] = engine.clone();
        }
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(paths::ENGINES_FILE), doc.to_string()).unwrap();
    }

    fn names(sdk: &Sdk) -> Vec<&str> {
        sdk.engines().iter().map(BuildEngine::name).collect()
    }

    #[test]
    fn test_autodetected_engine_survives_user_scope_gap() {
        let temp = TempDir::new().unwrap();
        let user = temp.path().join("user");
        let system = temp.path().join("system");
        write_engines(&user, "", &[engine("mine", false)]);
        write_engines(&system, "", &[engine("Sailfish OS Build Engine", true)]);

        let (_reactor, env) = environment(temp.path());
        let sdk = Sdk::load(env, &user, &system).unwrap();

        assert_eq!(names(&sdk), vec!["mine", "Sailfish OS Build Engine"]);
        assert_eq!(sdk.install_dir(), "/opt/SailfishOS");
    }

    #[test]
    fn test_user_customization_of_autodetected_engine_kept() {
        let temp = TempDir::new().unwrap();
        let user = temp.path().join("user");
        let system = temp.path().join("system");
        let mut customized = engine("Sailfish OS Build Engine", true);
        customized["SshPort"] = json!(3333);
        write_engines(&user, "", &[customized]);
        write_engines(&system, "", &[engine("Sailfish OS Build Engine", true)]);

        let (_reactor, env) = environment(temp.path());
        let sdk = Sdk::load(env, &user, &system).unwrap();

        let engine = sdk.engine(None).unwrap();
        assert_eq!(engine.ssh_parameters().port, 3333);
        assert_eq!(sdk.engines().len(), 1);
    }

    #[test]
    fn test_system_scope_keeps_user_host_name() {
        let temp = TempDir::new().unwrap();
        let user = temp.path().join("user");
        let system = temp.path().join("system");
        write_engines(&user, "builder", &[]);
        write_engines(&system, "system-host", &[]);

        let (_reactor, env) = environment(temp.path());
        let sdk = Sdk::load(env, &user, &system).unwrap();
        assert_eq!(sdk.build.custom_build_host_name, "builder");
        assert_eq!(sdk.effective_build_host_name(), "builder");
        assert_eq!(sdk.build.build_environment_filter, vec!["LANG", "LC_*"]);
    }

    #[test]
    fn test_system_settings_only_ignores_user_scope() {
        let temp = TempDir::new().unwrap();
        let user = temp.path().join("user");
        let system = temp.path().join("system");
        write_engines(&user, "", &[engine("mine", false)]);
        write_engines(&system, "", &[engine("sys", true)]);

        let (_reactor, mut env) = environment(temp.path());
        env.system_settings_only = true;
        let sdk = Sdk::load(env, &user, &system).unwrap();
        assert_eq!(names(&sdk), vec!["sys"]);
    }

    #[test]
    fn test_bad_version_is_corruption() {
        let temp = TempDir::new().unwrap();
        let user = temp.path().join("user");
        std::fs::create_dir_all(&user).unwrap();
        std::fs::write(
            user.join(paths::ENGINES_FILE),
            json!({"Version": 2, "InstallDir": "/opt"}).to_string(),
        )
        .unwrap();

        let (_reactor, env) = environment(temp.path());
        let err = Sdk::load(env, &user, &temp.path().join("none")).unwrap_err();
        assert!(err.is_fatal_to_load());
    }

    #[test]
    fn test_empty_install_dir_is_corruption() {
        let temp = TempDir::new().unwrap();
        let user = temp.path().join("user");
        std::fs::create_dir_all(&user).unwrap();
        std::fs::write(
            user.join(paths::ENGINES_FILE),
            json!({"Version": 1, "InstallDir": ""}).to_string(),
        )
        .unwrap();

        let (_reactor, env) = environment(temp.path());
        assert!(Sdk::load(env, &user, &temp.path().join("none")).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let user = temp.path().join("user");
        let system = temp.path().join("system");
        write_engines(&system, "", &[engine("Sailfish OS Build Engine", true)]);

        let (_reactor, env) = environment(temp.path());
        let mut sdk = Sdk::load(env, &user, &system).unwrap();
        sdk.build.custom_build_host_name = "builder".to_string();
        sdk.save().unwrap();

        let (_reactor, env) = environment(temp.path());
        let reloaded = Sdk::load(env, &user, &system).unwrap();
        assert_eq!(reloaded.build.custom_build_host_name, "builder");
        assert_eq!(names(&reloaded), vec!["Sailfish OS Build Engine"]);
    }

    #[test]
    fn test_lookup_by_name() {
        let temp = TempDir::new().unwrap();
        let user = temp.path().join("user");
        write_engines(&user, "", &[engine("a", false), engine("b", false)]);

        let (_reactor, env) = environment(temp.path());
        let sdk = Sdk::load(env, &user, &temp.path().join("none")).unwrap();

        assert_eq!(sdk.engine(Some("b")).unwrap().name(), "b");
        assert_eq!(sdk.engine(None).unwrap().name(), "a");
        assert!(sdk.engine(Some("c")).unwrap_err().is_usage());
        assert!(sdk.emulator(None).unwrap_err().is_usage());
    }

    #[test]
    fn test_same_vm_shared() {
        let temp = TempDir::new().unwrap();
        let (_reactor, env) = environment(temp.path());
        assert!(Arc::ptr_eq(&env.machine("a"), &env.machine("a")));
        assert!(!Arc::ptr_eq(&env.machine("a"), &env.machine("b")));
    }
}
