//! Build engines
//!
//! A build engine is a VM hosting cross-compilation targets. The host shares
//! a few directories with it (install, home, targets, config, source, ssh),
//! reaches it over ssh and keeps a cached copy of the targets it provides,
//! together with tool wrappers for each of them.

pub mod target;
pub mod wrappers;

use crate::error::{Error, Result};
use crate::property::grammar::Dictionary;
use crate::registry::Environment;
use crate::settings::SettingsMap;
use crate::transport::SshExec;
use crate::vm::{self as machine, Features, ReservedPort, VirtualMachine};
use chrono::{DateTime, Utc};
use opflow::Reactor;
use reconcile::{
    EntryHooks, Identity, ReconcileObserver, ReconcileSummary, ScopedEntry, Tracked,
    reconcile_in_place,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use target::{BuildTargetData, BuildTargetDump, TargetLayout};

// Settings keys
pub const KEY_VM: &str = "VirtualMachine";
pub const KEY_CREATION_TIME: &str = "CreationTime";
pub const KEY_AUTODETECTED: &str = "Autodetected";
const KEY_SHARED_INSTALL: &str = "SharedInstall";
const KEY_SHARED_HOME: &str = "SharedHome";
const KEY_SHARED_TARGETS: &str = "SharedTargets";
const KEY_SHARED_CONFIG: &str = "SharedConfig";
const KEY_SHARED_SRC: &str = "SharedSrc";
const KEY_SHARED_SSH: &str = "SharedSsh";
const KEY_HOST: &str = "Host";
const KEY_USER_NAME: &str = "UserName";
const KEY_PRIVATE_KEY_FILE: &str = "PrivateKeyFile";
const KEY_SSH_PORT: &str = "SshPort";
const KEY_SSH_TIMEOUT: &str = "SshTimeout";
const KEY_WWW_PROXY_TYPE: &str = "WwwProxyType";
const KEY_WWW_PROXY_SERVERS: &str = "WwwProxyServers";
const KEY_WWW_PROXY_EXCLUDES: &str = "WwwProxyExcludes";
const KEY_DBUS_PORT: &str = "DBusPort";
const KEY_HEADLESS: &str = "Headless";
const KEY_TARGETS_COUNT: &str = "BuildTargetsCount";
const KEY_TARGET_PREFIX: &str = "BuildTarget.";

pub const DEFAULT_SSH_TIMEOUT_SECS: i64 = 30;
pub const PROXY_CONFIG_FILE: &str = "proxy.json";

// ============================================================================
// Proxy
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProxyType {
    #[default]
    Disabled,
    Automatic,
    Manual,
}

pub const PROXY_TYPES: Dictionary<ProxyType> = Dictionary::new(&[
    (ProxyType::Disabled, "disabled"),
    (ProxyType::Automatic, "auto"),
    (ProxyType::Manual, "manual"),
]);

/// Web proxy the engine should use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WwwProxy {
    pub kind: ProxyType,
    /// Space separated URLs
    pub servers: String,
    /// Space separated URLs
    pub excludes: String,
}

impl WwwProxy {
    /// Content of the proxy configuration file read by the engine
    pub fn to_config(&self) -> serde_json::Value {
        let servers: Vec<&str> = self.servers.split_whitespace().collect();
        let excludes: Vec<&str> = self.excludes.split_whitespace().collect();

        let mut config = json!({ "Method": PROXY_TYPES.show(self.kind) });
        match self.kind {
            ProxyType::Automatic => {
                if let Some(first) = servers.first() {
                    if servers.len() > 1 {
                        log::debug!(
                            "Multiple proxy servers specified. Using just the first one for auto configuration"
                        );
                    }
                    config["URL"] = json!(first);
                }
            }
            ProxyType::Manual => {
                if !servers.is_empty() {
                    config["Servers"] = json!(servers);
                }
                if !excludes.is_empty() {
                    config["Excludes"] = json!(excludes);
                }
            }
            ProxyType::Disabled => {}
        }
        config
    }
}

// ============================================================================
// Build engine
// ============================================================================

/// Host directories shared with the engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedPaths {
    pub install: PathBuf,
    pub home: PathBuf,
    pub targets: PathBuf,
    pub config: PathBuf,
    pub src: PathBuf,
    pub ssh: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshParameters {
    pub host: String,
    pub user: String,
    pub private_key: PathBuf,
    pub port: u16,
    pub timeout_secs: i64,
}

pub struct BuildEngine {
    vm: Arc<VirtualMachine>,
    creation_time: DateTime<Utc>,
    autodetected: bool,
    shared: SharedPaths,
    ssh: SshParameters,
    proxy: WwwProxy,
    dbus_port: u16,
    targets: Vec<Tracked<BuildTargetDump, BuildTargetData>>,
    tools_root: PathBuf,
    program: PathBuf,
    manage_wrappers: bool,
}

impl BuildEngine {
    /// Create an engine from its settings
    pub fn from_map(env: &Environment, data: &SettingsMap) -> Result<Self> {
        let name = data.require_str(KEY_VM)?;
        let mut engine = Self {
            vm: env.machine(&name),
            creation_time: parse_creation_time(data)?,
            autodetected: false,
            shared: SharedPaths::default(),
            ssh: SshParameters {
                host: String::new(),
                user: String::new(),
                private_key: PathBuf::new(),
                port: 0,
                timeout_secs: DEFAULT_SSH_TIMEOUT_SECS,
            },
            proxy: WwwProxy::default(),
            dbus_port: 0,
            targets: Vec::new(),
            tools_root: env.tools_root.clone(),
            program: env.program.clone(),
            manage_wrappers: !env.system_settings_only,
        };
        engine.apply_map(data)?;
        Ok(engine)
    }

    /// Update from settings describing the same engine
    pub fn apply_map(&mut self, data: &SettingsMap) -> Result<ReconcileSummary> {
        let name = data.require_str(KEY_VM)?;
        if name != self.name() {
            return Err(Error::Corruption(format!(
                "settings of \"{name}\" applied to \"{}\"",
                self.name()
            )));
        }

        self.creation_time = parse_creation_time(data)?;
        self.autodetected = data.bool_or(KEY_AUTODETECTED, false);

        let path = |key| PathBuf::from(data.str_or(key, ""));
        self.shared = SharedPaths {
            install: path(KEY_SHARED_INSTALL),
            home: path(KEY_SHARED_HOME),
            targets: path(KEY_SHARED_TARGETS),
            config: path(KEY_SHARED_CONFIG),
            src: path(KEY_SHARED_SRC),
            ssh: path(KEY_SHARED_SSH),
        };

        let timeout = data.i64_or(KEY_SSH_TIMEOUT, 0);
        self.ssh = SshParameters {
            host: data.str_or(KEY_HOST, ""),
            user: data.str_or(KEY_USER_NAME, ""),
            private_key: path(KEY_PRIVATE_KEY_FILE),
            port: port_or_zero(data, KEY_SSH_PORT),
            timeout_secs: if timeout == 0 {
                DEFAULT_SSH_TIMEOUT_SECS
            } else {
                timeout
            },
        };
        self.dbus_port = port_or_zero(data, KEY_DBUS_PORT);

        let kind = data.str_or(KEY_WWW_PROXY_TYPE, PROXY_TYPES.show(ProxyType::Disabled));
        self.proxy = WwwProxy {
            kind: PROXY_TYPES
                .parse(&kind)
                .map_err(|e| Error::Corruption(format!("{KEY_WWW_PROXY_TYPE}: {e}")))?,
            servers: data.str_or(KEY_WWW_PROXY_SERVERS, ""),
            excludes: data.str_or(KEY_WWW_PROXY_EXCLUDES, ""),
        };

        if self.vm.features().contains(Features::OPTIONAL_HEADLESS) {
            self.vm.set_headless(data.bool_or(KEY_HEADLESS, false));
        }

        let targets = data.read_list(KEY_TARGETS_COUNT, KEY_TARGET_PREFIX, BuildTargetDump::from_map)?;
        Ok(self.update_build_targets(targets, &mut reconcile::NoObserver))
    }

    pub fn to_map(&self) -> Result<SettingsMap> {
        let mut data = SettingsMap::new();
        data.set(KEY_VM, self.name());
        data.set(KEY_CREATION_TIME, self.creation_time.to_rfc3339());
        data.set(KEY_AUTODETECTED, self.autodetected);

        let path = |p: &Path| p.display().to_string();
        data.set(KEY_SHARED_INSTALL, path(&self.shared.install));
        data.set(KEY_SHARED_HOME, path(&self.shared.home));
        data.set(KEY_SHARED_TARGETS, path(&self.shared.targets));
        data.set(KEY_SHARED_CONFIG, path(&self.shared.config));
        data.set(KEY_SHARED_SRC, path(&self.shared.src));
        data.set(KEY_SHARED_SSH, path(&self.shared.ssh));

        data.set(KEY_HOST, self.ssh.host.as_str());
        data.set(KEY_USER_NAME, self.ssh.user.as_str());
        data.set(KEY_PRIVATE_KEY_FILE, path(&self.ssh.private_key));
        data.set(KEY_SSH_PORT, self.ssh.port);
        data.set(KEY_SSH_TIMEOUT, self.ssh.timeout_secs);

        data.set(KEY_WWW_PROXY_TYPE, PROXY_TYPES.show(self.proxy.kind));
        data.set(KEY_WWW_PROXY_SERVERS, self.proxy.servers.as_str());
        data.set(KEY_WWW_PROXY_EXCLUDES, self.proxy.excludes.as_str());

        data.set(KEY_DBUS_PORT, self.dbus_port);
        data.set(KEY_HEADLESS, self.vm.is_headless());

        let targets = self
            .targets
            .iter()
            .map(|t| t.raw.to_map())
            .collect::<Result<Vec<_>>>()?;
        data.write_list(KEY_TARGETS_COUNT, KEY_TARGET_PREFIX, targets);
        Ok(data)
    }

    pub fn name(&self) -> &str {
        self.vm.name()
    }

    pub fn virtual_machine(&self) -> &Arc<VirtualMachine> {
        &self.vm
    }

    pub fn is_autodetected(&self) -> bool {
        self.autodetected
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    pub fn shared_paths(&self) -> &SharedPaths {
        &self.shared
    }

    pub fn ssh_parameters(&self) -> &SshParameters {
        &self.ssh
    }

    pub fn dbus_port(&self) -> u16 {
        self.dbus_port
    }

    pub fn www_proxy(&self) -> &WwwProxy {
        &self.proxy
    }

    /// Change the proxy and tell the engine about it
    pub fn set_www_proxy(&mut self, proxy: WwwProxy) -> Result<()> {
        if proxy == self.proxy {
            return Ok(());
        }
        self.proxy = proxy;
        self.sync_www_proxy()
    }

    /// Write the proxy configuration into the shared config directory
    pub fn sync_www_proxy(&self) -> Result<()> {
        std::fs::create_dir_all(&self.shared.config)?;
        let content = serde_json::to_string_pretty(&self.proxy.to_config())?;
        std::fs::write(self.shared.config.join(PROXY_CONFIG_FILE), content + "\n")?;
        Ok(())
    }

    /// Forward `port` on the host to the engine's ssh port
    ///
    /// The VM must be locked down.
    pub fn set_ssh_port(&mut self, reactor: &Reactor, port: u16) -> bool {
        let ok = machine::block(reactor, |done| {
            self.vm.set_reserved_port(ReservedPort::Ssh, port, done)
        });
        if ok {
            self.ssh.port = port;
        }
        ok
    }

    /// Forward `port` on the host to the engine's D-Bus port
    ///
    /// The VM must be locked down.
    pub fn set_dbus_port(&mut self, reactor: &Reactor, port: u16) -> bool {
        let ok = machine::block(reactor, |done| {
            self.vm.set_reserved_port(ReservedPort::DBus, port, done)
        });
        if ok {
            self.dbus_port = port;
        }
        ok
    }

    pub fn set_ssh_timeout(&mut self, timeout_secs: i64) {
        self.ssh.timeout_secs = timeout_secs;
    }

    /// Transport running commands inside the engine
    pub fn remote(&self) -> SshExec {
        SshExec {
            host: self.ssh.host.clone(),
            user: self.ssh.user.clone(),
            port: self.ssh.port,
            private_key: (!self.ssh.private_key.as_os_str().is_empty())
                .then(|| self.ssh.private_key.clone()),
            timeout_secs: u32::try_from(self.ssh.timeout_secs).unwrap_or(u32::MAX),
        }
    }

    // ------------------------------------------------------------------------
    // Build targets
    // ------------------------------------------------------------------------

    fn layout(&self) -> TargetLayout {
        TargetLayout::new(&self.shared.targets, &self.tools_root, self.name())
    }

    pub fn build_targets(&self) -> impl Iterator<Item = &BuildTargetData> {
        self.targets.iter().map(|t| &t.derived)
    }

    pub fn build_target(&self, name: &str) -> Option<&BuildTargetData> {
        self.build_targets().find(|t| t.name == name)
    }

    /// Snapshot of `origin`, the default one unless `suffix` is given
    pub fn build_target_by_origin(&self, origin: &str, suffix: Option<&str>) -> Option<&BuildTargetData> {
        self.build_targets().find(|t| {
            t.is_snapshot()
                && t.origin == origin
                && match suffix {
                    Some(suffix) => t.snapshot_suffix() == suffix,
                    None => t.flags.contains(target::TargetFlags::DEFAULT_SNAPSHOT),
                }
        })
    }

    /// Reconcile the cached targets with `fresh` ones
    pub fn update_build_targets(
        &mut self,
        fresh: Vec<BuildTargetDump>,
        observer: &mut dyn ReconcileObserver,
    ) -> ReconcileSummary {
        let layout = self.layout();
        let names: Vec<String> = self.targets.iter().map(|t| t.raw.name.clone()).collect();
        let mut hooks = WrapperHooks {
            program: &self.program,
            enabled: self.manage_wrappers,
        };
        let mut narrator = Narrator {
            names,
            added: Vec::new(),
            inner: observer,
        };

        let summary = reconcile_in_place(
            &mut self.targets,
            target::sanitize(fresh),
            |dump| layout.derive(dump),
            &mut hooks,
            &mut narrator,
        );

        for index in narrator.added {
            log::debug!("Adding build target {}", self.targets[index].raw.name);
        }
        summary
    }

    /// Re-read the targets document from the shared targets directory
    ///
    /// Returns `None` and leaves the cache untouched if it cannot be read.
    pub fn refresh_build_targets(
        &mut self,
        observer: &mut dyn ReconcileObserver,
    ) -> Option<ReconcileSummary> {
        let path = self.shared.targets.join(target::TARGETS_DOCUMENT);
        log::debug!(
            "Updating build targets for {} from {}",
            self.name(),
            path.display()
        );
        let fresh = target::read_targets_document(&path)?;
        Some(self.update_build_targets(fresh, observer))
    }
}

impl std::fmt::Debug for BuildEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildEngine")
            .field("name", &self.name())
            .field("autodetected", &self.autodetected)
            .field("targets", &self.targets.len())
            .finish_non_exhaustive()
    }
}

impl Identity for BuildEngine {
    type Key = String;
    type Stamp = DateTime<Utc>;

    fn key(&self) -> String {
        self.name().to_string()
    }

    fn stamp(&self) -> DateTime<Utc> {
        self.creation_time
    }
}

impl ScopedEntry for BuildEngine {
    fn is_autodetected(&self) -> bool {
        self.autodetected
    }
}

pub fn parse_creation_time(data: &SettingsMap) -> Result<DateTime<Utc>> {
    let value = data.require_str(KEY_CREATION_TIME)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Corruption(format!("{KEY_CREATION_TIME}: {e}")))
}

fn port_or_zero(data: &SettingsMap, key: &str) -> u16 {
    u16::try_from(data.i64_or(key, 0)).unwrap_or(0)
}

/// Creates and removes tool wrappers as targets come and go
struct WrapperHooks<'a> {
    program: &'a Path,
    enabled: bool,
}

impl EntryHooks<BuildTargetDump, BuildTargetData> for WrapperHooks<'_> {
    fn init(&mut self, _index: usize, entry: &Tracked<BuildTargetDump, BuildTargetData>) {
        if !self.enabled {
            return;
        }
        let data = &entry.derived;
        if let Err(e) = wrappers::init(&data.tools_path, &data.sysroot, &entry.raw, self.program) {
            log::error!("Failed to set up tools of {}: {e:#}", data.name);
        }
    }

    fn deinit(&mut self, _index: usize, entry: &Tracked<BuildTargetDump, BuildTargetData>) {
        if !self.enabled {
            return;
        }
        if let Err(e) = wrappers::deinit(&entry.derived.tools_path) {
            log::error!("Failed to remove tools of {}: {e:#}", entry.derived.name);
        }
    }
}

/// Logs reconciliation decisions before passing them on
struct Narrator<'a> {
    /// Target names before reconciliation
    names: Vec<String>,
    added: Vec<usize>,
    inner: &'a mut dyn ReconcileObserver,
}

impl ReconcileObserver for Narrator<'_> {
    fn on_added(&mut self, index: usize) {
        self.added.push(index);
        self.inner.on_added(index);
    }

    fn on_updated(&mut self, index: usize) {
        log::debug!("Updating build target {}", self.names[index]);
        self.inner.on_updated(index);
    }

    fn on_about_to_remove(&mut self, index: usize) {
        log::debug!("Removing build target {}", self.names[index]);
        self.inner.on_about_to_remove(index);
    }
}
