//! Build engine properties

use super::grammar;
use super::{PropertiesAccessor, Prepare, Property, Table, always};
use crate::engine::BuildEngine;
use crate::registry::BuildDefaults;
use opflow::Reactor;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub const HOST_NAME: &str = "host-name";
pub const ENVIRONMENT_FORWARD: &str = "environment.forward";
pub const SSH_PORT: &str = "ssh.port";
pub const SSH_TIMEOUT: &str = "ssh.timeout";
pub const DBUS_PORT: &str = "dbus.port";

pub struct EngineStaged {
    host_name: String,
    host_name_changed: bool,
    environment_filter: Vec<String>,
    ssh_port: u16,
    ssh_timeout_secs: i64,
    dbus_port: u16,
}

fn host_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?)*$")
            .expect("valid regex")
    })
}

fn show_host_name(s: &EngineStaged) -> String {
    s.host_name.clone()
}

fn show_environment_forward(s: &EngineStaged) -> String {
    s.environment_filter.join(" ")
}

fn show_ssh_port(s: &EngineStaged) -> String {
    s.ssh_port.to_string()
}

fn show_ssh_timeout(s: &EngineStaged) -> String {
    s.ssh_timeout_secs.to_string()
}

fn show_dbus_port(s: &EngineStaged) -> String {
    s.dbus_port.to_string()
}

fn prepare_host_name(s: &mut EngineStaged, value: &str) -> Result<bool, String> {
    if !value.is_empty() && !host_name_pattern().is_match(value) {
        return Err(format!("Not a well formed host name: \"{value}\""));
    }
    s.host_name = value.to_string();
    s.host_name_changed = true;
    Ok(false)
}

fn prepare_environment_forward(s: &mut EngineStaged, value: &str) -> Result<bool, String> {
    s.environment_filter = value.split_whitespace().map(str::to_string).collect();
    Ok(false)
}

fn prepare_ssh_port(s: &mut EngineStaged, value: &str) -> Result<bool, String> {
    s.ssh_port = grammar::parse_port(value)?;
    Ok(true)
}

fn prepare_ssh_timeout(s: &mut EngineStaged, value: &str) -> Result<bool, String> {
    s.ssh_timeout_secs = grammar::parse_positive_int(value)?;
    Ok(false)
}

fn prepare_dbus_port(s: &mut EngineStaged, value: &str) -> Result<bool, String> {
    s.dbus_port = grammar::parse_port(value)?;
    Ok(true)
}

static PROPERTIES: Table<EngineStaged> = Table::new(&[
    Property {
        name: HOST_NAME,
        available: always,
        show: Some(show_host_name),
        prepare: prepare_host_name,
    },
    Property {
        name: ENVIRONMENT_FORWARD,
        available: always,
        show: Some(show_environment_forward),
        prepare: prepare_environment_forward,
    },
    Property {
        name: SSH_PORT,
        available: always,
        show: Some(show_ssh_port),
        prepare: prepare_ssh_port,
    },
    Property {
        name: SSH_TIMEOUT,
        available: always,
        show: Some(show_ssh_timeout),
        prepare: prepare_ssh_timeout,
    },
    Property {
        name: DBUS_PORT,
        available: always,
        show: Some(show_dbus_port),
        prepare: prepare_dbus_port,
    },
]);

/// Accessor for the engine specific properties
///
/// The host name and the environment filter are shared by all engines, so
/// they are written to `defaults`.
pub struct EngineProperties<'a> {
    reactor: &'a Reactor,
    engine: &'a mut BuildEngine,
    defaults: &'a mut BuildDefaults,
    staged: EngineStaged,
}

impl<'a> EngineProperties<'a> {
    /// `host_name` is the host name builds currently see
    pub fn new(
        reactor: &'a Reactor,
        engine: &'a mut BuildEngine,
        defaults: &'a mut BuildDefaults,
        host_name: String,
    ) -> Self {
        let staged = EngineStaged {
            host_name,
            host_name_changed: false,
            environment_filter: defaults.build_environment_filter.clone(),
            ssh_port: engine.ssh_parameters().port,
            ssh_timeout_secs: engine.ssh_parameters().timeout_secs,
            dbus_port: engine.dbus_port(),
        };
        Self {
            reactor,
            engine,
            defaults,
            staged,
        }
    }
}

impl PropertiesAccessor for EngineProperties<'_> {
    fn get(&self) -> BTreeMap<String, String> {
        PROPERTIES.get(&self.staged)
    }

    fn prepare_set(&mut self, name: &str, value: &str) -> Prepare {
        PROPERTIES.prepare(&mut self.staged, name, value)
    }

    fn set(&mut self) -> bool {
        let staged = &self.staged;
        let mut ok = true;

        if staged.host_name_changed {
            self.defaults.custom_build_host_name = staged.host_name.clone();
        }
        self.defaults.build_environment_filter = staged.environment_filter.clone();

        if staged.ssh_port != self.engine.ssh_parameters().port {
            ok &= self.engine.set_ssh_port(self.reactor, staged.ssh_port);
        }

        if staged.ssh_timeout_secs != self.engine.ssh_parameters().timeout_secs {
            self.engine.set_ssh_timeout(staged.ssh_timeout_secs);
        }

        if staged.dbus_port != self.engine.dbus_port() {
            ok &= self.engine.set_dbus_port(self.reactor, staged.dbus_port);
        }

        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::vm::{CPU_COUNT, VmProperties};
    use crate::property::{Delegating, PropertyBatch};
    use crate::registry::testing::{build_engine, fake_environment};
    use crate::vm as machine;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn defaults() -> BuildDefaults {
        BuildDefaults {
            custom_build_host_name: String::new(),
            build_environment_filter: vec!["LANG".to_string()],
        }
    }

    #[test]
    fn test_privileged_port_rejected() {
        let temp = TempDir::new().unwrap();
        let (reactor, env, backend) = fake_environment(temp.path());
        let mut engine = build_engine(&env, temp.path());
        let mut defaults = defaults();
        let vm = Arc::clone(engine.virtual_machine());
        let props = EngineProperties::new(&reactor, &mut engine, &mut defaults, "host".into());
        let mut batch = PropertyBatch::new(&reactor, vm, Box::new(props), "Stop it first");

        let err = batch.prepare_set(SSH_PORT, "80").unwrap_err();
        assert_eq!(err.to_string(), "ssh.port: Privileged ports may not be used");
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_host_name_validation() {
        let temp = TempDir::new().unwrap();
        let (reactor, env) = crate::registry::testing::environment(temp.path());
        let mut engine = build_engine(&env, temp.path());
        let mut defaults = defaults();
        let mut props = EngineProperties::new(&reactor, &mut engine, &mut defaults, "host".into());

        assert_eq!(
            props.prepare_set(HOST_NAME, "bad host"),
            Prepare::Failed("Not a well formed host name: \"bad host\"".to_string())
        );
        assert_eq!(
            props.prepare_set(HOST_NAME, "build.example.com"),
            Prepare::Prepared {
                needs_vm_off: false
            }
        );
        // Empty restores the default host name
        assert_eq!(
            props.prepare_set(HOST_NAME, ""),
            Prepare::Prepared {
                needs_vm_off: false
            }
        );
    }

    #[test]
    fn test_defaults_updated_without_touching_vm() {
        let temp = TempDir::new().unwrap();
        let (reactor, env, backend) = fake_environment(temp.path());
        let mut engine = build_engine(&env, temp.path());
        let mut defaults = defaults();
        {
            let mut props =
                EngineProperties::new(&reactor, &mut engine, &mut defaults, "host".into());
            props.prepare_set(HOST_NAME, "builder");
            props.prepare_set(ENVIRONMENT_FORWARD, "  LANG   LC_ALL ");
            props.prepare_set(SSH_TIMEOUT, "60");
            assert!(props.set());
        }

        assert_eq!(defaults.custom_build_host_name, "builder");
        assert_eq!(defaults.build_environment_filter, vec!["LANG", "LC_ALL"]);
        assert_eq!(engine.ssh_parameters().timeout_secs, 60);
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_ports_need_vm_off() {
        let temp = TempDir::new().unwrap();
        let (reactor, env, backend) = fake_environment(temp.path());
        let mut engine = build_engine(&env, temp.path());
        let mut defaults = defaults();
        let vm = Arc::clone(engine.virtual_machine());
        assert!(machine::block(&reactor, |done| vm.refresh_info(done)));

        let specific = EngineProperties::new(&reactor, &mut engine, &mut defaults, "host".into());
        let shared = VmProperties::new(&reactor, Arc::clone(&vm));
        let accessor = Delegating::new(Box::new(specific), Box::new(shared));
        let mut batch = PropertyBatch::new(&reactor, vm, Box::new(accessor), "Stop it first");

        batch.prepare_set(SSH_PORT, "2223").unwrap();
        batch.prepare_set(CPU_COUNT, "4").unwrap();
        batch.prepare_set(DBUS_PORT, "7777").unwrap();
        assert!(batch.needs_vm_off());
        batch.set().unwrap();
        drop(batch);

        // Unchanged D-Bus port is not reapplied
        assert_eq!(backend.calls(), vec!["cpus 4", "guestssh 2223"]);
        assert_eq!(engine.ssh_parameters().port, 2223);
    }

    #[test]
    fn test_listing_includes_vm_properties() {
        let temp = TempDir::new().unwrap();
        let (reactor, env) = crate::registry::testing::environment(temp.path());
        let mut engine = build_engine(&env, temp.path());
        let mut defaults = defaults();
        let vm = Arc::clone(engine.virtual_machine());

        let specific = EngineProperties::new(&reactor, &mut engine, &mut defaults, "host".into());
        let shared = VmProperties::new(&reactor, vm);
        let values = Delegating::new(Box::new(specific), Box::new(shared)).get();

        let names: Vec<&str> = values.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec![
                "dbus.port",
                "environment.forward",
                "host-name",
                "ssh.port",
                "ssh.timeout",
                "vm.cpu-count",
                "vm.memory-size",
                "vm.storage-size",
                "vm.swap-size",
            ]
        );
        assert_eq!(values[HOST_NAME], "host");
        assert_eq!(values[SSH_PORT], "2222");
    }
}
