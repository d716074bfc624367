//! Emulator properties
//!
//! Everything here reconfigures the emulator VM, so every property needs it
//! powered off.

use super::grammar::{self, BOOLEAN};
use super::{PropertiesAccessor, Prepare, Property, Table, always};
use crate::config::DeviceModel;
use crate::emulator::{Emulator, ORIENTATIONS, Orientation};
use opflow::Reactor;
use std::collections::BTreeMap;

pub const DEVICE_MODEL: &str = "device-model";
pub const ORIENTATION: &str = "orientation";
pub const DOWNSCALE: &str = "downscale";
pub const SSH_PORT: &str = "ssh.port";
pub const SSH_TIMEOUT: &str = "ssh.timeout";

pub struct EmulatorStaged {
    models: Vec<DeviceModel>,
    device_model: String,
    orientation: Orientation,
    downscale: bool,
    ssh_port: u16,
    ssh_timeout_secs: i64,
}

fn prepare_device_model(s: &mut EmulatorStaged, value: &str) -> Result<bool, String> {
    if value.is_empty() {
        return Err(grammar::VALUE_EMPTY.to_string());
    }
    if !s.models.iter().any(|m| m.name == value) {
        return Err(format!("No such device model: \"{value}\""));
    }
    s.device_model = value.to_string();
    Ok(true)
}

fn prepare_orientation(s: &mut EmulatorStaged, value: &str) -> Result<bool, String> {
    s.orientation = ORIENTATIONS.parse(value)?;
    Ok(true)
}

fn prepare_downscale(s: &mut EmulatorStaged, value: &str) -> Result<bool, String> {
    s.downscale = BOOLEAN.parse(value)?;
    Ok(true)
}

fn prepare_ssh_port(s: &mut EmulatorStaged, value: &str) -> Result<bool, String> {
    s.ssh_port = grammar::parse_port(value)?;
    Ok(true)
}

fn prepare_ssh_timeout(s: &mut EmulatorStaged, value: &str) -> Result<bool, String> {
    s.ssh_timeout_secs = grammar::parse_positive_int(value)?;
    Ok(true)
}

fn show_device_model(s: &EmulatorStaged) -> String {
    s.device_model.clone()
}

fn show_orientation(s: &EmulatorStaged) -> String {
    ORIENTATIONS.show(s.orientation).to_string()
}

fn show_downscale(s: &EmulatorStaged) -> String {
    BOOLEAN.show(s.downscale).to_string()
}

fn show_ssh_port(s: &EmulatorStaged) -> String {
    s.ssh_port.to_string()
}

fn show_ssh_timeout(s: &EmulatorStaged) -> String {
    s.ssh_timeout_secs.to_string()
}

static PROPERTIES: Table<EmulatorStaged> = Table::new(&[
    Property {
        name: DEVICE_MODEL,
        available: always,
        show: Some(show_device_model),
        prepare: prepare_device_model,
    },
    Property {
        name: ORIENTATION,
        available: always,
        show: Some(show_orientation),
        prepare: prepare_orientation,
    },
    Property {
        name: DOWNSCALE,
        available: always,
        show: Some(show_downscale),
        prepare: prepare_downscale,
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
]);

/// Accessor for the emulator specific properties
pub struct EmulatorProperties<'a> {
    reactor: &'a Reactor,
    emulator: &'a mut Emulator,
    staged: EmulatorStaged,
}

impl<'a> EmulatorProperties<'a> {
    /// `models` are the device models the emulator may switch to
    pub fn new(reactor: &'a Reactor, emulator: &'a mut Emulator, models: &[DeviceModel]) -> Self {
        let staged = EmulatorStaged {
            models: models.to_vec(),
            device_model: emulator.device_model().to_string(),
            orientation: emulator.orientation(),
            downscale: emulator.is_view_scaled(),
            ssh_port: emulator.ssh_port(),
            ssh_timeout_secs: emulator.ssh_timeout_secs(),
        };
        Self {
            reactor,
            emulator,
            staged,
        }
    }

    fn display_changed(&self) -> bool {
        self.staged.device_model != self.emulator.device_model()
            || self.staged.orientation != self.emulator.orientation()
            || self.staged.downscale != self.emulator.is_view_scaled()
    }
}

impl PropertiesAccessor for EmulatorProperties<'_> {
    fn get(&self) -> BTreeMap<String, String> {
        PROPERTIES.get(&self.staged)
    }

    fn prepare_set(&mut self, name: &str, value: &str) -> Prepare {
        PROPERTIES.prepare(&mut self.staged, name, value)
    }

    fn set(&mut self) -> bool {
        let mut ok = true;

        if self.display_changed() {
            let staged = &self.staged;
            match staged.models.iter().find(|m| m.name == staged.device_model) {
                Some(model) => {
                    ok &= self.emulator.set_display_properties(
                        self.reactor,
                        model,
                        staged.orientation,
                        staged.downscale,
                    );
                }
                None => {
                    log::error!("Unknown device model \"{}\"", staged.device_model);
                    ok = false;
                }
            }
        }

        if self.staged.ssh_port != self.emulator.ssh_port() {
            ok &= self.emulator.set_ssh_port(self.reactor, self.staged.ssh_port);
        }

        if self.staged.ssh_timeout_secs != self.emulator.ssh_timeout_secs() {
            self.emulator.set_ssh_timeout(self.staged.ssh_timeout_secs);
        }

        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyBatch;
    use crate::registry::testing::{emulator, fake_environment};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_unknown_device_model() {
        let temp = TempDir::new().unwrap();
        let (reactor, env, _backend) = fake_environment(temp.path());
        let mut emulator = emulator(&env);
        let mut props = EmulatorProperties::new(&reactor, &mut emulator, &env.device_models);

        assert_eq!(
            props.prepare_set(DEVICE_MODEL, "Phone 9000"),
            Prepare::Failed("No such device model: \"Phone 9000\"".to_string())
        );
        assert_eq!(
            props.prepare_set(DEVICE_MODEL, ""),
            Prepare::Failed(grammar::VALUE_EMPTY.to_string())
        );
    }

    #[test]
    fn test_everything_needs_vm_off() {
        let temp = TempDir::new().unwrap();
        let (reactor, env, _backend) = fake_environment(temp.path());
        let mut emulator = emulator(&env);
        let mut props = EmulatorProperties::new(&reactor, &mut emulator, &env.device_models);

        for (name, value) in [(ORIENTATION, "landscape"), (DOWNSCALE, "yes"), (SSH_TIMEOUT, "5")] {
            assert_eq!(
                props.prepare_set(name, value),
                Prepare::Prepared { needs_vm_off: true },
                "{name}"
            );
        }
        assert!(matches!(props.prepare_set(DOWNSCALE, "maybe"), Prepare::Failed(_)));
    }

    #[test]
    fn test_display_change_applied_once() {
        let temp = TempDir::new().unwrap();
        let (reactor, env, backend) = fake_environment(temp.path());
        let mut emulator = emulator(&env);
        let vm = Arc::clone(emulator.virtual_machine());
        let props = EmulatorProperties::new(&reactor, &mut emulator, &env.device_models);
        let mut batch = PropertyBatch::new(&reactor, vm, Box::new(props), "Stop the emulator");

        batch.prepare_set(ORIENTATION, "landscape").unwrap();
        batch.prepare_set(DOWNSCALE, "yes").unwrap();
        batch.prepare_set(SSH_PORT, "2223").unwrap();
        batch.set().unwrap();
        drop(batch);

        // The SSH port did not change
        assert_eq!(backend.calls(), vec!["video 854x480 landscape 2"]);
        assert_eq!(emulator.orientation(), Orientation::Landscape);
    }

    #[test]
    fn test_listing() {
        let temp = TempDir::new().unwrap();
        let (reactor, env, _backend) = fake_environment(temp.path());
        let mut emulator = emulator(&env);
        let props = EmulatorProperties::new(&reactor, &mut emulator, &env.device_models);

        let values = props.get();
        assert_eq!(values[DEVICE_MODEL], "Sailfish OS Emulator");
        assert_eq!(values[ORIENTATION], "portrait");
        assert_eq!(values[DOWNSCALE], "no");
        assert_eq!(values[SSH_PORT], "2223");
    }
}
