//! Emulators
//!
//! An emulator is a VM presenting a device display. Besides the generic VM
//! configuration it remembers which device model it emulates, how the display
//! is oriented and whether the view is scaled down on the host.

use crate::config::DeviceModel;
use crate::engine::{DEFAULT_SSH_TIMEOUT_SECS, KEY_AUTODETECTED, KEY_CREATION_TIME, KEY_VM, parse_creation_time};
use crate::error::{Error, Result};
use crate::property::grammar::Dictionary;
use crate::registry::Environment;
use crate::settings::SettingsMap;
use crate::vm::{self as machine, ReservedPort, VideoMode, VirtualMachine};
use chrono::{DateTime, Utc};
use opflow::Reactor;
use reconcile::{Identity, ScopedEntry};
use std::sync::Arc;

const KEY_DEVICE_MODEL: &str = "DeviceModel";
const KEY_ORIENTATION: &str = "Orientation";
const KEY_VIEW_SCALED: &str = "ViewScaled";
const KEY_SSH_PORT: &str = "SshPort";
const KEY_SSH_TIMEOUT: &str = "SshTimeout";

/// Scale down factor of a scaled view
const VIEW_SCALE_DOWN_FACTOR: u32 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Orientation {
    #[default]
    Portrait,
    Landscape,
}

pub const ORIENTATIONS: Dictionary<Orientation> = Dictionary::new(&[
    (Orientation::Portrait, "portrait"),
    (Orientation::Landscape, "landscape"),
]);

pub struct Emulator {
    vm: Arc<VirtualMachine>,
    creation_time: DateTime<Utc>,
    autodetected: bool,
    device_model: String,
    orientation: Orientation,
    view_scaled: bool,
    ssh_port: u16,
    ssh_timeout_secs: i64,
}

impl Emulator {
    pub fn from_map(env: &Environment, data: &SettingsMap) -> Result<Self> {
        let name = data.require_str(KEY_VM)?;
        let mut emulator = Self {
            vm: env.machine(&name),
            creation_time: parse_creation_time(data)?,
            autodetected: false,
            device_model: String::new(),
            orientation: Orientation::Portrait,
            view_scaled: false,
            ssh_port: 0,
            ssh_timeout_secs: DEFAULT_SSH_TIMEOUT_SECS,
        };
        emulator.apply_map(data)?;
        Ok(emulator)
    }

    pub fn apply_map(&mut self, data: &SettingsMap) -> Result<()> {
        let name = data.require_str(KEY_VM)?;
        if name != self.name() {
            return Err(Error::Corruption(format!(
                "settings of \"{name}\" applied to \"{}\"",
                self.name()
            )));
        }

        self.creation_time = parse_creation_time(data)?;
        self.autodetected = data.bool_or(KEY_AUTODETECTED, false);
        self.device_model = data.str_or(KEY_DEVICE_MODEL, "");
        let orientation = data.str_or(KEY_ORIENTATION, ORIENTATIONS.show(Orientation::Portrait));
        self.orientation = ORIENTATIONS
            .parse(&orientation)
            .map_err(|e| Error::Corruption(format!("{KEY_ORIENTATION}: {e}")))?;
        self.view_scaled = data.bool_or(KEY_VIEW_SCALED, false);
        self.ssh_port = u16::try_from(data.i64_or(KEY_SSH_PORT, 0)).unwrap_or(0);
        self.ssh_timeout_secs = match data.i64_or(KEY_SSH_TIMEOUT, 0) {
            0 => DEFAULT_SSH_TIMEOUT_SECS,
            timeout => timeout,
        };
        Ok(())
    }

    pub fn to_map(&self) -> SettingsMap {
        let mut data = SettingsMap::new();
        data.set(KEY_VM, self.name());
        data.set(KEY_CREATION_TIME, self.creation_time.to_rfc3339());
        data.set(KEY_AUTODETECTED, self.autodetected);
        data.set(KEY_DEVICE_MODEL, self.device_model.as_str());
        data.set(KEY_ORIENTATION, ORIENTATIONS.show(self.orientation));
        data.set(KEY_VIEW_SCALED, self.view_scaled);
        data.set(KEY_SSH_PORT, self.ssh_port);
        data.set(KEY_SSH_TIMEOUT, self.ssh_timeout_secs);
        data
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

    pub fn device_model(&self) -> &str {
        &self.device_model
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn is_view_scaled(&self) -> bool {
        self.view_scaled
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    pub fn ssh_timeout_secs(&self) -> i64 {
        self.ssh_timeout_secs
    }

    pub fn set_ssh_timeout(&mut self, timeout_secs: i64) {
        self.ssh_timeout_secs = timeout_secs;
    }

    /// Reconfigure the display; the VM must be locked down
    pub fn set_display_properties(
        &mut self,
        reactor: &Reactor,
        model: &DeviceModel,
        orientation: Orientation,
        view_scaled: bool,
    ) -> bool {
        let landscape = orientation == Orientation::Landscape;
        let (width, height) = if landscape {
            (model.height, model.width)
        } else {
            (model.width, model.height)
        };
        let mode = VideoMode {
            width,
            height,
            device_model: model.name.clone(),
            landscape,
            scale_down_factor: if view_scaled { VIEW_SCALE_DOWN_FACTOR } else { 1 },
        };

        let ok = machine::block(reactor, |done| self.vm.set_video_mode(mode, done));
        if ok {
            self.device_model = model.name.clone();
            self.orientation = orientation;
            self.view_scaled = view_scaled;
        }
        ok
    }

    /// The VM must be locked down
    pub fn set_ssh_port(&mut self, reactor: &Reactor, port: u16) -> bool {
        let ok = machine::block(reactor, |done| {
            self.vm.set_reserved_port(ReservedPort::Ssh, port, done)
        });
        if ok {
            self.ssh_port = port;
        }
        ok
    }
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("name", &self.name())
            .field("device_model", &self.device_model)
            .finish_non_exhaustive()
    }
}

impl Identity for Emulator {
    type Key = String;
    type Stamp = DateTime<Utc>;

    fn key(&self) -> String {
        self.name().to_string()
    }

    fn stamp(&self) -> DateTime<Utc> {
        self.creation_time
    }
}

impl ScopedEntry for Emulator {
    fn is_autodetected(&self) -> bool {
        self.autodetected
    }
}
