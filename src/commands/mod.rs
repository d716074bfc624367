//! Command implementations
//!
//! Every command runs as the supervised task of the process, so an interrupt
//! becomes a terminate request instead of killing a half finished VM
//! operation.

pub mod config;
pub mod emulator;
pub mod engine;

use crate::error::{self, Error};
use crate::hook::ScriptHook;
use crate::progress;
use crate::registry::Sdk;
use crate::ui;
use crate::vm::{self as machine, VirtualMachine};
use anyhow::Result;
use opflow::{Reactor, Task, supervise};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything a command works with
pub struct Context {
    pub reactor: Reactor,
    pub sdk: Sdk,
    pub hook: Box<dyn ScriptHook>,
    pub quiet: bool,
    /// Lock down running VMs instead of refusing to change them
    pub auto_stop_vms: bool,
}

/// Run `f` as the task `name`, forwarding interrupts to it
pub fn supervised<R>(reactor: &Reactor, name: &str, f: impl FnOnce() -> R) -> R {
    let task = Arc::new(Task::advisory(name));
    let _supervisor = supervise(&reactor.handle(), Arc::clone(&task));
    task.run(f)
}

/// Start or stop `vm`, waiting until it settles
pub fn power(ctx: &Context, vm: &Arc<VirtualMachine>, start: bool) -> Result<()> {
    let (verb, action, done_msg) = if start {
        ("Starting", "start", "started")
    } else {
        ("Stopping", "stop", "stopped")
    };
    let pb = progress::spinner(&format!("{verb} {}", vm.name()), ctx.quiet);
    let ok = supervised(&ctx.reactor, verb, || {
        machine::block(&ctx.reactor, |done| {
            if start {
                vm.start(done);
            } else {
                vm.stop(done);
            }
        })
    });

    if ok {
        progress::finish(&pb, true, &format!("{} {done_msg}", vm.name()));
        Ok(())
    } else {
        progress::finish(&pb, false, &format!("{} not {done_msg}", vm.name()));
        Err(Error::Transport(format!("Failed to {action} \"{}\"", vm.name())).into())
    }
}

/// Fetch the VM configuration, keeping the cached one on failure
pub fn refresh_info(reactor: &Reactor, vm: &Arc<VirtualMachine>) {
    if !machine::block(reactor, |done| vm.refresh_info(done)) {
        log::warn!("Could not query \"{}\", using cached values", vm.name());
    }
}

/// Print a property listing sorted by name
pub fn print_properties(values: &BTreeMap<String, String>) {
    for (name, value) in values {
        ui::property(name, value);
    }
}

/// Save the settings unless `result` failed before touching anything
pub fn save_after(sdk: &Sdk, result: error::Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_before_mutation() => Err(e.into()),
        result => {
            sdk.save()?;
            Ok(result?)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Context;
    use crate::hook::NoHook;
    use crate::registry::Sdk;
    use crate::registry::testing::fake_environment;
    use crate::vm::fake::FakePowerControl;
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;

    /// A context with one build engine and one emulator saved under `dir/user`
    pub fn context(dir: &Path) -> (Context, Arc<FakePowerControl>) {
        let user = dir.join("user");
        std::fs::create_dir_all(&user).unwrap();
        let engines = json!({
            "Version": 1,
            "InstallDir": "/opt/SailfishOS",
            "CustomBuildHostName": "",
            "BuildEnvironmentFilter": ["LANG"],
            "BuildEnginesCount": 1,
            "BuildEngine.0": {
                "VirtualMachine": "Sailfish OS Build Engine",
                "CreationTime": "2024-03-01T10:00:00Z",
                "SharedConfig": dir.join("config").display().to_string(),
                "SharedTargets": dir.join("targets").display().to_string(),
                "SshPort": 2222,
                "DBusPort": 7777,
            },
        });
        let emulators = json!({
            "Version": 1,
            "EmulatorsCount": 1,
            "Emulator.0": {
                "VirtualMachine": "Sailfish OS Emulator",
                "CreationTime": "2024-03-01T10:00:00Z",
                "DeviceModel": "Sailfish OS Emulator",
                "Orientation": "portrait",
                "SshPort": 2223,
            },
        });
        std::fs::write(user.join("engines.json"), engines.to_string()).unwrap();
        std::fs::write(user.join("emulators.json"), emulators.to_string()).unwrap();

        let (reactor, env, backend) = fake_environment(dir);
        let sdk = Sdk::load(env, &user, &dir.join("system")).unwrap();
        let ctx = Context {
            reactor,
            sdk,
            hook: Box::new(NoHook),
            quiet: true,
            auto_stop_vms: false,
        };
        (ctx, backend)
    }
}
