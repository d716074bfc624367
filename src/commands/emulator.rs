use super::{Context, power, print_properties, refresh_info, save_after, supervised};
use crate::cli::EmulatorCommand;
use crate::config;
use crate::emulator::ORIENTATIONS;
use crate::property::emulator::EmulatorProperties;
use crate::property::vm::VmProperties;
use crate::property::{self, Delegating, PropertiesAccessor, PropertyBatch};
use crate::ui;
use crate::vm as machine;
use anyhow::Result;
use colored::Colorize;
use std::sync::Arc;

pub fn run(ctx: &mut Context, cmd: EmulatorCommand) -> Result<()> {
    match cmd {
        EmulatorCommand::List => list(ctx),
        EmulatorCommand::Show { name } => show(ctx, name.as_deref()),
        EmulatorCommand::Set { name, assignments } => set(ctx, name.as_deref(), &assignments),
        EmulatorCommand::Start { name } => {
            let vm = Arc::clone(ctx.sdk.emulator(name.as_deref())?.virtual_machine());
            power(ctx, &vm, true)
        }
        EmulatorCommand::Stop { name } => {
            let vm = Arc::clone(ctx.sdk.emulator(name.as_deref())?.virtual_machine());
            power(ctx, &vm, false)
        }
    }
}

fn list(ctx: &Context) -> Result<()> {
    let emulators = ctx.sdk.emulators();
    if emulators.is_empty() {
        ui::dim("No emulators configured");
        return Ok(());
    }

    ui::header("Emulators");
    for emulator in emulators {
        let vm = emulator.virtual_machine();
        let state = if machine::block(&ctx.reactor, |done| vm.refresh_state(done)) {
            ui::state_label(vm.state().is_running())
        } else {
            "unknown".yellow().to_string()
        };
        let display = match ctx.sdk.environment().device_model(emulator.device_model()) {
            Some(model) => format!(
                "{} {}x{} {}",
                model.name,
                model.width,
                model.height,
                ORIENTATIONS.show(emulator.orientation())
            ),
            None => format!("{} (unknown model)", emulator.device_model()),
        };
        let origin = if emulator.is_autodetected() {
            " (autodetected)".dimmed().to_string()
        } else {
            String::new()
        };
        println!("  {}{origin}", emulator.name().bold());
        ui::kv("State", &state);
        ui::kv("Display", &display);
    }
    Ok(())
}

fn show(ctx: &mut Context, name: Option<&str>) -> Result<()> {
    let (emulator, models) = ctx.sdk.emulator_and_models(name)?;
    let vm = Arc::clone(emulator.virtual_machine());
    refresh_info(&ctx.reactor, &vm);

    let specific = EmulatorProperties::new(&ctx.reactor, emulator, models);
    let shared = VmProperties::new(&ctx.reactor, vm);
    print_properties(&Delegating::new(Box::new(specific), Box::new(shared)).get());
    Ok(())
}

fn set(ctx: &mut Context, name: Option<&str>, args: &[String]) -> Result<()> {
    let assignments = property::parse_assignments(args)?;
    let (emulator, models) = ctx.sdk.emulator_and_models(name)?;
    let vm = Arc::clone(emulator.virtual_machine());
    refresh_info(&ctx.reactor, &vm);

    let stop_message = format!(
        "The emulator \"{}\" is running. Stop it first or set {}=1",
        emulator.name(),
        config::ENV_AUTO_STOP_VMS
    );
    let specific = EmulatorProperties::new(&ctx.reactor, emulator, models);
    let shared = VmProperties::new(&ctx.reactor, Arc::clone(&vm));
    let result = {
        let accessor = Delegating::new(Box::new(specific), Box::new(shared));
        let mut batch = PropertyBatch::new(&ctx.reactor, vm, Box::new(accessor), stop_message)
            .auto_stop_vms(ctx.auto_stop_vms)
            .with_hook(ctx.hook.as_ref(), "emulator");
        supervised(&ctx.reactor, "emulator set", || {
            batch.prepare_all(&assignments).and_then(|()| batch.set())
        })
    };
    save_after(&ctx.sdk, result)
}
