use super::{Context, power, print_properties, refresh_info, save_after, supervised};
use crate::cli::EngineCommand;
use crate::config;
use crate::engine::target;
use crate::error::Error;
use crate::hook;
use crate::property::engine::EngineProperties;
use crate::property::vm::VmProperties;
use crate::property::{self, Delegating, PropertiesAccessor, PropertyBatch};
use crate::transport::RemoteExec;
use crate::ui;
use crate::vm as machine;
use anyhow::Result;
use colored::Colorize;
use reconcile::NoObserver;
use std::sync::Arc;

/// Run an engine subcommand and return the process exit code
pub fn run(ctx: &mut Context, cmd: EngineCommand) -> Result<u8> {
    match cmd {
        EngineCommand::Show { name } => show(ctx, name.as_deref())?,
        EngineCommand::Set { name, assignments } => set(ctx, name.as_deref(), &assignments)?,
        EngineCommand::Start { name } => {
            let vm = Arc::clone(ctx.sdk.engine(name.as_deref())?.virtual_machine());
            power(ctx, &vm, true)?;
        }
        EngineCommand::Stop { name } => {
            let vm = Arc::clone(ctx.sdk.engine(name.as_deref())?.virtual_machine());
            power(ctx, &vm, false)?;
        }
        EngineCommand::Status { name } => status(ctx, name.as_deref())?,
        EngineCommand::Exec { name, command } => return exec(ctx, name.as_deref(), command),
        EngineCommand::Targets { name, target: None } => targets(ctx, name.as_deref())?,
        EngineCommand::Targets {
            name,
            target: Some(target),
        } => show_target(ctx, name.as_deref(), &target)?,
        EngineCommand::Refresh { name } => refresh(ctx, name.as_deref())?,
    }
    Ok(0)
}

fn show(ctx: &mut Context, name: Option<&str>) -> Result<()> {
    let host_name = ctx.sdk.effective_build_host_name();
    let (engine, defaults) = ctx.sdk.engine_and_defaults(name)?;
    let vm = Arc::clone(engine.virtual_machine());
    refresh_info(&ctx.reactor, &vm);

    let specific = EngineProperties::new(&ctx.reactor, engine, defaults, host_name);
    let shared = VmProperties::new(&ctx.reactor, vm);
    print_properties(&Delegating::new(Box::new(specific), Box::new(shared)).get());
    Ok(())
}

fn set(ctx: &mut Context, name: Option<&str>, args: &[String]) -> Result<()> {
    let assignments = property::parse_assignments(args)?;
    let host_name = ctx.sdk.effective_build_host_name();
    let (engine, defaults) = ctx.sdk.engine_and_defaults(name)?;
    let vm = Arc::clone(engine.virtual_machine());
    refresh_info(&ctx.reactor, &vm);

    let stop_message = format!(
        "The build engine \"{}\" is running. Stop it first or set {}=1",
        engine.name(),
        config::ENV_AUTO_STOP_VMS
    );
    let specific = EngineProperties::new(&ctx.reactor, engine, defaults, host_name);
    let shared = VmProperties::new(&ctx.reactor, Arc::clone(&vm));
    let result = {
        let accessor = Delegating::new(Box::new(specific), Box::new(shared));
        let mut batch = PropertyBatch::new(&ctx.reactor, vm, Box::new(accessor), stop_message)
            .auto_stop_vms(ctx.auto_stop_vms)
            .with_hook(ctx.hook.as_ref(), "engine");
        supervised(&ctx.reactor, "engine set", || {
            batch.prepare_all(&assignments).and_then(|()| batch.set())
        })
    };
    save_after(&ctx.sdk, result)
}

fn status(ctx: &Context, name: Option<&str>) -> Result<()> {
    let engine = ctx.sdk.engine(name)?;
    let vm = engine.virtual_machine();
    let state = if machine::block(&ctx.reactor, |done| vm.refresh_state(done)) {
        ui::state_label(vm.state().is_running())
    } else {
        "unknown".yellow().to_string()
    };

    let ssh = engine.ssh_parameters();
    ui::header(engine.name());
    ui::kv("State", &state);
    ui::kv("SSH", &format!("{}@{}:{}", ssh.user, ssh.host, ssh.port));
    ui::kv("D-Bus port", &engine.dbus_port().to_string());
    ui::kv(
        "Shared targets",
        &engine.shared_paths().targets.display().to_string(),
    );
    ui::kv("Build targets", &engine.build_targets().count().to_string());
    Ok(())
}

fn targets(ctx: &Context, name: Option<&str>) -> Result<()> {
    let engine = ctx.sdk.engine(name)?;
    ui::header(&format!("Build targets of {}", engine.name()));

    let mut any = false;
    for data in engine.build_targets() {
        any = true;
        let sysroot = ui::truncate_path(&data.sysroot.display().to_string(), 48);
        if data.is_snapshot() {
            println!(
                "  {:<40} {} {}",
                data.name,
                sysroot.dimmed(),
                format!("(snapshot of {})", data.origin).dimmed()
            );
        } else {
            println!("  {:<40} {}", data.name, sysroot.dimmed());
        }
    }
    if !any {
        ui::dim("No build targets");
    }
    Ok(())
}

fn show_target(ctx: &Context, name: Option<&str>, target: &str) -> Result<()> {
    let engine = ctx.sdk.engine(name)?;
    let Some(data) = engine
        .build_target(target)
        .or_else(|| engine.build_target_by_origin(target, None))
    else {
        return Err(Error::Usage(format!("No such build target: \"{target}\"")).into());
    };

    ui::header(&data.name);
    if data.is_snapshot() {
        ui::kv("Snapshot of", &data.origin);
    }
    ui::kv("Machine", &data.machine);
    ui::kv("Sysroot", &data.sysroot.display().to_string());
    ui::kv("Tools", &data.tools_path.display().to_string());
    ui::kv("Debugger", &data.gdb.display().to_string());
    if !data.validation_suites.is_empty() {
        println!("  {}", "Validation suites:".dimmed());
        print!("{}", target::format_validation_suites(&data.validation_suites));
    }
    Ok(())
}

fn refresh(ctx: &mut Context, name: Option<&str>) -> Result<()> {
    let engine = ctx.sdk.engine_mut(name)?;
    let Some(summary) = engine.refresh_build_targets(&mut NoObserver) else {
        return Err(Error::Corruption(format!(
            "the build targets of \"{}\" could not be read",
            engine.name()
        ))
        .into());
    };

    if summary.is_noop() {
        ui::info("Build targets are up to date");
    } else {
        ui::success(&format!(
            "Build targets updated: {} added, {} updated, {} removed",
            summary.added, summary.updated, summary.removed
        ));
    }
    ctx.sdk.save()?;
    Ok(())
}

fn exec(ctx: &Context, name: Option<&str>, command: Vec<String>) -> Result<u8> {
    let command = hook::filter_command_line(ctx.hook.as_ref(), command)?;
    if command.is_empty() {
        return Err(Error::Usage("No command to execute".to_string()).into());
    }

    let engine = ctx.sdk.engine(name)?;
    if !machine::is_running_reliably(&ctx.reactor, engine.virtual_machine()) {
        return Err(Error::Precondition(format!(
            "The build engine \"{}\" is not running",
            engine.name()
        ))
        .into());
    }

    let remote = engine.remote();
    let captured = supervised(&ctx.reactor, "engine exec", || {
        ctx.reactor
            .wait(async move { remote.exec(&command).await })
    })??;

    print!("{}", captured.stdout);
    eprint!("{}", captured.stderr);
    Ok(captured
        .code
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1))
}
