//! Two-phase validate/apply of `name=value` property assignments
//!
//! Every resource kind exposes its properties through a [`PropertiesAccessor`],
//! usually backed by a static [`Table`] mapping a property name to its
//! parse/format functions. Accessors compose by delegation: a resource
//! specific table is consulted first, the shared VM table second.
//!
//! A [`PropertyBatch`] stages every assignment before touching anything. Only
//! when all of them parsed does it quiesce the VM (if some property needs it),
//! apply the staged values that differ from the current ones and restore the
//! VM's running state.

pub mod emulator;
pub mod engine;
pub mod grammar;
pub mod sdk;
pub mod vm;

use crate::error::{Error, Result};
use crate::hook::{self, NoHook, ScriptHook};
use crate::vm::{self as machine, VirtualMachine};
use opflow::Reactor;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

/// Outcome of staging one assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepare {
    /// The accessor does not know the property
    Ignored,
    Prepared { needs_vm_off: bool },
    Failed(String),
}

pub trait PropertiesAccessor {
    /// Current or staged value of every readable property
    fn get(&self) -> BTreeMap<String, String>;

    fn prepare_set(&mut self, name: &str, value: &str) -> Prepare;

    /// Validate invariants spanning several staged properties
    fn can_set(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Apply staged values that differ from the current ones
    fn set(&mut self) -> bool;
}

// ============================================================================
// Property tables
// ============================================================================

/// One row of a property table over staged state `S`
pub struct Property<S> {
    pub name: &'static str,
    /// Whether the property exists for this particular resource
    pub available: fn(&S) -> bool,
    /// `None` for write-only properties
    pub show: Option<fn(&S) -> String>,
    /// Stage a value; `Ok(true)` when applying it needs the VM off
    pub prepare: fn(&mut S, &str) -> std::result::Result<bool, String>,
}

pub fn always<S>(_: &S) -> bool {
    true
}

pub struct Table<S: 'static> {
    rows: &'static [Property<S>],
}

impl<S> Table<S> {
    pub const fn new(rows: &'static [Property<S>]) -> Self {
        Self { rows }
    }

    pub fn get(&self, staged: &S) -> BTreeMap<String, String> {
        self.rows
            .iter()
            .filter(|row| (row.available)(staged))
            .filter_map(|row| row.show.map(|show| (row.name.to_string(), show(staged))))
            .collect()
    }

    pub fn prepare(&self, staged: &mut S, name: &str, value: &str) -> Prepare {
        let Some(row) = self
            .rows
            .iter()
            .find(|row| row.name == name && (row.available)(staged))
        else {
            return Prepare::Ignored;
        };
        match (row.prepare)(staged, value) {
            Ok(needs_vm_off) => Prepare::Prepared { needs_vm_off },
            Err(message) => Prepare::Failed(message),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rows.iter().map(|row| row.name)
    }
}

/// Resource specific accessor backed by the shared VM accessor
pub struct Delegating<'a> {
    specific: Box<dyn PropertiesAccessor + 'a>,
    shared: Box<dyn PropertiesAccessor + 'a>,
}

impl<'a> Delegating<'a> {
    pub fn new(
        specific: Box<dyn PropertiesAccessor + 'a>,
        shared: Box<dyn PropertiesAccessor + 'a>,
    ) -> Self {
        Self { specific, shared }
    }
}

impl PropertiesAccessor for Delegating<'_> {
    fn get(&self) -> BTreeMap<String, String> {
        let mut values = self.shared.get();
        values.extend(self.specific.get());
        values
    }

    fn prepare_set(&mut self, name: &str, value: &str) -> Prepare {
        match self.specific.prepare_set(name, value) {
            Prepare::Ignored => self.shared.prepare_set(name, value),
            decided => decided,
        }
    }

    fn can_set(&self) -> std::result::Result<(), String> {
        self.specific.can_set()?;
        self.shared.can_set()
    }

    fn set(&mut self) -> bool {
        self.shared.set() && self.specific.set()
    }
}

// ============================================================================
// Assignments
// ============================================================================

/// A parsed `name=value` command-line argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub name: String,
    pub value: String,
    /// The camel-case spelling the user typed, if any
    pub deprecated_name: Option<String>,
}

fn camel_case_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("([A-Z])").expect("valid regex"))
}

/// Map a deprecated camel-case property name to its hyphenated form
pub fn normalize_name(name: &str) -> String {
    camel_case_pattern()
        .replace_all(name, "-$1")
        .to_lowercase()
}

pub fn parse_assignment(arg: &str) -> Result<Assignment> {
    let Some((name, value)) = arg.split_once('=').filter(|(name, _)| !name.is_empty()) else {
        return Err(Error::Usage(format!("Assignment expected: \"{arg}\"")));
    };

    let normalized = normalize_name(name);
    let deprecated_name = (normalized != name).then(|| name.to_string());
    Ok(Assignment {
        name: normalized,
        value: value.to_string(),
        deprecated_name,
    })
}

pub fn parse_assignments(args: &[String]) -> Result<Vec<Assignment>> {
    args.iter().map(|arg| parse_assignment(arg)).collect()
}

// ============================================================================
// Batch
// ============================================================================

/// Staged assignments against one resource
pub struct PropertyBatch<'a> {
    reactor: &'a Reactor,
    vm: Arc<VirtualMachine>,
    accessor: Box<dyn PropertiesAccessor + 'a>,
    stop_vm_message: String,
    auto_stop_vms: bool,
    hook: &'a dyn ScriptHook,
    scope: &'static str,
    staged: Vec<(String, String)>,
    needs_vm_off: bool,
}

impl<'a> PropertyBatch<'a> {
    /// `stop_vm_message` is reported when the VM must be stopped by the user
    pub fn new(
        reactor: &'a Reactor,
        vm: Arc<VirtualMachine>,
        accessor: Box<dyn PropertiesAccessor + 'a>,
        stop_vm_message: impl Into<String>,
    ) -> Self {
        Self {
            reactor,
            vm,
            accessor,
            stop_vm_message: stop_vm_message.into(),
            auto_stop_vms: false,
            hook: &NoHook,
            scope: "",
            staged: Vec::new(),
            needs_vm_off: false,
        }
    }

    /// Stop a running VM instead of refusing to apply
    pub fn auto_stop_vms(mut self, enabled: bool) -> Self {
        self.auto_stop_vms = enabled;
        self
    }

    /// Let `hook` veto the batch before anything is applied
    pub fn with_hook(mut self, hook: &'a dyn ScriptHook, scope: &'static str) -> Self {
        self.hook = hook;
        self.scope = scope;
        self
    }

    pub fn get(&self) -> BTreeMap<String, String> {
        self.accessor.get()
    }

    pub fn needs_vm_off(&self) -> bool {
        self.needs_vm_off
    }

    pub fn prepare_set(&mut self, name: &str, value: &str) -> Result<()> {
        match self.accessor.prepare_set(name, value) {
            Prepare::Prepared { needs_vm_off } => {
                self.needs_vm_off |= needs_vm_off;
                self.staged.push((name.to_string(), value.to_string()));
                Ok(())
            }
            Prepare::Failed(message) => Err(Error::validation(name, message)),
            Prepare::Ignored => Err(Error::validation(name, grammar::UNKNOWN_PROPERTY)),
        }
    }

    /// Stage every assignment, stopping at the first invalid one
    pub fn prepare_all(&mut self, assignments: &[Assignment]) -> Result<()> {
        for assignment in assignments {
            self.prepare_set(&assignment.name, &assignment.value)?;
            if let Some(old) = &assignment.deprecated_name {
                log::warn!(
                    "The \"{old}\" property is deprecated. Use \"{}\" instead.",
                    assignment.name
                );
            }
        }
        Ok(())
    }

    /// Apply the staged assignments
    pub fn set(&mut self) -> Result<()> {
        self.accessor
            .can_set()
            .map_err(|message| Error::validation("", message))?;

        let veto = hook::before_set(self.hook, self.scope, &self.staged)
            .map_err(|e| Error::Transport(format!("{e:#}")))?;
        if let Some(reason) = veto {
            return Err(Error::Usage(reason));
        }

        let mut locked = false;
        if self.needs_vm_off {
            if !self.auto_stop_vms && machine::is_running_reliably(self.reactor, &self.vm) {
                return Err(Error::Precondition(self.stop_vm_message.clone()));
            }
            locked = machine::block(self.reactor, |done| self.vm.lock_down(true, done));
            if !locked {
                return Err(Error::Transport(format!(
                    "Failed to stop the virtual machine \"{}\"",
                    self.vm.name()
                )));
            }
        }

        let ok = self.accessor.set();

        if locked {
            let restored = machine::block(self.reactor, |done| self.vm.lock_down(false, done));
            if !restored {
                log::error!("Failed to restore the state of \"{}\"", self.vm.name());
            }
            debug_assert!(restored, "restoring the VM state failed");
        }

        if ok {
            Ok(())
        } else {
            Err(Error::PartialApply(
                "Failed to set some of the properties".to_string(),
            ))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::vm::fake::FakePowerControl;
    use crate::vm::{HostCapacity, PowerControl, VirtualMachine, VmInfo};
    use opflow::Reactor;
    use std::sync::Arc;

    pub struct Fixture {
        pub reactor: Reactor,
        pub backend: Arc<FakePowerControl>,
        pub vm: Arc<VirtualMachine>,
    }

    /// A VM with 2 GB RAM, 2 CPUs, 20 GB storage, 8 GB free, on an 8 CPU host
    pub fn fixture(running: bool) -> Fixture {
        let reactor = Reactor::new().unwrap();
        let backend = Arc::new(FakePowerControl::new(running));
        backend.set_info(VmInfo {
            memory_size_mb: 2048,
            swap_size_mb: 512,
            cpu_count: 2,
            storage_size_mb: 20000,
            free_storage_size_mb: 8000,
            ssh_port: 2222,
            dbus_port: 7777,
            ..VmInfo::default()
        });
        let vm = VirtualMachine::new(
            &reactor.handle(),
            "Sailfish OS Build Engine",
            Arc::clone(&backend) as Arc<dyn PowerControl>,
            HostCapacity {
                memory_mb: 16384,
                cpu_count: 8,
            },
        );
        assert!(crate::vm::block(&reactor, |done| vm.refresh_info(done)));
        Fixture {
            reactor,
            backend,
            vm,
        }
    }
}
