//! Properties shared by every VM backed resource

use super::grammar::{self, ReserveSpec};
use super::{PropertiesAccessor, Prepare, Property, Table, always};
use crate::vm::{self as machine, Features, HostCapacity, VirtualMachine, VmInfo};
use opflow::Reactor;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const MEMORY_SIZE: &str = "vm.memory-size";
pub const SWAP_SIZE: &str = "vm.swap-size";
pub const CPU_COUNT: &str = "vm.cpu-count";
pub const STORAGE_SIZE: &str = "vm.storage-size";
/// Write-only; grows storage until the requested size is free
pub const FREE_STORAGE_SIZE: &str = "vm.free-storage-size";

pub struct VmStaged {
    features: Features,
    host: HostCapacity,
    current: VmInfo,
    memory_size_mb: i64,
    swap_size_mb: i64,
    cpu_count: i64,
    storage_size_mb: i64,
    reserve: Option<ReserveSpec>,
}

impl VmStaged {
    fn new(vm: &VirtualMachine) -> Self {
        let current = vm.info();
        Self {
            features: vm.features(),
            host: vm.host(),
            memory_size_mb: current.memory_size_mb,
            swap_size_mb: current.swap_size_mb,
            cpu_count: current.cpu_count,
            storage_size_mb: current.storage_size_mb,
            reserve: None,
            current,
        }
    }
}

fn has_swap(s: &VmStaged) -> bool {
    s.features.contains(Features::SWAP_MEMORY)
}

fn show_memory(s: &VmStaged) -> String {
    s.memory_size_mb.to_string()
}

fn show_swap(s: &VmStaged) -> String {
    s.swap_size_mb.to_string()
}

fn show_cpus(s: &VmStaged) -> String {
    s.cpu_count.to_string()
}

fn show_storage(s: &VmStaged) -> String {
    s.storage_size_mb.to_string()
}

fn require(s: &VmStaged, feature: Features) -> Result<(), String> {
    if s.features.contains(feature) {
        Ok(())
    } else {
        Err(grammar::READ_ONLY_PROPERTY.to_string())
    }
}

fn prepare_memory(s: &mut VmStaged, value: &str) -> Result<bool, String> {
    require(s, Features::LIMIT_MEMORY_SIZE)?;
    let size = grammar::parse_positive_int(value)?;
    if size > s.host.memory_mb {
        return Err(grammar::VALUE_TOO_BIG.to_string());
    }
    s.memory_size_mb = size;
    Ok(true)
}

fn prepare_swap(s: &mut VmStaged, value: &str) -> Result<bool, String> {
    let size = grammar::parse_non_negative_int(value)?;
    // Swap lives on the storage, as staged so far
    if size > s.storage_size_mb {
        return Err(grammar::VALUE_TOO_BIG.to_string());
    }
    s.swap_size_mb = size;
    Ok(true)
}

fn prepare_cpus(s: &mut VmStaged, value: &str) -> Result<bool, String> {
    require(s, Features::LIMIT_CPU_COUNT)?;
    let count = grammar::parse_positive_int(value)?;
    if count > s.host.cpu_count {
        return Err(grammar::VALUE_TOO_BIG.to_string());
    }
    s.cpu_count = count;
    Ok(true)
}

fn prepare_storage(s: &mut VmStaged, value: &str) -> Result<bool, String> {
    let size = grammar::parse_positive_int(value)?;
    let current = s.current.storage_size_mb;
    if size < current && !s.features.contains(Features::SHRINK_STORAGE_SIZE) {
        return Err(grammar::VALUE_CANNOT_BE_DECREASED.to_string());
    }
    if size > current && !s.features.contains(Features::GROW_STORAGE_SIZE) {
        return Err(grammar::VALUE_CANNOT_BE_INCREASED.to_string());
    }
    s.storage_size_mb = size;
    Ok(true)
}

fn prepare_free_storage(s: &mut VmStaged, value: &str) -> Result<bool, String> {
    let spec = grammar::parse_reserve_size(value)?;
    let free = s.current.free_storage_size_mb;
    if free < 0 {
        return Err("Failed to determine current free storage size".to_string());
    }
    if spec.size_mb <= free {
        s.reserve = None;
        return Ok(false);
    }
    s.reserve = Some(spec);
    Ok(true)
}

static PROPERTIES: Table<VmStaged> = Table::new(&[
    Property {
        name: MEMORY_SIZE,
        available: always,
        show: Some(show_memory),
        prepare: prepare_memory,
    },
    Property {
        name: SWAP_SIZE,
        available: has_swap,
        show: Some(show_swap),
        prepare: prepare_swap,
    },
    Property {
        name: CPU_COUNT,
        available: always,
        show: Some(show_cpus),
        prepare: prepare_cpus,
    },
    Property {
        name: STORAGE_SIZE,
        available: always,
        show: Some(show_storage),
        prepare: prepare_storage,
    },
    Property {
        name: FREE_STORAGE_SIZE,
        available: always,
        show: None,
        prepare: prepare_free_storage,
    },
]);

/// Accessor for the `vm.*` properties
pub struct VmProperties<'a> {
    reactor: &'a Reactor,
    vm: Arc<VirtualMachine>,
    staged: VmStaged,
}

impl<'a> VmProperties<'a> {
    pub fn new(reactor: &'a Reactor, vm: Arc<VirtualMachine>) -> Self {
        let staged = VmStaged::new(&vm);
        Self {
            reactor,
            vm,
            staged,
        }
    }
}

impl PropertiesAccessor for VmProperties<'_> {
    fn get(&self) -> BTreeMap<String, String> {
        PROPERTIES.get(&self.staged)
    }

    fn prepare_set(&mut self, name: &str, value: &str) -> Prepare {
        PROPERTIES.prepare(&mut self.staged, name, value)
    }

    fn set(&mut self) -> bool {
        let current = self.vm.info();
        let staged = &self.staged;
        let vm = &self.vm;
        let mut ok = true;

        if staged.memory_size_mb != current.memory_size_mb {
            ok &= machine::block(self.reactor, |done| {
                vm.set_memory_size_mb(staged.memory_size_mb, done)
            });
        }

        if has_swap(staged) && staged.swap_size_mb != current.swap_size_mb {
            ok &= machine::block(self.reactor, |done| {
                vm.set_swap_size_mb(staged.swap_size_mb, done)
            });
        }

        if staged.cpu_count != current.cpu_count {
            ok &= machine::block(self.reactor, |done| vm.set_cpu_count(staged.cpu_count, done));
        }

        if staged.storage_size_mb != current.storage_size_mb {
            ok &= machine::block(self.reactor, |done| {
                vm.set_storage_size_mb(staged.storage_size_mb, done)
            });
        }

        if let Some(reserve) = staged.reserve {
            ok &= machine::block(self.reactor, |done| {
                vm.reserve_storage_size_mb(reserve.size_mb, reserve.step_mb, done)
            });
        }

        ok
    }
}
