//! Generic virtual machine power-state machine
//!
//! Both build engines and emulators are backed by a [`VirtualMachine`]. Every
//! operation is queued on the VM's own [`BatchComposer`], so operations on one
//! VM never overlap, and reports its outcome through a [`Completion`]. The CLI
//! turns them into blocking calls with [`Reactor::exec_async`] or [`block`].

pub mod backend;
#[cfg(test)]
pub mod fake;
pub mod vbox;

pub use backend::{PowerControl, ReservedPort, VideoMode, VmInfo};

use opflow::{BatchComposer, Completion, Reactor};
use std::future::Future;
use std::ops::BitOr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;

// ============================================================================
// Features
// ============================================================================

/// Capabilities a VM backend advertises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features(u16);

impl Features {
    pub const NONE: Self = Self(0);
    pub const LIMIT_MEMORY_SIZE: Self = Self(1 << 0);
    pub const LIMIT_CPU_COUNT: Self = Self(1 << 1);
    pub const GROW_STORAGE_SIZE: Self = Self(1 << 2);
    pub const SHRINK_STORAGE_SIZE: Self = Self(1 << 3);
    pub const OPTIONAL_HEADLESS: Self = Self(1 << 4);
    pub const SNAPSHOTS: Self = Self(1 << 5);
    pub const SWAP_MEMORY: Self = Self(1 << 6);
    pub const RESERVE_STORAGE_SIZE: Self = Self(1 << 7);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Features {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============================================================================
// Power state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Stopped and held so nobody starts it while it is being modified
    LockedDown,
}

impl PowerState {
    pub fn is_running(self) -> bool {
        matches!(self, PowerState::Starting | PowerState::Running)
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PowerState::Stopped => "stopped",
            PowerState::Starting => "starting",
            PowerState::Running => "running",
            PowerState::Stopping => "stopping",
            PowerState::LockedDown => "locked down",
        };
        f.write_str(label)
    }
}

// ============================================================================
// Host capacity
// ============================================================================

/// Resources of the host machine VMs may be given
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapacity {
    pub memory_mb: i64,
    pub cpu_count: i64,
}

impl HostCapacity {
    pub fn detect() -> Self {
        let memory_mb = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|content| parse_meminfo_total_mb(&content))
            .unwrap_or(i64::MAX);
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get() as i64)
            .unwrap_or(1);
        Self {
            memory_mb,
            cpu_count,
        }
    }
}

/// `MemTotal` from `/proc/meminfo`, in MB
fn parse_meminfo_total_mb(content: &str) -> Option<i64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let kb: i64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb / 1024)
    })
}

// ============================================================================
// Virtual machine
// ============================================================================

#[derive(Debug)]
struct Status {
    state: PowerState,
    info: VmInfo,
    headless: bool,
    /// Whether the VM ran before the current lock down
    resume_after_lock: bool,
}

pub struct VirtualMachine {
    name: String,
    backend: Arc<dyn PowerControl>,
    batch: BatchComposer,
    host: HostCapacity,
    status: Mutex<Status>,
}

impl VirtualMachine {
    pub fn new(
        handle: &Handle,
        name: impl Into<String>,
        backend: Arc<dyn PowerControl>,
        host: HostCapacity,
    ) -> Arc<Self> {
        let name = name.into();
        let batch = BatchComposer::new(handle, &format!("vm:{name}"));
        Arc::new(Self {
            name,
            backend,
            batch,
            host,
            status: Mutex::new(Status {
                state: PowerState::Stopped,
                info: VmInfo::default(),
                headless: false,
                resume_after_lock: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn features(&self) -> Features {
        self.backend.features()
    }

    pub fn host(&self) -> HostCapacity {
        self.host
    }

    fn status(&self) -> std::sync::MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> PowerState {
        self.status().state
    }

    fn set_state(&self, state: PowerState) {
        log::trace!("{}: {}", self.name, state);
        self.status().state = state;
    }

    /// Last fetched configuration
    pub fn info(&self) -> VmInfo {
        self.status().info.clone()
    }

    pub fn is_headless(&self) -> bool {
        self.status().headless
    }

    pub fn set_headless(&self, headless: bool) {
        self.status().headless = headless;
    }

    fn update_info(&self, update: impl FnOnce(&mut VmInfo)) {
        update(&mut self.status().info);
    }

    /// Queue `step`, completing `done` with its result
    fn schedule<F, Fut, T>(self: &Arc<Self>, done: Completion<T>, step: F)
    where
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let vm = Arc::clone(self);
        self.batch.enqueue(async move {
            done.complete(step(vm).await);
        });
    }

    /// Report an already known failure in queue order
    fn fail(self: &Arc<Self>, done: Completion<bool>) {
        self.batch
            .enqueue_check_point(self, move |_: &Self| done.complete(false));
    }

    fn require_locked_down(self: &Arc<Self>, what: &str, done: &Completion<bool>) -> bool {
        if self.state() == PowerState::LockedDown {
            return true;
        }
        log::warn!("{}: cannot change {what} unless locked down", self.name);
        self.fail(done.clone());
        false
    }

    fn report(&self, what: &str, result: anyhow::Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("{}: failed to {what}: {e:#}", self.name);
                false
            }
        }
    }

    /// Query the backend for the power state
    pub fn refresh_state(self: &Arc<Self>, done: Completion<bool>) {
        self.schedule(done, |vm| async move {
            match vm.backend.is_running(&vm.name).await {
                Ok(running) => {
                    if vm.state() != PowerState::LockedDown {
                        vm.set_state(if running {
                            PowerState::Running
                        } else {
                            PowerState::Stopped
                        });
                    }
                    true
                }
                Err(e) => {
                    log::error!("{}: failed to query state: {e:#}", vm.name);
                    false
                }
            }
        });
    }

    /// Fetch the configuration and power state from the backend
    pub fn refresh_info(self: &Arc<Self>, done: Completion<bool>) {
        self.schedule(done, |vm| async move {
            match vm.backend.fetch_info(&vm.name).await {
                Ok(info) => {
                    let running = info.running;
                    {
                        let mut status = vm.status();
                        status.info = info;
                        if status.state != PowerState::LockedDown {
                            status.state = if running {
                                PowerState::Running
                            } else {
                                PowerState::Stopped
                            };
                        }
                    }
                    true
                }
                Err(e) => {
                    log::error!("{}: failed to fetch info: {e:#}", vm.name);
                    false
                }
            }
        });
    }

    pub fn start(self: &Arc<Self>, done: Completion<bool>) {
        if self.state() == PowerState::LockedDown {
            log::warn!("{}: cannot start while locked down", self.name);
            self.fail(done);
            return;
        }
        self.schedule(done, |vm| async move { vm.do_start().await });
    }

    pub fn stop(self: &Arc<Self>, done: Completion<bool>) {
        if self.state() == PowerState::LockedDown {
            log::warn!("{}: cannot stop while locked down", self.name);
            self.fail(done);
            return;
        }
        self.schedule(done, |vm| async move { vm.do_stop().await });
    }

    async fn do_start(&self) -> bool {
        match self.backend.is_running(&self.name).await {
            Ok(true) => {
                self.set_state(PowerState::Running);
                return true;
            }
            Ok(false) => {}
            Err(e) => log::debug!("{}: state unknown before start: {e:#}", self.name),
        }

        self.set_state(PowerState::Starting);
        let headless = self.is_headless() && self.features().contains(Features::OPTIONAL_HEADLESS);
        let ok = self.report("start", self.backend.start(&self.name, headless).await);
        self.set_state(if ok {
            PowerState::Running
        } else {
            PowerState::Stopped
        });
        ok
    }

    async fn do_stop(&self) -> bool {
        match self.backend.is_running(&self.name).await {
            Ok(false) => {
                self.set_state(PowerState::Stopped);
                return true;
            }
            Ok(true) => {}
            Err(e) => log::debug!("{}: state unknown before stop: {e:#}", self.name),
        }

        self.set_state(PowerState::Stopping);
        let ok = self.report("stop", self.backend.stop(&self.name).await);
        self.set_state(if ok {
            PowerState::Stopped
        } else {
            PowerState::Running
        });
        ok
    }

    /// Hold the VM stopped, or release it and restore its running state
    pub fn lock_down(self: &Arc<Self>, lock: bool, done: Completion<bool>) {
        self.schedule(done, move |vm| async move {
            if lock {
                if vm.state() == PowerState::LockedDown {
                    return true;
                }
                let was_running = vm.backend.is_running(&vm.name).await.unwrap_or(true);
                if was_running && !vm.do_stop().await {
                    return false;
                }
                let mut status = vm.status();
                status.resume_after_lock = was_running;
                status.state = PowerState::LockedDown;
                log::debug!("{}: locked down", vm.name);
                true
            } else {
                if vm.state() != PowerState::LockedDown {
                    log::warn!("{}: not locked down", vm.name);
                    return true;
                }
                let resume = {
                    let mut status = vm.status();
                    status.state = PowerState::Stopped;
                    std::mem::take(&mut status.resume_after_lock)
                };
                log::debug!("{}: released", vm.name);
                !resume || vm.do_start().await
            }
        });
    }

    pub fn set_memory_size_mb(self: &Arc<Self>, size_mb: i64, done: Completion<bool>) {
        if !self.require_locked_down("memory size", &done) {
            return;
        }
        self.schedule(done, move |vm| async move {
            let result = vm.backend.set_memory_size_mb(&vm.name, size_mb).await;
            let ok = vm.report("set memory size", result);
            if ok {
                vm.update_info(|info| info.memory_size_mb = size_mb);
            }
            ok
        });
    }

    pub fn set_swap_size_mb(self: &Arc<Self>, size_mb: i64, done: Completion<bool>) {
        if !self.require_locked_down("swap size", &done) {
            return;
        }
        self.schedule(done, move |vm| async move {
            let result = vm.backend.set_swap_size_mb(&vm.name, size_mb).await;
            let ok = vm.report("set swap size", result);
            if ok {
                vm.update_info(|info| info.swap_size_mb = size_mb);
            }
            ok
        });
    }

    pub fn set_cpu_count(self: &Arc<Self>, count: i64, done: Completion<bool>) {
        if !self.require_locked_down("CPU count", &done) {
            return;
        }
        self.schedule(done, move |vm| async move {
            let result = vm.backend.set_cpu_count(&vm.name, count).await;
            let ok = vm.report("set CPU count", result);
            if ok {
                vm.update_info(|info| info.cpu_count = count);
            }
            ok
        });
    }

    pub fn set_storage_size_mb(self: &Arc<Self>, size_mb: i64, done: Completion<bool>) {
        if !self.require_locked_down("storage size", &done) {
            return;
        }
        self.schedule(done, move |vm| async move {
            let previous = vm.info().storage_size_mb;
            let result = vm.backend.set_storage_size_mb(&vm.name, size_mb).await;
            let ok = vm.report("set storage size", result);
            if ok {
                vm.update_info(|info| {
                    info.storage_size_mb = size_mb;
                    if info.free_storage_size_mb >= 0 {
                        info.free_storage_size_mb += size_mb - previous;
                    }
                });
            }
            ok
        });
    }

    /// Grow storage so at least `size_mb` is free, in multiples of `step_mb`
    pub fn reserve_storage_size_mb(
        self: &Arc<Self>,
        size_mb: i64,
        step_mb: i64,
        done: Completion<bool>,
    ) {
        if !self.require_locked_down("storage size", &done) {
            return;
        }
        self.schedule(done, move |vm| async move {
            let info = vm.info();
            let Some(target) =
                reserved_storage_target(info.storage_size_mb, info.free_storage_size_mb, size_mb, step_mb)
            else {
                return true;
            };
            log::debug!(
                "{}: growing storage from {} to {target} MB",
                vm.name,
                info.storage_size_mb
            );
            let result = vm.backend.set_storage_size_mb(&vm.name, target).await;
            let ok = vm.report("reserve storage size", result);
            if ok {
                vm.update_info(|info| {
                    info.free_storage_size_mb += target - info.storage_size_mb;
                    info.storage_size_mb = target;
                });
            }
            ok
        });
    }

    pub fn set_reserved_port(
        self: &Arc<Self>,
        which: ReservedPort,
        port: u16,
        done: Completion<bool>,
    ) {
        if !self.require_locked_down("port forwarding", &done) {
            return;
        }
        self.schedule(done, move |vm| async move {
            let result = vm.backend.set_reserved_port(&vm.name, which, port).await;
            let ok = vm.report("set port forwarding", result);
            if ok {
                vm.update_info(|info| match which {
                    ReservedPort::Ssh => info.ssh_port = port,
                    ReservedPort::DBus => info.dbus_port = port,
                });
            }
            ok
        });
    }

    pub fn set_video_mode(self: &Arc<Self>, mode: VideoMode, done: Completion<bool>) {
        if !self.require_locked_down("video mode", &done) {
            return;
        }
        self.schedule(done, move |vm| async move {
            let result = vm.backend.set_video_mode(&vm.name, &mode).await;
            vm.report("set video mode", result)
        });
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// New storage size needed to have `size_mb` free, `None` if already satisfied
fn reserved_storage_target(storage_mb: i64, free_mb: i64, size_mb: i64, step_mb: i64) -> Option<i64> {
    if free_mb >= size_mb {
        return None;
    }
    let step = step_mb.max(1);
    let missing = size_mb - free_mb.max(0);
    let steps = (missing + step - 1) / step;
    Some(storage_mb + steps * step)
}

/// Run a VM operation to completion, treating an abandoned completion as failure
pub fn block(reactor: &Reactor, start: impl FnOnce(Completion<bool>)) -> bool {
    reactor.exec_async(start).unwrap_or_else(|e| {
        if e.is_contract_violation() {
            log::error!("VM operation did not report a result");
        } else {
            log::error!("VM operation failed: {e}");
        }
        false
    })
}

/// Query the VM state and tell whether it is running
pub fn is_running_reliably(reactor: &Reactor, vm: &Arc<VirtualMachine>) -> bool {
    if vm.state() == PowerState::LockedDown {
        return false;
    }
    if !block(reactor, |done| vm.refresh_state(done)) {
        // Unknown counts as running so nothing gets disrupted
        return true;
    }
    vm.state().is_running()
}

#[cfg(test)]
mod tests {
    use super::fake::FakePowerControl;
    use super::*;

    fn setup(running: bool) -> (Reactor, Arc<FakePowerControl>, Arc<VirtualMachine>) {
        let reactor = Reactor::new().unwrap();
        let backend = Arc::new(FakePowerControl::new(running));
        let vm = VirtualMachine::new(
            &reactor.handle(),
            "engine",
            Arc::clone(&backend) as Arc<dyn PowerControl>,
            HostCapacity {
                memory_mb: 16384,
                cpu_count: 8,
            },
        );
        (reactor, backend, vm)
    }

    #[test]
    fn test_features() {
        let features = Features::LIMIT_MEMORY_SIZE | Features::SWAP_MEMORY;
        assert!(features.contains(Features::SWAP_MEMORY));
        assert!(!features.contains(Features::SHRINK_STORAGE_SIZE));
        assert!(features.contains(Features::NONE));
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16314404 kB\nMemFree:         1034512 kB\n";
        assert_eq!(parse_meminfo_total_mb(content), Some(15932));
        assert_eq!(parse_meminfo_total_mb("garbage"), None);
    }

    #[test]
    fn test_lock_down_restores_running_vm() {
        let (reactor, backend, vm) = setup(true);

        assert!(block(&reactor, |done| vm.lock_down(true, done)));
        assert_eq!(vm.state(), PowerState::LockedDown);
        assert!(!backend.running());

        assert!(block(&reactor, |done| vm.lock_down(false, done)));
        assert_eq!(vm.state(), PowerState::Running);
        assert!(backend.running());
        assert_eq!(backend.calls(), vec!["stop", "start"]);
    }

    #[test]
    fn test_lock_down_leaves_stopped_vm_stopped() {
        let (reactor, backend, vm) = setup(false);

        assert!(block(&reactor, |done| vm.lock_down(true, done)));
        assert!(block(&reactor, |done| vm.lock_down(false, done)));

        assert_eq!(vm.state(), PowerState::Stopped);
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_setters_require_lock_down() {
        let (reactor, backend, vm) = setup(false);

        assert!(!block(&reactor, |done| vm.set_memory_size_mb(2048, done)));
        assert!(backend.calls().is_empty());

        assert!(block(&reactor, |done| vm.lock_down(true, done)));
        assert!(block(&reactor, |done| vm.set_memory_size_mb(2048, done)));
        assert_eq!(vm.info().memory_size_mb, 2048);
        assert_eq!(backend.calls(), vec!["memory 2048"]);
    }

    #[test]
    fn test_start_refused_while_locked_down() {
        let (reactor, backend, vm) = setup(false);
        assert!(block(&reactor, |done| vm.lock_down(true, done)));
        assert!(!block(&reactor, |done| vm.start(done)));
        assert!(!backend.running());
    }

    #[test]
    fn test_start_and_stop() {
        let (reactor, backend, vm) = setup(false);
        assert!(block(&reactor, |done| vm.start(done)));
        assert!(is_running_reliably(&reactor, &vm));
        assert!(block(&reactor, |done| vm.stop(done)));
        assert!(!is_running_reliably(&reactor, &vm));
        assert_eq!(backend.calls(), vec!["start", "stop"]);
    }

    #[test]
    fn test_reserved_storage_target() {
        // Already enough free space
        assert_eq!(reserved_storage_target(10000, 5000, 4000, 4000), None);
        // 3000 missing, grown by one 4000 step
        assert_eq!(reserved_storage_target(10000, 1000, 4000, 4000), Some(14000));
        // 3000 missing, grown by two 2000 steps
        assert_eq!(reserved_storage_target(10000, 1000, 4000, 2000), Some(14000));
        assert_eq!(reserved_storage_target(10000, 1000, 4000, 1000), Some(13000));
    }

    #[test]
    fn test_reserve_storage_updates_info() {
        let (reactor, backend, vm) = setup(false);
        backend.set_info(VmInfo {
            storage_size_mb: 10000,
            free_storage_size_mb: 1000,
            ..VmInfo::default()
        });
        assert!(block(&reactor, |done| vm.refresh_info(done)));
        assert!(block(&reactor, |done| vm.lock_down(true, done)));
        assert!(block(&reactor, |done| vm.reserve_storage_size_mb(4000, 4000, done)));

        let info = vm.info();
        assert_eq!(info.storage_size_mb, 14000);
        assert_eq!(info.free_storage_size_mb, 5000);
        assert_eq!(backend.calls(), vec!["storage 14000"]);
    }
}
