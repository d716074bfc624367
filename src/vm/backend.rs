//! Transport contract for VM power control

use super::Features;
use anyhow::Result;
use async_trait::async_trait;

/// Snapshot of a VM's configuration as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub memory_size_mb: i64,
    pub swap_size_mb: i64,
    pub cpu_count: i64,
    pub storage_size_mb: i64,
    /// Negative when the guest did not report it
    pub free_storage_size_mb: i64,
    pub ssh_port: u16,
    pub dbus_port: u16,
    pub storage_uuid: String,
    pub running: bool,
    pub headless: bool,
}

impl Default for VmInfo {
    fn default() -> Self {
        Self {
            memory_size_mb: 0,
            swap_size_mb: 0,
            cpu_count: 0,
            storage_size_mb: 0,
            free_storage_size_mb: -1,
            ssh_port: 0,
            dbus_port: 0,
            storage_uuid: String::new(),
            running: false,
            headless: false,
        }
    }
}

/// Guest ports forwarded to the host under a well known rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservedPort {
    Ssh,
    DBus,
}

impl ReservedPort {
    pub fn rule_name(self) -> &'static str {
        match self {
            ReservedPort::Ssh => "guestssh",
            ReservedPort::DBus => "guestdbus",
        }
    }

    pub fn guest_port(self) -> u16 {
        match self {
            ReservedPort::Ssh => 22,
            ReservedPort::DBus => 777,
        }
    }
}

/// Display configuration applied to an emulator VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMode {
    pub width: u32,
    pub height: u32,
    pub device_model: String,
    pub landscape: bool,
    pub scale_down_factor: u32,
}

/// Asynchronous power control of named VMs
#[async_trait]
pub trait PowerControl: Send + Sync {
    /// Capabilities the backend supports for every VM
    fn features(&self) -> Features;

    async fn fetch_info(&self, vm: &str) -> Result<VmInfo>;

    async fn is_running(&self, vm: &str) -> Result<bool>;

    async fn start(&self, vm: &str, headless: bool) -> Result<()>;

    /// Request a shutdown and wait until the VM is off
    async fn stop(&self, vm: &str) -> Result<()>;

    async fn set_memory_size_mb(&self, vm: &str, size_mb: i64) -> Result<()>;

    async fn set_swap_size_mb(&self, vm: &str, size_mb: i64) -> Result<()>;

    async fn set_cpu_count(&self, vm: &str, count: i64) -> Result<()>;

    async fn set_storage_size_mb(&self, vm: &str, size_mb: i64) -> Result<()>;

    async fn set_reserved_port(&self, vm: &str, which: ReservedPort, port: u16) -> Result<()>;

    async fn set_video_mode(&self, vm: &str, mode: &VideoMode) -> Result<()>;
}
