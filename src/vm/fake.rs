//! In-memory backend recording every mutation

use super::backend::{PowerControl, ReservedPort, VideoMode, VmInfo};
use super::Features;
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct State {
    running: bool,
    info: VmInfo,
    calls: Vec<String>,
    failing: Vec<String>,
}

pub struct FakePowerControl {
    features: Features,
    state: Mutex<State>,
}

impl FakePowerControl {
    pub fn new(running: bool) -> Self {
        Self::with_features(running, super::vbox::VBoxManage::static_features())
    }

    pub fn with_features(running: bool, features: Features) -> Self {
        Self {
            features,
            state: Mutex::new(State {
                running,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn running(&self) -> bool {
        self.state().running
    }

    /// Mutations performed so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn set_info(&self, info: VmInfo) {
        self.state().info = info;
    }

    /// Make every call whose record starts with `prefix` fail
    pub fn fail_on(&self, prefix: &str) {
        self.state().failing.push(prefix.to_string());
    }

    fn record(&self, call: String) -> Result<()> {
        let mut state = self.state();
        if state.failing.iter().any(|p| call.starts_with(p.as_str())) {
            bail!("{call} refused");
        }
        state.calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl PowerControl for FakePowerControl {
    fn features(&self) -> Features {
        self.features
    }

    async fn fetch_info(&self, _vm: &str) -> Result<VmInfo> {
        let state = self.state();
        Ok(VmInfo {
            running: state.running,
            ..state.info.clone()
        })
    }

    async fn is_running(&self, _vm: &str) -> Result<bool> {
        Ok(self.running())
    }

    async fn start(&self, _vm: &str, headless: bool) -> Result<()> {
        self.record(if headless { "start headless" } else { "start" }.to_string())?;
        self.state().running = true;
        Ok(())
    }

    async fn stop(&self, _vm: &str) -> Result<()> {
        self.record("stop".to_string())?;
        self.state().running = false;
        Ok(())
    }

    async fn set_memory_size_mb(&self, _vm: &str, size_mb: i64) -> Result<()> {
        self.record(format!("memory {size_mb}"))?;
        self.state().info.memory_size_mb = size_mb;
        Ok(())
    }

    async fn set_swap_size_mb(&self, _vm: &str, size_mb: i64) -> Result<()> {
        self.record(format!("swap {size_mb}"))?;
        self.state().info.swap_size_mb = size_mb;
        Ok(())
    }

    async fn set_cpu_count(&self, _vm: &str, count: i64) -> Result<()> {
        self.record(format!("cpus {count}"))?;
        self.state().info.cpu_count = count;
        Ok(())
    }

    async fn set_storage_size_mb(&self, _vm: &str, size_mb: i64) -> Result<()> {
        self.record(format!("storage {size_mb}"))?;
        self.state().info.storage_size_mb = size_mb;
        Ok(())
    }

    async fn set_reserved_port(&self, _vm: &str, which: ReservedPort, port: u16) -> Result<()> {
        self.record(format!("{} {port}", which.rule_name()))?;
        let mut state = self.state();
        match which {
            ReservedPort::Ssh => state.info.ssh_port = port,
            ReservedPort::DBus => state.info.dbus_port = port,
        }
        Ok(())
    }

    async fn set_video_mode(&self, _vm: &str, mode: &VideoMode) -> Result<()> {
        self.record(format!(
            "video {}x{} {} {}",
            mode.width,
            mode.height,
            if mode.landscape { "landscape" } else { "portrait" },
            mode.scale_down_factor
        ))
    }
}
