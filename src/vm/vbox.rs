//! VirtualBox backend driven through `VBoxManage`

use super::backend::{PowerControl, ReservedPort, VideoMode, VmInfo};
use super::Features;
use crate::runner;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

const GUEST_PROPERTIES_PATTERN: &str = "/SailfishSDK/*";
const SWAP_SIZE_PROPERTY: &str = "/SailfishSDK/VM/Swap/SizeMb";
const FREE_STORAGE_PROPERTY: &str = "/SailfishSDK/VM/Storage/FreeSizeMb";
const STOP_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct VBoxManage {
    program: String,
}

impl VBoxManage {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Capabilities of every VirtualBox VM
    pub fn static_features() -> Features {
        Features::LIMIT_MEMORY_SIZE
            | Features::LIMIT_CPU_COUNT
            | Features::GROW_STORAGE_SIZE
            | Features::OPTIONAL_HEADLESS
            | Features::SNAPSHOTS
            | Features::SWAP_MEMORY
            | Features::RESERVE_STORAGE_SIZE
    }

    async fn run(&self, args: Vec<String>) -> Result<String> {
        runner::run_capture(&self.program, &args).await
    }

    async fn set_extra_data(&self, vm: &str, key: &str, value: &str) -> Result<()> {
        self.run(runner::args(["setextradata", vm, key, value]))
            .await
            .map(drop)
    }
}

#[async_trait]
impl PowerControl for VBoxManage {
    fn features(&self) -> Features {
        Self::static_features()
    }

    async fn fetch_info(&self, vm: &str) -> Result<VmInfo> {
        let output = self
            .run(runner::args(["showvminfo", vm, "--machinereadable"]))
            .await
            .with_context(|| format!("Could not query VM {vm}"))?;
        let mut info = parse_machine_readable(&output);

        let properties = self
            .run(runner::args([
                "guestproperty",
                "enumerate",
                vm,
                "--patterns",
                GUEST_PROPERTIES_PATTERN,
            ]))
            .await?;
        let properties = parse_guest_properties(&properties);
        if let Some(swap) = properties.get(SWAP_SIZE_PROPERTY).and_then(|v| v.parse().ok()) {
            info.swap_size_mb = swap;
        }
        if let Some(free) = properties
            .get(FREE_STORAGE_PROPERTY)
            .and_then(|v| v.parse().ok())
        {
            info.free_storage_size_mb = free;
        }

        if !info.storage_uuid.is_empty() {
            let medium = self
                .run(runner::args(["showmediuminfo", "disk", &info.storage_uuid]))
                .await?;
            if let Some(capacity) = parse_medium_capacity(&medium) {
                info.storage_size_mb = capacity;
            }
        }

        Ok(info)
    }

    async fn is_running(&self, vm: &str) -> Result<bool> {
        let captured = runner::run_output(&self.program, &runner::args(["showvminfo", vm]), None)
            .await?;
        if !captured.success() {
            // Unknown VMs are simply not running
            return Ok(false);
        }
        Ok(session_from_info(&captured.stdout).is_some())
    }

    async fn start(&self, vm: &str, headless: bool) -> Result<()> {
        let mut args = runner::args(["startvm", vm]);
        if headless {
            args.extend(runner::args(["--type", "headless"]));
        }
        self.run(args).await.map(drop)
    }

    async fn stop(&self, vm: &str) -> Result<()> {
        self.run(runner::args(["controlvm", vm, "acpipowerbutton"]))
            .await?;

        let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
        while self.is_running(vm).await? {
            if tokio::time::Instant::now() >= deadline {
                bail!("VM {vm} did not power off within {}s", STOP_TIMEOUT.as_secs());
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        Ok(())
    }

    async fn set_memory_size_mb(&self, vm: &str, size_mb: i64) -> Result<()> {
        let size = size_mb.to_string();
        self.run(runner::args(["modifyvm", vm, "--memory", &size]))
            .await
            .map(drop)
    }

    async fn set_swap_size_mb(&self, vm: &str, size_mb: i64) -> Result<()> {
        let size = size_mb.to_string();
        self.run(runner::args([
            "guestproperty",
            "set",
            vm,
            SWAP_SIZE_PROPERTY,
            &size,
        ]))
        .await
        .map(drop)
    }

    async fn set_cpu_count(&self, vm: &str, count: i64) -> Result<()> {
        let count = count.to_string();
        self.run(runner::args(["modifyvm", vm, "--cpus", &count]))
            .await
            .map(drop)
    }

    async fn set_storage_size_mb(&self, vm: &str, size_mb: i64) -> Result<()> {
        let output = self
            .run(runner::args(["showvminfo", vm, "--machinereadable"]))
            .await?;
        let uuid = parse_machine_readable(&output).storage_uuid;
        if uuid.is_empty() {
            bail!("VM {vm} has no storage attached");
        }
        let size = size_mb.to_string();
        self.run(runner::args(["modifymedium", &uuid, "--resize", &size]))
            .await
            .map(drop)
    }

    async fn set_reserved_port(&self, vm: &str, which: ReservedPort, port: u16) -> Result<()> {
        let rule = forwarding_rule(which, port);
        self.run(runner::args([
            "modifyvm",
            vm,
            "--natpf1",
            "delete",
            which.rule_name(),
            "--natpf1",
            &rule,
        ]))
        .await
        .map(drop)
    }

    async fn set_video_mode(&self, vm: &str, mode: &VideoMode) -> Result<()> {
        let video_mode = format!("{}x{}x32", mode.width, mode.height);
        let hint = format!("{},{}", mode.width, mode.height);
        let orientation = if mode.landscape { "landscape" } else { "portrait" };
        let scale = mode.scale_down_factor.to_string();

        for (key, value) in [
            ("CustomVideoMode1", video_mode.as_str()),
            ("GUI/LastGuestSizeHint", hint.as_str()),
            ("GUI/AutoresizeGuest", "false"),
            ("SailfishSDK/DeviceModel", mode.device_model.as_str()),
            ("SailfishSDK/Orientation", orientation),
            ("SailfishSDK/Scale", scale.as_str()),
        ] {
            self.set_extra_data(vm, key, value).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Output parsing
// ============================================================================

/// NAT rule forwarding a host port on localhost to a reserved guest port
pub fn forwarding_rule(which: ReservedPort, port: u16) -> String {
    format!(
        "{},tcp,127.0.0.1,{port},,{}",
        which.rule_name(),
        which.guest_port()
    )
}

fn machine_readable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"^"?([^"=]+)"?=(.*)$"#).expect("valid regex"))
}

fn session_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // VirtualBox 4 says "type", 5 and later say "name"
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^Session (name|type):\s*(\w+)").expect("valid regex")
    })
}

fn guest_property_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^Name: +([^ ]+), +value: ([^ ]+), ").expect("valid regex"))
}

fn capacity_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Capacity:\s+(\d+) MBytes").expect("valid regex"))
}

/// Session kind from human readable `showvminfo` output, `None` if not running
pub fn session_from_info(output: &str) -> Option<String> {
    session_pattern()
        .captures(output)
        .map(|caps| caps[2].to_string())
}

/// Parse `showvminfo --machinereadable` output
pub fn parse_machine_readable(output: &str) -> VmInfo {
    let mut info = VmInfo::default();

    for line in output.lines() {
        let Some(caps) = machine_readable_pattern().captures(line.trim_end()) else {
            continue;
        };
        let key = &caps[1];
        let value = caps[2].trim_matches('"');

        match key {
            "memory" => {
                if let Ok(memory) = value.parse::<i64>()
                    && memory > 0
                {
                    info.memory_size_mb = memory;
                }
            }
            "cpus" => {
                if let Ok(cpus) = value.parse::<i64>()
                    && cpus > 0
                {
                    info.cpu_count = cpus;
                }
            }
            "VMState" => info.running = value == "running",
            "SessionName" | "SessionType" => info.headless = value == "headless",
            _ if key.starts_with("SATA-ImageUUID-") => {
                if !value.is_empty() && value != "none" {
                    info.storage_uuid = value.to_string();
                }
            }
            _ if key.starts_with("Forwarding(") => {
                // name,protocol,host ip,host port,guest ip,guest port
                let fields: Vec<&str> = value.split(',').collect();
                if fields.len() != 6 {
                    continue;
                }
                let Ok(port) = fields[3].parse::<u16>() else {
                    continue;
                };
                if fields[0].contains(ReservedPort::Ssh.rule_name()) {
                    info.ssh_port = port;
                } else if fields[0].contains(ReservedPort::DBus.rule_name()) {
                    info.dbus_port = port;
                }
            }
            _ => {}
        }
    }

    info
}

/// Parse `guestproperty enumerate` output into name/value pairs
pub fn parse_guest_properties(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| guest_property_pattern().captures(line))
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

/// Capacity in MB from `showmediuminfo` output
pub fn parse_medium_capacity(output: &str) -> Option<i64> {
    capacity_pattern()
        .captures(output)
        .and_then(|caps| caps[1].parse().ok())
}
