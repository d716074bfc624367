//! Build targets reported by a build engine
//!
//! A [`BuildTargetDump`] is the raw probe data the engine reports for a
//! target. [`BuildTargetData`] is what the host derives from it: where its
//! sysroot and tool wrappers live, its snapshot flags and its validation
//! suites.

use crate::error::{Error, Result};
use crate::settings::SettingsMap;
use serde::{Deserialize, Serialize};
use std::ops::BitOr;
use std::path::{Path, PathBuf};

/// Suffix of the snapshot used when none is named explicitly
pub const DEFAULT_SNAPSHOT_SUFFIX: &str = "default";
/// Marks snapshots allocated from a pool
pub const POOLED_SNAPSHOT_INFIX: &str = ".pool.";
pub const DEFAULT_DEBUGGER: &str = "gdb";

/// Version of the targets document this build understands
pub const TARGETS_DOCUMENT_VERSION: i64 = 4;
pub const TARGETS_DOCUMENT: &str = "targets.json";

/// Raw data probed from a build target inside the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BuildTargetDump {
    pub name: String,
    pub origin: String,
    pub gcc_dump_machine: String,
    pub gcc_dump_macros: String,
    pub gcc_dump_includes: String,
    pub gcc_dump_install_dir: String,
    pub qmake_query: String,
    pub cmake_capabilities: String,
    pub cmake_version: String,
    pub rpm_validation_suites: String,
}

impl BuildTargetDump {
    pub fn to_map(&self) -> Result<SettingsMap> {
        SettingsMap::from_value(serde_json::to_value(self)?)
    }

    pub fn from_map(map: SettingsMap) -> Result<Self> {
        let dump: Self = serde_json::from_value(map.into_value())?;
        if dump.name.is_empty() {
            return Err(Error::Corruption("build target without a name".to_string()));
        }
        Ok(dump)
    }
}

/// Snapshot related properties of a target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetFlags(u8);

impl TargetFlags {
    pub const NONE: Self = Self(0);
    pub const SNAPSHOT: Self = Self(1 << 0);
    pub const DEFAULT_SNAPSHOT: Self = Self(1 << 1);
    pub const POOLED_SNAPSHOT: Self = Self(1 << 2);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TargetFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationSuite {
    pub id: String,
    pub essential: bool,
    /// Empty when the suite has no website
    pub website: String,
    pub name: String,
}

/// Configuration the host derives from a [`BuildTargetDump`]
#[derive(Debug, Clone)]
pub struct BuildTargetData {
    pub name: String,
    pub origin: String,
    pub flags: TargetFlags,
    pub machine: String,
    pub sysroot: PathBuf,
    pub tools_path: PathBuf,
    pub gdb: PathBuf,
    pub validation_suites: Vec<ValidationSuite>,
}

// The machine triplet is probe data, so it does not take part in matching
impl PartialEq for BuildTargetData {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.origin == other.origin
            && self.sysroot == other.sysroot
            && self.tools_path == other.tools_path
            && self.gdb == other.gdb
            && self.validation_suites == other.validation_suites
    }
}

impl BuildTargetData {
    pub fn is_snapshot(&self) -> bool {
        self.flags.contains(TargetFlags::SNAPSHOT)
    }

    /// Part of the name following `<origin>.`, empty for non-snapshots
    pub fn snapshot_suffix(&self) -> &str {
        if !self.is_snapshot() {
            return "";
        }
        self.name.get(self.origin.len() + 1..).unwrap_or_default()
    }
}

/// Where the targets of one engine live on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLayout {
    /// Shared targets directory; each sysroot is a subdirectory
    pub targets_dir: PathBuf,
    /// Tool wrappers directory of this engine
    pub tools_dir: PathBuf,
}

impl TargetLayout {
    /// `tools_root/<vm name>` with `:` replaced, as it is not allowed everywhere
    pub fn new(targets_dir: &Path, tools_root: &Path, vm_name: &str) -> Self {
        Self {
            targets_dir: targets_dir.to_path_buf(),
            tools_dir: tools_root.join(vm_name.replace(':', "_")),
        }
    }

    pub fn sysroot(&self, target: &str) -> PathBuf {
        self.targets_dir.join(target)
    }

    pub fn tools_path(&self, target: &str) -> PathBuf {
        self.tools_dir.join(target)
    }

    pub fn derive(&self, dump: &BuildTargetDump) -> BuildTargetData {
        let mut flags = TargetFlags::NONE;
        if !dump.origin.is_empty() {
            flags = flags | TargetFlags::SNAPSHOT;
            let suffix = dump.name.get(dump.origin.len() + 1..).unwrap_or_default();
            if suffix == DEFAULT_SNAPSHOT_SUFFIX {
                flags = flags | TargetFlags::DEFAULT_SNAPSHOT;
            }
            if suffix.contains(POOLED_SNAPSHOT_INFIX) {
                flags = flags | TargetFlags::POOLED_SNAPSHOT;
            }
        }

        BuildTargetData {
            name: dump.name.clone(),
            origin: dump.origin.clone(),
            flags,
            machine: dump.gcc_dump_machine.trim().to_string(),
            sysroot: self.sysroot(&dump.name),
            tools_path: self.tools_path(&dump.name),
            gdb: PathBuf::from(DEFAULT_DEBUGGER),
            validation_suites: parse_validation_suites(&dump.rpm_validation_suites),
        }
    }
}

/// Drop targets that cannot be trusted
///
/// A target listed as another target's origin must not be a snapshot leaf
/// at the same time, and a snapshot must be named `<origin>.<suffix>`.
pub fn sanitize(targets: Vec<BuildTargetDump>) -> Vec<BuildTargetDump> {
    let origins: Vec<String> = targets.iter().map(|t| t.origin.clone()).collect();
    targets
        .into_iter()
        .filter(|target| {
            if origins.contains(&target.name) {
                log::debug!("Ignoring build target with snapshots: {}", target.name);
                return false;
            }
            if !target.origin.is_empty() {
                let well_named = target
                    .name
                    .strip_prefix(&target.origin)
                    .and_then(|rest| rest.strip_prefix('.'))
                    .is_some_and(|suffix| !suffix.is_empty());
                if !well_named {
                    log::debug!("Ignoring badly named build target snapshot: {}", target.name);
                    return false;
                }
            }
            true
        })
        .collect()
}

/// Parse `id Essential|Optional website|- name` lines
///
/// Parsing stops at the first malformed line.
pub fn parse_validation_suites(listing: &str) -> Vec<ValidationSuite> {
    let mut suites = Vec::new();
    for line in listing.lines() {
        let mut fields = line.split(' ').filter(|f| !f.is_empty());
        let (Some(id), Some(kind), Some(website)) = (fields.next(), fields.next(), fields.next())
        else {
            log::warn!(
                "Error parsing listing of RPM validation suites: The corrupted line is: {line}"
            );
            break;
        };
        let name: Vec<&str> = fields.collect();
        suites.push(ValidationSuite {
            id: id.to_string(),
            essential: kind.eq_ignore_ascii_case("essential"),
            website: if website == "-" {
                String::new()
            } else {
                website.to_string()
            },
            name: name.join(" "),
        });
    }
    suites
}

pub fn format_validation_suites(suites: &[ValidationSuite]) -> String {
    suites
        .iter()
        .map(|suite| {
            format!(
                "{} {} {} {}\n",
                suite.id,
                if suite.essential { "Essential" } else { "Optional" },
                if suite.website.is_empty() {
                    "-"
                } else {
                    &suite.website
                },
                suite.name
            )
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct TargetsDocument {
    version: i64,
    #[serde(default)]
    targets: Vec<BuildTargetDump>,
}

/// Read the targets document of an engine
///
/// Returns `None`, with a warning, when the document is missing, unreadable
/// or of another version.
pub fn read_targets_document(path: &Path) -> Option<Vec<BuildTargetDump>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("Cannot read {}: {e}", path.display());
            return None;
        }
    };
    let document: TargetsDocument = match serde_json::from_str(&content) {
        Ok(document) => document,
        Err(e) => {
            log::warn!("Error reading {}: {e}", path.display());
            return None;
        }
    };
    if document.version != TARGETS_DOCUMENT_VERSION {
        log::warn!(
            "Ignoring {} of unsupported version {}",
            path.display(),
            document.version
        );
        return None;
    }
    Some(document.targets)
}
