//! Host side tool wrappers of a build target
//!
//! IDEs and build systems on the host query compilers and qmake for their
//! configuration. Each target gets a directory with cached answers, patched
//! to point into the host copy of the sysroot, and small scripts forwarding
//! the actual tool invocations into the build engine.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::target::BuildTargetDump;

/// Exported by the wrappers so the forwarded command knows its target
pub const ENV_TARGET_TOOLS: &str = "ENGINECTL_TARGET_TOOLS";

pub const QMAKE_QUERY_CACHE: &str = "qmake.query";
pub const CMAKE_CAPABILITIES_CACHE: &str = "cmake.capabilities";
pub const CMAKE_VERSION_CACHE: &str = "cmake.version";
pub const GCC_DUMP_MACHINE_CACHE: &str = "gcc.dumpmachine";
pub const GCC_DUMP_MACROS_CACHE: &str = "gcc.dumpmacros";
pub const GCC_DUMP_INCLUDES_CACHE: &str = "gcc.dumpincludes";
pub const GCC_DUMP_INSTALL_DIR_CACHE: &str = "gcc.dumpinstalldir";

pub const SIMPLE_WRAPPERS: [&str; 4] = ["cmake", "qmake", "make", "gcc"];
pub const PKG_CONFIG_WRAPPER: &str = "pkg-config";

const PKG_CONFIG_LIB_DIRS: [&str; 3] = [
    "usr/lib64/pkgconfig",
    "usr/lib/pkgconfig",
    "usr/share/pkgconfig",
];

/// Create the wrappers of `dump` under `tools_path`
///
/// An existing directory is left alone. `program` is the binary the
/// wrappers forward to.
pub fn init(tools_path: &Path, sysroot: &Path, dump: &BuildTargetDump, program: &Path) -> Result<()> {
    if tools_path.exists() {
        log::debug!(
            "Not overwriting existing tools under {}",
            tools_path.display()
        );
        return Ok(());
    }
    fs::create_dir_all(tools_path)
        .with_context(|| format!("Failed to create {}", tools_path.display()))?;

    let sysroot = sysroot.display().to_string();
    let rooted_qmake_query = dump.qmake_query.replace(":/", &format!(":{sysroot}/"));
    let rooted_includes = dump.gcc_dump_includes.replace(" /", &format!(" {sysroot}/"));
    let rooted_install_dir = dump.gcc_dump_install_dir.replace(" /", &format!(" {sysroot}/"));

    for (name, content) in [
        (QMAKE_QUERY_CACHE, rooted_qmake_query.as_str()),
        (CMAKE_CAPABILITIES_CACHE, dump.cmake_capabilities.as_str()),
        (CMAKE_VERSION_CACHE, dump.cmake_version.as_str()),
        (GCC_DUMP_MACHINE_CACHE, dump.gcc_dump_machine.as_str()),
        (GCC_DUMP_MACROS_CACHE, dump.gcc_dump_macros.as_str()),
        (GCC_DUMP_INCLUDES_CACHE, rooted_includes.as_str()),
        (GCC_DUMP_INSTALL_DIR_CACHE, rooted_install_dir.as_str()),
    ] {
        write_cache_file(&tools_path.join(name), content)?;
    }

    for command in SIMPLE_WRAPPERS {
        write_script(
            &tools_path.join(command),
            &simple_wrapper(tools_path, program, command),
        )?;
    }

    write_script(
        &tools_path.join(PKG_CONFIG_WRAPPER),
        &pkg_config_wrapper(Path::new(&sysroot)),
    )?;

    Ok(())
}

/// Remove the wrappers directory of a target
pub fn deinit(tools_path: &Path) -> Result<()> {
    if !tools_path.exists() {
        return Ok(());
    }
    fs::remove_dir_all(tools_path)
        .with_context(|| format!("Failed to remove {}", tools_path.display()))
}

fn write_cache_file(path: &Path, content: &str) -> Result<()> {
    let mut content = content.to_string();
    if !content.ends_with('\n') {
        content.push('\n');
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

fn write_script(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    make_executable(path)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    fs::set_permissions(path, permissions)
        .with_context(|| format!("Failed to make {} executable", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

fn simple_wrapper(tools_path: &Path, program: &Path, command: &str) -> String {
    format!(
        r#"#!/bin/sh
export {ENV_TARGET_TOOLS}="{tools}"
exec "{program}" engine exec {command} "$@"
"#,
        tools = tools_path.display(),
        program = program.display(),
    )
}

fn pkg_config_wrapper(sysroot: &Path) -> String {
    let lib_dirs: Vec<String> = PKG_CONFIG_LIB_DIRS
        .iter()
        .map(|dir| sysroot.join(dir))
        .filter(|dir| dir.exists())
        .map(|dir| dir.display().to_string())
        .collect();

    format!(
        r#"#!/bin/sh
export PKG_CONFIG_DIR=
export PKG_CONFIG_LIBDIR="{lib_dirs}"
export PKG_CONFIG_SYSROOT_DIR="{sysroot}"
# qmake discards stderr, so there is no point in reporting anything here
real=$(which -a pkg-config |sed -n 2p)
exec ${{real?}} "$@"
"#,
        lib_dirs = lib_dirs.join(":"),
        sysroot = sysroot.display(),
    )
}
