use anyhow::{Context, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

fn describe(cmd: &str, args: &[String]) -> String {
    if args.is_empty() {
        cmd.to_string()
    } else {
        format!("{} {}", cmd, args.join(" "))
    }
}

/// Run a command and capture its output, whatever the exit status
pub async fn run_output(cmd: &str, args: &[String], stdin: Option<&str>) -> Result<Captured> {
    log::trace!("Running {}", describe(cmd, args));

    let mut child = Command::new(cmd)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to execute: {}", describe(cmd, args)))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
        drop(pipe);
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("Failed to wait for: {}", describe(cmd, args)))?;

    Ok(Captured {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command and capture stdout, failing on a non-zero exit status
pub async fn run_capture(cmd: &str, args: &[String]) -> Result<String> {
    let captured = run_output(cmd, args, None).await?;
    if captured.success() {
        Ok(captured.stdout)
    } else {
        anyhow::bail!(
            "Command failed: {}: {}",
            describe(cmd, args),
            captured.stderr.trim()
        )
    }
}

/// Convert string slices into owned arguments
pub fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}
