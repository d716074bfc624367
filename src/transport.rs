//! Remote command execution inside a running VM

use crate::runner::{self, Captured};
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;

/// Executes commands inside a VM and captures their output
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn exec(&self, command: &[String]) -> Result<Captured>;
}

/// Connection parameters of an ssh reachable VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshExec {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub private_key: Option<PathBuf>,
    pub timeout_secs: u32,
}

impl SshExec {
    /// Arguments passed to the `ssh` client
    pub fn ssh_args(&self, command: &[String]) -> Vec<String> {
        let mut args = runner::args([
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
        ]);
        args.push("-o".to_string());
        args.push(format!("ConnectTimeout={}", self.timeout_secs));
        args.push("-p".to_string());
        args.push(self.port.to_string());
        if let Some(key) = &self.private_key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{}", self.user, self.host));
        args.push("--".to_string());
        args.push(
            command
                .iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" "),
        );
        args
    }
}

#[async_trait]
impl RemoteExec for SshExec {
    async fn exec(&self, command: &[String]) -> Result<Captured> {
        runner::run_output("ssh", &self.ssh_args(command), None).await
    }
}

/// Quote `arg` for a POSIX shell
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("make"), "make");
        assert_eq!(shell_quote("-j4"), "-j4");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_ssh_args() {
        let ssh = SshExec {
            host: "localhost".to_string(),
            user: "mersdk".to_string(),
            port: 2222,
            private_key: Some(PathBuf::from("/keys/mersdk")),
            timeout_secs: 30,
        };
        let args = ssh.ssh_args(&runner::args(["echo", "hello world"]));

        let tail: Vec<&str> = args.iter().rev().take(3).map(String::as_str).collect();
        assert_eq!(tail, vec!["echo 'hello world'", "--", "mersdk@localhost"]);
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/keys/mersdk"));
        assert!(args.contains(&"ConnectTimeout=30".to_string()));
    }
}
