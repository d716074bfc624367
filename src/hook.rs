//! Optional script hook used to post-process or veto command arguments
//!
//! The hook is an external program. It is invoked as `<program> <function>`
//! with a JSON array of arguments on stdin and must print a JSON value on
//! stdout. Empty output means the program does not implement the function.

use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::io::Write;
use std::process::{Command, Stdio};

/// Checks the shape of a value returned by a hook function
pub type Validator = fn(&Value) -> std::result::Result<(), String>;

pub mod validators {
    use serde_json::Value;

    pub fn string_array(value: &Value) -> Result<(), String> {
        match value.as_array() {
            Some(items) if items.iter().all(Value::is_string) => Ok(()),
            _ => Err("Not an array of strings".to_string()),
        }
    }

    pub fn bool_string_pair(value: &Value) -> Result<(), String> {
        match value.as_array() {
            Some(items) if items.len() >= 2 && items[0].is_boolean() && items[1].is_string() => {
                Ok(())
            }
            _ => Err("Not an array [bool, string]".to_string()),
        }
    }
}

pub trait ScriptHook {
    /// Call `function`; `None` when the hook does not implement it
    fn call(&self, function: &str, args: &[Value], validator: Validator) -> Result<Option<Value>>;
}

/// Hook that implements nothing
pub struct NoHook;

impl ScriptHook for NoHook {
    fn call(&self, _function: &str, _args: &[Value], _validator: Validator) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// Hook implemented by an external program
pub struct CommandHook {
    program: String,
}

impl CommandHook {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ScriptHook for CommandHook {
    fn call(&self, function: &str, args: &[Value], validator: Validator) -> Result<Option<Value>> {
        let input = serde_json::to_string(args)?;

        let mut child = Command::new(&self.program)
            .arg(function)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to execute hook: {}", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(input.as_bytes()) {
                // The program may not care about its arguments
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
                _ => {}
            }
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for hook: {}", self.program))?;
        if !output.status.success() {
            bail!("Hook function {function} failed with {}", output.status);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(None);
        }

        let value: Value = serde_json::from_str(stdout.trim())
            .with_context(|| format!("Hook function {function} returned invalid JSON"))?;
        if let Err(e) = validator(&value) {
            log::error!("Hook function {function}: unexpected return value: {e}");
            bail!("Internal error");
        }
        Ok(Some(value))
    }
}

/// Let the hook rewrite a command line
pub fn filter_command_line(hook: &dyn ScriptHook, command: Vec<String>) -> Result<Vec<String>> {
    let args = [Value::from(command.clone())];
    let Some(result) = hook.call("filterCommandLine", &args, validators::string_array)? else {
        return Ok(command);
    };

    let filtered: Vec<String> = result
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    log::debug!("Original command line: {command:?}");
    log::debug!("Filtered command line: {filtered:?}");
    Ok(filtered)
}

/// Ask the hook whether a batch of assignments may proceed
///
/// Returns the veto reason when the hook refuses.
pub fn before_set(
    hook: &dyn ScriptHook,
    scope: &str,
    assignments: &[(String, String)],
) -> Result<Option<String>> {
    let pairs: Vec<Value> = assignments
        .iter()
        .map(|(name, value)| Value::from(vec![name.clone(), value.clone()]))
        .collect();
    let args = [Value::from(scope), Value::from(pairs)];

    let Some(result) = hook.call("beforeSet", &args, validators::bool_string_pair)? else {
        return Ok(None);
    };
    let allowed = result[0].as_bool().unwrap_or(true);
    let reason = result[1].as_str().unwrap_or_default().to_string();
    Ok(if allowed { None } else { Some(reason) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Canned(Value);

    impl ScriptHook for Canned {
        fn call(&self, _function: &str, _args: &[Value], validator: Validator) -> Result<Option<Value>> {
            validator(&self.0).map_err(anyhow::Error::msg)?;
            Ok(Some(self.0.clone()))
        }
    }

    #[test]
    fn test_validators() {
        assert!(validators::string_array(&json!(["a", "b"])).is_ok());
        assert!(validators::string_array(&json!(["a", 1])).is_err());
        assert!(validators::bool_string_pair(&json!([false, "no"])).is_ok());
        assert!(validators::bool_string_pair(&json!([false])).is_err());
        assert!(validators::bool_string_pair(&json!(["x", "y"])).is_err());
    }

    #[test]
    fn test_filter_without_hook_keeps_command() {
        let command = vec!["make".to_string(), "-j4".to_string()];
        assert_eq!(filter_command_line(&NoHook, command.clone()).unwrap(), command);
    }

    #[test]
    fn test_filter_with_hook() {
        let hook = Canned(json!(["make", "-j8"]));
        let filtered = filter_command_line(&hook, vec!["make".to_string()]).unwrap();
        assert_eq!(filtered, vec!["make", "-j8"]);
    }

    #[test]
    fn test_before_set_veto() {
        let hook = Canned(json!([false, "Locked by policy"]));
        let assignments = vec![("vm.memory-size".to_string(), "4096".to_string())];
        assert_eq!(
            before_set(&hook, "engine", &assignments).unwrap().as_deref(),
            Some("Locked by policy")
        );

        let hook = Canned(json!([true, ""]));
        assert_eq!(before_set(&hook, "engine", &assignments).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_hook_round_trip() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::TempDir::new().unwrap();
        let script = temp.path().join("hook");
        std::fs::write(
            &script,
            "#!/bin/sh\ncase \"$1\" in\n  filterCommandLine) cat ;;\n  *) ;;\nesac\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let hook = CommandHook::new(script.display().to_string());
        let result = hook
            .call("filterCommandLine", &[json!("x")], |_| Ok(()))
            .unwrap();
        assert_eq!(result, Some(json!(["x"])));
        assert_eq!(hook.call("unknown", &[], |_| Ok(())).unwrap(), None);
    }
}
