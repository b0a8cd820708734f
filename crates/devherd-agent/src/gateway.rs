//! Fire-and-forget command dispatch.
//!
//! A successful dispatch only means the command was handed to the execution
//! service. No output, exit status or pid ever comes back.

use std::path::{Path, PathBuf};

use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("command gateway unreachable: {0}")]
    Unreachable(String),
    #[error("command gateway rejected dispatch: {0}")]
    Rejected(String),
}

#[async_trait::async_trait]
pub trait CommandGateway: Send + Sync {
    async fn dispatch(&self, command: &str, workdir: Option<&Path>) -> Result<(), DispatchError>;
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Runs `<shell> -c <command>` detached on the local host.
#[derive(Debug, Clone)]
pub struct ShellGateway {
    shell: String,
}

impl ShellGateway {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait::async_trait]
impl CommandGateway for ShellGateway {
    async fn dispatch(&self, command: &str, workdir: Option<&Path>) -> Result<(), DispatchError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }
        // Own process group: the dispatched command must outlive us and must not
        // receive our terminal's signals.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| DispatchError::Unreachable(format!("spawn {}: {e}", self.shell)))?;
        tracing::debug!(pid = ?child.id(), "shell command dispatched");

        // Reap only; the status is never surfaced.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }
}

const TERMUX_PKG: &str = "com.termux";
const RUN_COMMAND_SERVICE: &str = "com.termux.app.RunCommandService";
const ACTION_RUN_COMMAND: &str = "com.termux.RUN_COMMAND";
const EXTRA_COMMAND: &str = "com.termux.RUN_COMMAND_PATH";
const EXTRA_ARGUMENTS: &str = "com.termux.RUN_COMMAND_ARGUMENTS";
const EXTRA_WORKDIR: &str = "com.termux.RUN_COMMAND_WORKDIR";
const EXTRA_BACKGROUND: &str = "com.termux.RUN_COMMAND_BACKGROUND";
const TERMUX_BASH: &str = "/data/data/com.termux/files/usr/bin/bash";

/// Hands commands to the Termux RunCommandService through `am`.
#[derive(Debug, Clone)]
pub struct TermuxGateway {
    am: PathBuf,
}

impl Default for TermuxGateway {
    fn default() -> Self {
        Self {
            am: PathBuf::from("am"),
        }
    }
}

/// `--esa` splits on commas; literal commas must be escaped.
fn escape_esa(arg: &str) -> String {
    arg.replace(',', "\\,")
}

impl TermuxGateway {
    fn intent_args(verb: &str, command: &str, workdir: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            verb.to_string(),
            "-n".to_string(),
            format!("{TERMUX_PKG}/{RUN_COMMAND_SERVICE}"),
            "-a".to_string(),
            ACTION_RUN_COMMAND.to_string(),
            "--es".to_string(),
            EXTRA_COMMAND.to_string(),
            TERMUX_BASH.to_string(),
            "--esa".to_string(),
            EXTRA_ARGUMENTS.to_string(),
            format!("-c,{}", escape_esa(command)),
            "--ez".to_string(),
            EXTRA_BACKGROUND.to_string(),
            "true".to_string(),
        ];
        if let Some(dir) = workdir {
            args.push("--es".to_string());
            args.push(EXTRA_WORKDIR.to_string());
            args.push(dir.display().to_string());
        }
        args
    }

    async fn send(&self, verb: &str, command: &str, workdir: Option<&Path>) -> Result<(), String> {
        let out = Command::new(&self.am)
            .args(Self::intent_args(verb, command, workdir))
            .output()
            .await
            .map_err(|e| format!("{verb}: {e}"))?;
        let stderr = String::from_utf8_lossy(&out.stderr);
        if !out.status.success() || stderr.contains("Error") {
            let reason = stderr.lines().next().unwrap_or("failed").trim().to_string();
            return Err(format!("{verb}: {reason}"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CommandGateway for TermuxGateway {
    async fn dispatch(&self, command: &str, workdir: Option<&Path>) -> Result<(), DispatchError> {
        let first = match self
            .send("start-foreground-service", command, workdir)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        tracing::warn!(error = %first, "foreground service dispatch failed, retrying");
        match self.send("startservice", command, workdir).await {
            Ok(()) => Ok(()),
            Err(second) => Err(DispatchError::Rejected(format!("{first} | {second}"))),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn termux_intent_carries_command_and_workdir() {
        let args = TermuxGateway::intent_args("startservice", "echo a,b", Some(Path::new("/w")));
        assert_eq!(args[0], "startservice");
        assert!(args.contains(&"-c,echo a\\,b".to_string()));
        assert_eq!(args[args.len() - 1], "/w");
        assert!(args.contains(&format!("{TERMUX_PKG}/{RUN_COMMAND_SERVICE}")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_gateway_runs_detached_command() {
        let marker = std::env::temp_dir().join(format!("devherd-gw-{}", uuid::Uuid::new_v4()));
        let gw = ShellGateway::new("sh");
        gw.dispatch(&format!("echo ok > {}", shell_quote(&marker.display().to_string())), None)
            .await
            .unwrap();

        let mut found = false;
        for _ in 0..50 {
            if tokio::fs::read_to_string(&marker).await.is_ok_and(|s| s.trim() == "ok") {
                found = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let _ = tokio::fs::remove_file(&marker).await;
        assert!(found);
    }

    #[tokio::test]
    async fn shell_gateway_reports_missing_shell() {
        let gw = ShellGateway::new("/nonexistent/devherd-shell");
        let err = gw.dispatch("true", None).await.unwrap_err();
        assert!(matches!(err, DispatchError::Unreachable(_)));
    }
}
