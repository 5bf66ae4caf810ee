/// Transport: runs a built protocol call through the `wsman` client.
use std::fmt;
use std::path::PathBuf;
use std::process::Command;

use crate::error::{ReciteError, Result};
use crate::utils::mask_secret;

/// A fully assembled client invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Payload file passed with `-J`, if any.
    pub payload: Option<PathBuf>,
    secret: String,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: Vec<String>, secret: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            payload: None,
            secret: secret.into(),
        }
    }

    pub fn with_payload(mut self, path: PathBuf) -> Self {
        self.payload = Some(path);
        self
    }

    /// Argument following `flag`, e.g. the host after `-h`.
    pub fn arg_after(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = shell_words::join(std::iter::once(&self.program).chain(self.args.iter()));
        write!(f, "{}", mask_secret(&line, &self.secret))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub output: String,
    pub exit_status: i32,
}

/// Executes invocations. The interpreter owns exactly one.
pub trait Transport {
    fn execute(&mut self, invocation: &Invocation) -> Result<CommandResult>;
}

/// Spawns the configured client program directly, without a shell.
#[derive(Debug, Default)]
pub struct WsmanTransport;

impl Transport for WsmanTransport {
    fn execute(&mut self, invocation: &Invocation) -> Result<CommandResult> {
        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .output()
            .map_err(|e| {
                ReciteError::Transport(format!("Failed to run '{}': {}", invocation.program, e))
            })?;

        let mut result = CommandResult {
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
            exit_status: output.status.code().unwrap_or(-1),
        };
        result
            .output
            .push_str(&String::from_utf8_lossy(&output.stderr));

        log::debug!(
            "{} exited with {} ({} bytes)",
            invocation.program,
            result.exit_status,
            result.output.len()
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_masks_password() {
        let invocation = Invocation::new(
            "wsman",
            ["enumerate", "http://x/y", "-h", "10.0.0.1", "-u", "root", "-p", "s3cr3t pw"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            "s3cr3t pw",
        );
        let shown = invocation.to_string();

        assert!(!shown.contains("s3cr3t"));
        assert!(shown.contains("-p '******'"));
        assert_eq!(invocation.arg_after("-h"), Some("10.0.0.1"));
    }

    #[cfg(unix)]
    #[test]
    fn subprocess_output_is_captured() {
        let invocation = Invocation::new(
            "sh",
            vec!["-c".to_string(), "echo out; echo err 1>&2; exit 3".to_string()],
            "",
        );
        let result = WsmanTransport.execute(&invocation).unwrap();

        assert_eq!(result.output, "out\nerr\n");
        assert_eq!(result.exit_status, 3);
    }

    #[test]
    fn missing_program_is_a_transport_error() {
        let invocation = Invocation::new("/nonexistent/wsman", vec![], "");
        assert!(matches!(
            WsmanTransport.execute(&invocation),
            Err(ReciteError::Transport(_))
        ));
    }
}
