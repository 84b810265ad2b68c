//! Synchronous host process fallback.
//!
//! Environments with direct process-spawn access can route a tool invocation
//! to a real executable instead of the sandbox. The envelope never signals
//! failure through `ok`: spawn errors are converted to a nonzero exit code
//! with the message on stderr, so callers only ever branch on `exitCode`.

use std::io::Write;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

/// Result envelope of a host tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnResult {
    /// Always true; failures are reported through `exit_code`.
    pub ok: bool,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Process exit code; 127 when the tool could not be spawned.
    pub exit_code: i32,
}

fn failure(message: String) -> SpawnResult {
    SpawnResult {
        ok: true,
        stdout: String::new(),
        stderr: message,
        exit_code: 127,
    }
}

fn encode(result: &SpawnResult) -> String {
    serde_json::to_string(result).unwrap_or_else(|_| {
        r#"{"ok":true,"stdout":"","stderr":"spawn result failed to encode","exitCode":127}"#
            .to_string()
    })
}

/// Run a host executable with the given JSON-encoded argument array and
/// stdin text, returning the JSON `{ok, stdout, stderr, exitCode}` envelope.
pub fn run_host_tool(name: &str, args_json: &str, stdin: &str) -> String {
    let args: Vec<String> = match serde_json::from_str(args_json) {
        Ok(args) => args,
        Err(error) => return encode(&failure(format!("malformed argument array: {error}"))),
    };

    let spawned = Command::new(name)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(error) => return encode(&failure(format!("failed to spawn {name}: {error}"))),
    };

    if let Some(mut pipe) = child.stdin.take()
        && let Err(error) = pipe.write_all(stdin.as_bytes())
    {
        let _ = child.kill();
        return encode(&failure(format!("failed to write stdin: {error}")));
    }

    match child.wait_with_output() {
        Ok(output) => encode(&SpawnResult {
            ok: true,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        }),
        Err(error) => encode(&failure(format!("failed to wait for {name}: {error}"))),
    }
}
