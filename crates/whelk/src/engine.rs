//! The opaque shell engine seam.
//!
//! The engine is an externally-compiled, synchronous interpreter; this crate
//! never looks inside it. [`ShellEngine`] is the single entry point: a pure
//! function from positional string arguments to one JSON result object. While
//! a call is in flight the engine may reach back into the host through the
//! bridges installed in [`crate::bridge`], and through nothing else.

use std::collections::HashMap;

use serde::Deserialize;

/// Filesystem layout installed by the engine before running a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMode {
    /// Install executable stub files for every builtin under `/bin`.
    Default,
    /// No implicit layout; the caller-provided files are all there is.
    Minimal,
}

impl LayoutMode {
    /// Wire representation of the layout mode.
    pub fn as_str(self) -> &'static str {
        match self {
            LayoutMode::Default => "default",
            LayoutMode::Minimal => "minimal",
        }
    }
}

/// One engine call, as positional string arguments.
///
/// The maps are pre-serialized JSON objects; the engine parses them itself.
#[derive(Debug, Clone)]
pub struct EngineInvocation {
    /// Script text to interpret.
    pub script: String,
    /// JSON-encoded environment map.
    pub env_json: String,
    /// JSON-encoded path→content map.
    pub files_json: String,
    /// JSON-encoded path→marker directory map.
    pub dirs_json: String,
    /// JSON-encoded path→target symlink map.
    pub links_json: String,
    /// JSON-encoded path→permission-string map.
    pub modes_json: String,
    /// Working directory for the script.
    pub cwd: String,
    /// JSON-encoded execution limits (see [`crate::ExecutionLimits`]).
    pub limits_json: String,
    /// Layout installed before the script runs.
    pub layout: LayoutMode,
}

/// The externally-compiled shell interpreter.
///
/// Implementations must be deterministic request/response: one invocation in,
/// one JSON result out, with host capabilities reached only through the
/// installed bridges. The call blocks until the script completes.
pub trait ShellEngine: Send + Sync {
    /// Run a script against the given state and return the result JSON.
    fn execute(&self, invocation: &EngineInvocation) -> String;
}

/// Parsed engine result. Every field is optional on the wire; accessors apply
/// the documented defaults so partial results never surface as panics.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineState {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Script exit code; absent means failure (1).
    pub exit_code: Option<i32>,
    /// Updated path→content map, replacing the previous one wholesale.
    pub files: Option<HashMap<String, String>>,
    /// Updated directory map.
    pub dirs: Option<HashMap<String, String>>,
    /// Updated symlink map.
    pub links: Option<HashMap<String, String>>,
    /// Updated permission map.
    pub modes: Option<HashMap<String, String>>,
    /// Environment as left by the script.
    pub env: Option<HashMap<String, String>>,
}

impl EngineState {
    /// Parse an engine result JSON string.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Exit code with the missing-field default applied.
    pub fn exit_code(&self) -> i32 {
        self.exit_code.unwrap_or(1)
    }
}

/// Command names built into the engine.
///
/// Drives the default layout's `/bin` stubs and is exposed for callers that
/// want to reason about name collisions with custom commands.
pub const DEFAULT_COMMAND_NAMES: &[&str] = &[
    "echo", "cat", "pwd", "ls", "mkdir", "rm", "cp", "mv", "touch", "find", "head", "tail", "wc",
    "awk", "jq", "true", "false", "rmdir", "stat", "file", "tree", "du", "chmod", "ln", "readlink",
    "diff", "cmp", "comm", "base64", "expr", "yq", "xan", "csvlook", "md5sum", "sha1sum",
    "sha256sum", "gzip", "gunzip", "zcat", "python3", "sqlite3", "export", "unset", "set", "shift",
    "exit", "return", "break", "continue", "read", "mapfile", "readarray", "test", "[", "[[",
    "printf", "eval", "source", ".", "local", "declare", "typeset", "let", ":", "type", "command",
    "basename", "dirname", "seq", "rev", "nl", "fold", "expand", "unexpand", "paste", "column",
    "join", "tr", "sort", "uniq", "cut", "tee", "sed", "grep", "egrep", "fgrep", "rg", "xargs",
    "date", "env", "printenv", "which", "whoami", "hostname", "help", "clear", "history", "tac",
    "od", "alias", "unalias", "bash", "sh", "time", "sleep", "timeout",
];

/// The engine's builtin command names as owned strings.
pub fn command_names() -> Vec<String> {
    DEFAULT_COMMAND_NAMES
        .iter()
        .map(|name| (*name).to_string())
        .collect()
}
