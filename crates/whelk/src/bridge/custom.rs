//! The custom-command bridge.
//!
//! When the engine meets a prelude-delegated custom command it calls back
//! here with the command name, arguments, and its current view of the world.
//! The command runs against a throwaway filesystem view seeded from the
//! request's files; `handled: false` with exit 127 distinguishes "not ours"
//! from "ours but failed".

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::block_on::wait_for;
use crate::bridge::JsonBridge;
use crate::command::{CommandContext, CommandOutput, CommandRegistry, ScriptExecutor};
use crate::engine::{EngineInvocation, EngineState, LayoutMode, ShellEngine};
use crate::fs::{DirEntry, FileKind, FileStat, FsError, RmOptions, VirtualFs};
use crate::path;
use crate::session::ExecOptions;

/// A custom-command invocation decoded from the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CustomRequest {
    /// Command name being invoked.
    pub name: String,
    /// Arguments after the name.
    pub args: Vec<String>,
    /// Standard input text.
    pub stdin: String,
    /// Working directory at the call site.
    pub cwd: String,
    /// Environment at the call site.
    pub env: HashMap<String, String>,
    /// The engine's current file map.
    pub files: HashMap<String, String>,
}

/// A custom-command result encoded for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CustomResponse {
    /// Whether the name resolved to a registered command.
    pub handled: bool,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code; 127 when the name is unknown.
    pub exit_code: i32,
    /// Host-side failure message, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The file map as mutated by the command, when it ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<HashMap<String, String>>,
}

impl Default for CustomResponse {
    fn default() -> Self {
        Self {
            handled: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 1,
            error: None,
            files: None,
        }
    }
}

impl CustomResponse {
    fn unknown() -> Self {
        Self {
            exit_code: 127,
            ..Default::default()
        }
    }

    fn rejected(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

type SharedFiles = Arc<Mutex<HashMap<String, String>>>;

fn lock_files(files: &SharedFiles) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
    files.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Flat, files-only filesystem view for one bridge invocation.
///
/// Directories are inferred from path prefixes; `mkdir` and `chmod` are
/// accepted and ignored. Mutations land in the shared map that is handed
/// back to the engine in the response.
#[derive(Debug, Clone)]
struct ScratchFs {
    files: SharedFiles,
    cwd: String,
}

impl ScratchFs {
    fn normalize(&self, raw: &str) -> String {
        path::normalize(raw, &self.cwd)
    }
}

impl VirtualFs for ScratchFs {
    fn read_file(&self, file_path: &str) -> Result<String, FsError> {
        let normalized = self.normalize(file_path);
        lock_files(&self.files)
            .get(&normalized)
            .cloned()
            .ok_or(FsError::NotFound(normalized))
    }

    fn write_file(&self, file_path: &str, content: &str) {
        let normalized = self.normalize(file_path);
        lock_files(&self.files).insert(normalized, content.to_string());
    }

    fn append_file(&self, file_path: &str, content: &str) {
        let normalized = self.normalize(file_path);
        lock_files(&self.files)
            .entry(normalized)
            .or_default()
            .push_str(content);
    }

    fn exists(&self, file_path: &str) -> bool {
        let normalized = self.normalize(file_path);
        let files = lock_files(&self.files);
        files.contains_key(&normalized)
            || files
                .keys()
                .any(|candidate| candidate.starts_with(&format!("{normalized}/")))
    }

    fn stat(&self, file_path: &str) -> Result<FileStat, FsError> {
        let normalized = self.normalize(file_path);
        let files = lock_files(&self.files);
        if let Some(content) = files.get(&normalized) {
            return Ok(FileStat {
                kind: FileKind::File,
                size: content.len() as u64,
                mode: 0o644,
                mtime: 0,
            });
        }
        let prefix = format!("{normalized}/");
        if files.keys().any(|candidate| candidate.starts_with(&prefix)) {
            return Ok(FileStat {
                kind: FileKind::Directory,
                size: 0,
                mode: 0o755,
                mtime: 0,
            });
        }
        Err(FsError::NotFound(normalized))
    }

    fn read_dir(&self, dir_path: &str) -> Vec<DirEntry> {
        let normalized = self.normalize(dir_path);
        let files = lock_files(&self.files);
        path::list_children(files.keys().map(String::as_str), &normalized)
            .into_iter()
            .map(|name| DirEntry {
                name,
                kind: FileKind::File,
            })
            .collect()
    }

    fn mkdir(&self, _dir_path: &str) {
        // Directories are inferred from file paths in this view.
    }

    fn mkdir_all(&self, _dir_path: &str) {}

    fn rm(&self, file_path: &str, options: RmOptions) -> Result<(), FsError> {
        let normalized = self.normalize(file_path);
        let mut files = lock_files(&self.files);
        if options.recursive {
            let prefix = format!("{normalized}/");
            files.retain(|candidate, _| candidate != &normalized && !candidate.starts_with(&prefix));
        } else {
            files.remove(&normalized);
        }
        Ok(())
    }

    fn cp(&self, src: &str, dst: &str) -> Result<(), FsError> {
        let src_path = self.normalize(src);
        let dst_path = self.normalize(dst);
        let mut files = lock_files(&self.files);
        let content = files
            .get(&src_path)
            .cloned()
            .ok_or(FsError::NotFound(src_path))?;
        files.insert(dst_path, content);
        Ok(())
    }

    fn mv(&self, src: &str, dst: &str) -> Result<(), FsError> {
        let src_path = self.normalize(src);
        let dst_path = self.normalize(dst);
        let mut files = lock_files(&self.files);
        let content = files.remove(&src_path).ok_or(FsError::NotFound(src_path))?;
        files.insert(dst_path, content);
        Ok(())
    }

    fn chmod(&self, _file_path: &str, _mode: u32) {}
}

/// Engine-backed nested executor for commands running inside the bridge.
///
/// Scripts run against the bridge's shared file map (no dirs/links/modes);
/// the map is replaced with the engine's returned files after each call.
struct EngineExecutor {
    engine: Arc<dyn ShellEngine>,
    files: SharedFiles,
    env: HashMap<String, String>,
    cwd: String,
    limits_json: String,
    layout: LayoutMode,
}

#[async_trait]
impl ScriptExecutor for EngineExecutor {
    async fn exec(&self, script: &str, options: ExecOptions) -> anyhow::Result<CommandOutput> {
        let mut env = self.env.clone();
        env.extend(options.env);
        let cwd = path::normalize(options.cwd.as_deref().unwrap_or(&self.cwd), "/");

        let script = match options.stdin.as_deref() {
            Some(stdin) if !stdin.is_empty() => {
                format!(
                    "printf '%s' {} | {script}",
                    crate::session::shell_single_quote(stdin)
                )
            }
            _ => script.to_string(),
        };

        let invocation = EngineInvocation {
            script,
            env_json: serde_json::to_string(&env)?,
            files_json: serde_json::to_string(&*lock_files(&self.files))?,
            dirs_json: "{}".to_string(),
            links_json: "{}".to_string(),
            modes_json: "{}".to_string(),
            cwd,
            limits_json: self.limits_json.clone(),
            layout: self.layout,
        };
        let engine = Arc::clone(&self.engine);
        let result_json =
            tokio::task::spawn_blocking(move || engine.execute(&invocation)).await?;
        let state = EngineState::parse(&result_json)?;
        if let Some(files) = &state.files {
            *lock_files(&self.files) = files.clone();
        }
        let exit_code = state.exit_code();
        Ok(CommandOutput {
            stdout: state.stdout,
            stderr: state.stderr,
            exit_code,
        })
    }
}

fn encode(response: &CustomResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"handled":false,"stdout":"","stderr":"","exitCode":1,"error":"custom response failed to encode"}"#
            .to_string()
    })
}

/// Build the custom-command bridge closure for one engine call.
pub(crate) fn make_custom_bridge(
    registry: Arc<tokio::sync::Mutex<CommandRegistry>>,
    engine: Arc<dyn ShellEngine>,
    limits_json: String,
    layout: LayoutMode,
) -> JsonBridge {
    Arc::new(move |request_json: &str| {
        let response = dispatch(
            request_json,
            &registry,
            &engine,
            &limits_json,
            layout,
        );
        encode(&response)
    })
}

fn dispatch(
    request_json: &str,
    registry: &Arc<tokio::sync::Mutex<CommandRegistry>>,
    engine: &Arc<dyn ShellEngine>,
    limits_json: &str,
    layout: LayoutMode,
) -> CustomResponse {
    let request = match serde_json::from_str::<CustomRequest>(request_json) {
        Ok(request) => request,
        Err(error) => return CustomResponse::rejected(format!("malformed custom request: {error}")),
    };
    if request.name.is_empty() {
        return CustomResponse::rejected("custom request is missing a command name");
    }

    let resolved = {
        let registry = Arc::clone(registry);
        let name = request.name.clone();
        wait_for(async move { registry.lock().await.resolve(&name).await })
    };
    let command = match resolved {
        Ok(Some(command)) => command,
        Ok(None) => return CustomResponse::unknown(),
        Err(error) => return CustomResponse::rejected(error.to_string()),
    };

    let cwd = path::normalize(if request.cwd.is_empty() { "/" } else { &request.cwd }, "/");
    let files: SharedFiles = Arc::new(Mutex::new(request.files.clone()));
    let ctx = CommandContext {
        fs: Arc::new(ScratchFs {
            files: Arc::clone(&files),
            cwd: cwd.clone(),
        }),
        cwd: cwd.clone(),
        env: request.env.clone(),
        stdin: request.stdin.clone(),
        executor: Arc::new(EngineExecutor {
            engine: Arc::clone(engine),
            files: Arc::clone(&files),
            env: request.env.clone(),
            cwd,
            limits_json: limits_json.to_string(),
            layout,
        }),
    };

    let args = request.args.clone();
    let executed = wait_for(async move { command.execute(&args, ctx).await });
    let snapshot = lock_files(&files).clone();
    match executed {
        Ok(output) => CustomResponse {
            handled: true,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            error: None,
            files: Some(snapshot),
        },
        Err(error) => CustomResponse {
            handled: true,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 1,
            error: Some(error.to_string()),
            files: Some(snapshot),
        },
    }
}
