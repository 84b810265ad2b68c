//! Synchronizer for the hierarchical script runtime.
//!
//! The script runtime (a sandboxed Python interpreter) keeps its own
//! hierarchical filesystem. Before each invocation the requested snapshot is
//! pushed in: paths that were materialized last time but are no longer
//! requested get deleted, everything requested is (re)written with parent
//! directories created on demand. After the invocation a bounded walk over
//! the roots actually touched collects file contents back into a snapshot and
//! becomes the new tracked baseline, keeping synchronization cost
//! proportional to the touched subtree rather than the runtime's whole
//! private filesystem.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use crate::bridge::{VmRequest, VmResponse};
use crate::path;

/// Depth ceiling for the post-invocation root walk.
const MAX_WALK_DEPTH: usize = 24;
/// File-count ceiling for the post-invocation root walk.
const MAX_WALK_FILES: usize = 20_000;

/// One script invocation.
#[derive(Debug, Clone, Default)]
pub struct ScriptJob {
    /// Interpreter arguments (script path, `-c`, `-m`, ...).
    pub args: Vec<String>,
    /// Standard input text.
    pub stdin: String,
    /// Working directory inside the runtime.
    pub cwd: String,
    /// Environment for the invocation.
    pub env: HashMap<String, String>,
}

/// What a script invocation produced.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutcome {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code.
    pub exit_code: i32,
}

/// A host-loaded script runtime with private hierarchical storage.
///
/// Methods take canonical absolute paths. `run` executes synchronously; the
/// loader that produced the runtime has already done any async setup.
pub trait ScriptRuntime: Send + Sync {
    /// Whether a path exists in the runtime's private storage.
    fn exists(&self, file_path: &str) -> bool;
    /// Whether an existing path is a directory.
    fn is_dir(&self, file_path: &str) -> bool;
    /// Create a directory (parents must already exist).
    fn mkdir(&self, dir_path: &str) -> anyhow::Result<()>;
    /// List entry names in a directory.
    fn read_dir(&self, dir_path: &str) -> anyhow::Result<Vec<String>>;
    /// Read a file's content.
    fn read_file(&self, file_path: &str) -> anyhow::Result<String>;
    /// Write (create or replace) a file.
    fn write_file(&self, file_path: &str, content: &str) -> anyhow::Result<()>;
    /// Remove a file.
    fn unlink(&self, file_path: &str) -> anyhow::Result<()>;
    /// Run the interpreter.
    fn run(&self, job: &ScriptJob) -> anyhow::Result<ScriptOutcome>;
}

/// Tracked-file-set synchronizer for one session's script runtime.
#[derive(Debug, Default)]
pub(crate) struct PythonSync {
    tracked: Mutex<HashSet<String>>,
}

impl PythonSync {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run one invocation: sync the snapshot in, execute, collect the
    /// post-state snapshot out.
    pub(crate) fn run(
        &self,
        runtime: &dyn ScriptRuntime,
        request: &VmRequest,
    ) -> anyhow::Result<VmResponse> {
        let files = super::normalize_files(&request.files);
        let cwd = super::normalize_cwd(&request.cwd);
        self.sync_in(runtime, &files);

        let job = ScriptJob {
            args: request.args.clone(),
            stdin: request.stdin.clone(),
            cwd: cwd.clone(),
            env: request.env.clone(),
        };
        let outcome = runtime.run(&job)?;

        let snapshot = self.collect_snapshot(runtime, request, &files, &cwd);
        Ok(VmResponse {
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
            error: None,
            files: Some(snapshot),
        })
    }

    fn tracked(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push the requested snapshot into the runtime: delete what fell out of
    /// the tracked set, write everything requested.
    fn sync_in(&self, runtime: &dyn ScriptRuntime, files: &HashMap<String, String>) {
        let next: HashSet<String> = files.keys().cloned().collect();
        {
            let tracked = self.tracked();
            for stale in tracked.iter() {
                if !next.contains(stale) {
                    delete_file(runtime, stale);
                }
            }
        }
        for (file_path, content) in files {
            write_file(runtime, file_path, content);
        }
        *self.tracked() = next;
    }

    /// Collect the post-invocation snapshot: every tracked file still present
    /// plus a bounded walk of the roots the invocation could have touched.
    fn collect_snapshot(
        &self,
        runtime: &dyn ScriptRuntime,
        request: &VmRequest,
        files: &HashMap<String, String>,
        cwd: &str,
    ) -> HashMap<String, String> {
        let mut snapshot = HashMap::new();
        for tracked_path in self.tracked().iter() {
            if let Some(content) = read_file(runtime, tracked_path) {
                snapshot.insert(tracked_path.clone(), content);
            }
        }

        let mut roots = HashSet::new();
        for file_path in files.keys() {
            let root = path::top_root(file_path);
            if root != "/" {
                roots.insert(root);
            }
        }
        if cwd.starts_with('/') {
            let root = path::top_root(cwd);
            if root != "/" {
                roots.insert(root);
            }
        }
        if let Some(script_path) = request.args.first()
            && script_path.starts_with('/')
        {
            let root = path::top_root(script_path);
            if root != "/" {
                roots.insert(root);
            }
        }

        let mut walker = Walker {
            runtime,
            visited: HashSet::new(),
            file_count: 0,
            out: &mut snapshot,
        };
        for root in &roots {
            walker.walk(root, 0);
        }

        *self.tracked() = snapshot.keys().cloned().collect();
        snapshot
    }
}

struct Walker<'a> {
    runtime: &'a dyn ScriptRuntime,
    visited: HashSet<String>,
    file_count: usize,
    out: &'a mut HashMap<String, String>,
}

impl Walker<'_> {
    fn walk(&mut self, dir: &str, depth: usize) {
        if depth > MAX_WALK_DEPTH || self.file_count >= MAX_WALK_FILES {
            return;
        }
        let dir = path::normalize(dir, "/");
        if !self.visited.insert(dir.clone()) {
            return;
        }

        let Ok(entries) = self.runtime.read_dir(&dir) else {
            return;
        };
        for name in entries {
            if name == "." || name == ".." {
                continue;
            }
            let child = if dir == "/" {
                format!("/{name}")
            } else {
                format!("{dir}/{name}")
            };
            if !self.runtime.exists(&child) {
                continue;
            }
            if self.runtime.is_dir(&child) {
                self.walk(&child, depth + 1);
                continue;
            }
            if let Some(content) = read_file(self.runtime, &child) {
                self.out.insert(path::normalize(&child, "/"), content);
            }
            self.file_count += 1;
            if self.file_count >= MAX_WALK_FILES {
                return;
            }
        }
    }
}

fn ensure_dir(runtime: &dyn ScriptRuntime, dir_path: &str) {
    let normalized = path::normalize(dir_path, "/");
    if normalized == "/" {
        return;
    }
    let mut current = String::new();
    for part in normalized.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        if !runtime.exists(&current) {
            // A racing mkdir surfaces at the write step instead.
            let _ = runtime.mkdir(&current);
        }
    }
}

fn write_file(runtime: &dyn ScriptRuntime, file_path: &str, content: &str) {
    let normalized = path::normalize(file_path, "/");
    if normalized == "/" {
        return;
    }
    let parent = match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(slash) => normalized[..slash].to_string(),
    };
    ensure_dir(runtime, &parent);
    let _ = runtime.write_file(&normalized, content);
}

fn delete_file(runtime: &dyn ScriptRuntime, file_path: &str) {
    let normalized = path::normalize(file_path, "/");
    if normalized == "/" {
        return;
    }
    if runtime.exists(&normalized) {
        let _ = runtime.unlink(&normalized);
    }
}

fn read_file(runtime: &dyn ScriptRuntime, file_path: &str) -> Option<String> {
    let normalized = path::normalize(file_path, "/");
    if normalized == "/" || !runtime.exists(&normalized) {
        return None;
    }
    runtime.read_file(&normalized).ok()
}
