//! The filesystem shadow.
//!
//! The sandbox's visible filesystem is a flat path→content map with auxiliary
//! directory, symlink, and permission maps. [`ShadowFs`] owns the canonical
//! copy: it seeds each engine invocation, is replaced wholesale by the
//! engine's returned state, and backs the filesystem API exposed to
//! application code and custom commands between calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineState;
use crate::path;

/// Errors from filesystem shadow operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// The target path is absent from the files, dirs, and links maps.
    #[error("no such file: {0}")]
    NotFound(String),
}

/// Classification of a shadow entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Regular file with string content.
    File,
    /// Directory (explicit or materialized ancestor).
    Directory,
    /// Symbolic link with a target path.
    Symlink,
}

/// One entry in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name (single path component).
    pub name: String,
    /// What the entry is.
    pub kind: FileKind,
}

/// Synthesized metadata for a shadow entry.
///
/// The shadow tracks no timestamps, so `mtime` is always 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Entry classification.
    pub kind: FileKind,
    /// Content length for files, target length for symlinks, 0 for dirs.
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// Always 0.
    pub mtime: u64,
}

impl FileStat {
    /// Whether the entry is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    /// Whether the entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Whether the entry is a symlink.
    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }
}

/// Options for [`VirtualFs::rm`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RmOptions {
    /// Remove the path and everything beneath it.
    pub recursive: bool,
    /// Do not fail when the target is absent.
    pub force: bool,
}

/// An initial file supplied at session construction.
#[derive(Debug, Clone)]
pub enum FileSeed {
    /// Plain text content, default mode.
    Text(String),
    /// Raw bytes, decoded lossily as UTF-8, default mode.
    Bytes(Vec<u8>),
    /// Content with an explicit permission mode.
    Entry {
        /// File content.
        content: String,
        /// Permission bits (e.g. `0o755`).
        mode: u32,
    },
}

impl FileSeed {
    fn into_parts(self) -> (String, Option<u32>) {
        match self {
            FileSeed::Text(content) => (content, None),
            FileSeed::Bytes(bytes) => (String::from_utf8_lossy(&bytes).into_owned(), None),
            FileSeed::Entry { content, mode } => (content, Some(mode)),
        }
    }
}

impl From<&str> for FileSeed {
    fn from(content: &str) -> Self {
        FileSeed::Text(content.to_string())
    }
}

impl From<String> for FileSeed {
    fn from(content: String) -> Self {
        FileSeed::Text(content)
    }
}

impl From<Vec<u8>> for FileSeed {
    fn from(bytes: Vec<u8>) -> Self {
        FileSeed::Bytes(bytes)
    }
}

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;
const EXEC_MODE: u32 = 0o755;
const LINK_MODE: u32 = 0o777;
const DIR_MARKER: &str = "1";

/// The filesystem API threaded through command contexts.
///
/// Implemented by [`ShadowFs`] (the session's canonical state) and by the
/// custom bridge's throwaway scratch view. All paths are normalized against
/// the implementation's working directory before use.
pub trait VirtualFs: Send + Sync {
    /// Read a file's content.
    fn read_file(&self, file_path: &str) -> Result<String, FsError>;
    /// Write (create or replace) a file.
    fn write_file(&self, file_path: &str, content: &str);
    /// Append to a file, creating it when absent.
    fn append_file(&self, file_path: &str, content: &str);
    /// Whether a file, directory, or symlink exists at the path.
    fn exists(&self, file_path: &str) -> bool;
    /// Synthesized metadata for the path.
    fn stat(&self, file_path: &str) -> Result<FileStat, FsError>;
    /// Direct children of a directory, deduplicated and sorted.
    fn read_dir(&self, dir_path: &str) -> Vec<DirEntry>;
    /// Create a single directory.
    fn mkdir(&self, dir_path: &str);
    /// Create a directory and all missing ancestors.
    fn mkdir_all(&self, dir_path: &str);
    /// Remove a path.
    fn rm(&self, file_path: &str, options: RmOptions) -> Result<(), FsError>;
    /// Copy a file.
    fn cp(&self, src: &str, dst: &str) -> Result<(), FsError>;
    /// Move a file.
    fn mv(&self, src: &str, dst: &str) -> Result<(), FsError>;
    /// Set a path's permission bits.
    fn chmod(&self, file_path: &str, mode: u32);
}

/// The four parallel maps that make up a filesystem snapshot.
#[derive(Debug, Clone, Default)]
struct FsMaps {
    files: HashMap<String, String>,
    dirs: HashMap<String, String>,
    links: HashMap<String, String>,
    modes: HashMap<String, String>,
}

#[derive(Debug)]
struct ShadowState {
    maps: FsMaps,
    cwd: String,
}

/// Serialized snapshot handed to the engine: each map as a JSON object.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotJson {
    pub files: String,
    pub dirs: String,
    pub links: String,
    pub modes: String,
}

/// Host-side mirror of the sandbox's filesystem state.
///
/// Cheap to clone; clones share the same underlying state, so the session
/// and the command contexts it hands out observe each other's writes.
#[derive(Debug, Clone)]
pub struct ShadowFs {
    state: Arc<Mutex<ShadowState>>,
}

impl ShadowFs {
    /// Create an empty shadow rooted at `cwd`.
    pub fn new(cwd: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ShadowState {
                maps: FsMaps::default(),
                cwd: cwd.into(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ShadowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The working directory paths are normalized against.
    pub fn cwd(&self) -> String {
        self.lock().cwd.clone()
    }

    /// Seed the shadow from caller-supplied initial files, normalizing each
    /// path and materializing ancestor directories.
    pub(crate) fn seed(&self, files: impl IntoIterator<Item = (String, FileSeed)>) {
        let mut state = self.lock();
        let cwd = state.cwd.clone();
        for (raw_path, seed) in files {
            let normalized = path::normalize(&raw_path, &cwd);
            let (content, mode) = seed.into_parts();
            state.maps.files.insert(normalized.clone(), content);
            if let Some(mode) = mode {
                state.maps.modes.insert(normalized.clone(), mode.to_string());
            }
            add_parent_dirs(&mut state.maps, &normalized);
        }
    }

    /// Install empty executable stubs under `/bin` for the given names,
    /// leaving already-seeded paths alone.
    pub(crate) fn install_bin_stubs(&self, names: &[&str]) {
        let mut state = self.lock();
        for name in names {
            let stub = format!("/bin/{name}");
            state.maps.files.entry(stub.clone()).or_default();
            state
                .maps
                .modes
                .entry(stub.clone())
                .or_insert_with(|| EXEC_MODE.to_string());
            add_parent_dirs(&mut state.maps, &stub);
        }
    }

    /// Serialize the four maps for an engine invocation.
    pub(crate) fn snapshot_json(&self) -> SnapshotJson {
        let state = self.lock();
        SnapshotJson {
            files: encode_map(&state.maps.files),
            dirs: encode_map(&state.maps.dirs),
            links: encode_map(&state.maps.links),
            modes: encode_map(&state.maps.modes),
        }
    }

    /// Replace the maps wholesale with the engine's returned state.
    pub(crate) fn apply_state(&self, result: &EngineState) {
        let mut state = self.lock();
        if let Some(files) = &result.files {
            state.maps.files = files.clone();
        }
        if let Some(dirs) = &result.dirs {
            state.maps.dirs = dirs.clone();
        }
        if let Some(links) = &result.links {
            state.maps.links = links.clone();
        }
        if let Some(modes) = &result.modes {
            state.maps.modes = modes.clone();
        }
    }

    fn normalize(&self, state: &ShadowState, raw: &str) -> String {
        path::normalize(raw, &state.cwd)
    }
}

fn encode_map(map: &HashMap<String, String>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

fn add_parent_dirs(maps: &mut FsMaps, file_path: &str) {
    let parts: Vec<&str> = file_path.split('/').filter(|p| !p.is_empty()).collect();
    let mut current = String::new();
    for part in parts.iter().take(parts.len().saturating_sub(1)) {
        current.push('/');
        current.push_str(part);
        maps.dirs.insert(current.clone(), DIR_MARKER.to_string());
    }
}

fn parse_mode(modes: &HashMap<String, String>, path: &str, default: u32) -> u32 {
    modes
        .get(path)
        .and_then(|raw| raw.parse::<u32>().ok())
        .unwrap_or(default)
}

impl VirtualFs for ShadowFs {
    fn read_file(&self, file_path: &str) -> Result<String, FsError> {
        let state = self.lock();
        let normalized = self.normalize(&state, file_path);
        state
            .maps
            .files
            .get(&normalized)
            .cloned()
            .ok_or(FsError::NotFound(normalized))
    }

    fn write_file(&self, file_path: &str, content: &str) {
        let mut state = self.lock();
        let normalized = self.normalize(&state, file_path);
        state
            .maps
            .files
            .insert(normalized.clone(), content.to_string());
        state
            .maps
            .modes
            .entry(normalized.clone())
            .or_insert_with(|| FILE_MODE.to_string());
        add_parent_dirs(&mut state.maps, &normalized);
    }

    fn append_file(&self, file_path: &str, content: &str) {
        let mut state = self.lock();
        let normalized = self.normalize(&state, file_path);
        state
            .maps
            .files
            .entry(normalized.clone())
            .or_default()
            .push_str(content);
        state
            .maps
            .modes
            .entry(normalized.clone())
            .or_insert_with(|| FILE_MODE.to_string());
        add_parent_dirs(&mut state.maps, &normalized);
    }

    fn exists(&self, file_path: &str) -> bool {
        let state = self.lock();
        let normalized = self.normalize(&state, file_path);
        state.maps.files.contains_key(&normalized)
            || state.maps.dirs.contains_key(&normalized)
            || state.maps.links.contains_key(&normalized)
    }

    fn stat(&self, file_path: &str) -> Result<FileStat, FsError> {
        let state = self.lock();
        let normalized = self.normalize(&state, file_path);
        if let Some(content) = state.maps.files.get(&normalized) {
            return Ok(FileStat {
                kind: FileKind::File,
                size: content.len() as u64,
                mode: parse_mode(&state.maps.modes, &normalized, FILE_MODE),
                mtime: 0,
            });
        }
        if state.maps.dirs.contains_key(&normalized) {
            return Ok(FileStat {
                kind: FileKind::Directory,
                size: 0,
                mode: parse_mode(&state.maps.modes, &normalized, DIR_MODE),
                mtime: 0,
            });
        }
        if let Some(target) = state.maps.links.get(&normalized) {
            return Ok(FileStat {
                kind: FileKind::Symlink,
                size: target.len() as u64,
                mode: parse_mode(&state.maps.modes, &normalized, LINK_MODE),
                mtime: 0,
            });
        }
        Err(FsError::NotFound(normalized))
    }

    fn read_dir(&self, dir_path: &str) -> Vec<DirEntry> {
        let state = self.lock();
        let normalized = self.normalize(&state, dir_path);
        // O(total paths) prefix scan across all three maps; sandboxes hold at
        // most a few thousand entries.
        let all = state
            .maps
            .files
            .keys()
            .chain(state.maps.dirs.keys())
            .chain(state.maps.links.keys())
            .map(String::as_str);
        path::list_children(all, &normalized)
            .into_iter()
            .map(|name| {
                let child = if normalized == "/" {
                    format!("/{name}")
                } else {
                    format!("{normalized}/{name}")
                };
                let kind = if state.maps.dirs.contains_key(&child) {
                    FileKind::Directory
                } else if state.maps.links.contains_key(&child) {
                    FileKind::Symlink
                } else {
                    FileKind::File
                };
                DirEntry { name, kind }
            })
            .collect()
    }

    fn mkdir(&self, dir_path: &str) {
        let mut state = self.lock();
        let normalized = self.normalize(&state, dir_path);
        state
            .maps
            .dirs
            .insert(normalized.clone(), DIR_MARKER.to_string());
        state
            .maps
            .modes
            .entry(normalized)
            .or_insert_with(|| DIR_MODE.to_string());
    }

    fn mkdir_all(&self, dir_path: &str) {
        let mut state = self.lock();
        let normalized = self.normalize(&state, dir_path);
        let parts: Vec<String> = normalized
            .split('/')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        let mut current = String::new();
        for part in parts {
            current.push('/');
            current.push_str(&part);
            state
                .maps
                .dirs
                .insert(current.clone(), DIR_MARKER.to_string());
            state
                .maps
                .modes
                .entry(current.clone())
                .or_insert_with(|| DIR_MODE.to_string());
        }
    }

    fn rm(&self, file_path: &str, options: RmOptions) -> Result<(), FsError> {
        let mut state = self.lock();
        let normalized = self.normalize(&state, file_path);
        if options.recursive {
            let prefix = format!("{normalized}/");
            let matches = |key: &String| key == &normalized || key.starts_with(&prefix);
            state.maps.files.retain(|key, _| !matches(key));
            state.maps.links.retain(|key, _| !matches(key));
            state.maps.dirs.retain(|key, _| !matches(key));
            state.maps.modes.retain(|key, _| !matches(key));
            return Ok(());
        }
        let present = state.maps.files.contains_key(&normalized)
            || state.maps.links.contains_key(&normalized)
            || state.maps.dirs.contains_key(&normalized);
        if !present && !options.force {
            return Err(FsError::NotFound(normalized));
        }
        state.maps.files.remove(&normalized);
        state.maps.links.remove(&normalized);
        state.maps.dirs.remove(&normalized);
        state.maps.modes.remove(&normalized);
        Ok(())
    }

    fn cp(&self, src: &str, dst: &str) -> Result<(), FsError> {
        let mut state = self.lock();
        let src_path = self.normalize(&state, src);
        let dst_path = self.normalize(&state, dst);
        let content = state
            .maps
            .files
            .get(&src_path)
            .cloned()
            .ok_or(FsError::NotFound(src_path.clone()))?;
        let mode = state
            .maps
            .modes
            .get(&src_path)
            .cloned()
            .unwrap_or_else(|| FILE_MODE.to_string());
        state.maps.files.insert(dst_path.clone(), content);
        state.maps.modes.insert(dst_path.clone(), mode);
        add_parent_dirs(&mut state.maps, &dst_path);
        Ok(())
    }

    fn mv(&self, src: &str, dst: &str) -> Result<(), FsError> {
        let mut state = self.lock();
        let src_path = self.normalize(&state, src);
        let dst_path = self.normalize(&state, dst);
        let content = state
            .maps
            .files
            .remove(&src_path)
            .ok_or(FsError::NotFound(src_path.clone()))?;
        let mode = state
            .maps
            .modes
            .remove(&src_path)
            .unwrap_or_else(|| FILE_MODE.to_string());
        state.maps.files.insert(dst_path.clone(), content);
        state.maps.modes.insert(dst_path.clone(), mode);
        add_parent_dirs(&mut state.maps, &dst_path);
        Ok(())
    }

    fn chmod(&self, file_path: &str, mode: u32) {
        let mut state = self.lock();
        let normalized = self.normalize(&state, file_path);
        state.maps.modes.insert(normalized, mode.to_string());
    }
}
