//! Whelk: host-side adapter for a sandboxed synchronous shell engine.
//!
//! Whelk sits between an externally-compiled, synchronous shell interpreter
//! (the "engine") and an asynchronous, capability-rich host: network access,
//! timers, nested script/database runtimes, and user-supplied commands. It
//! presents a single deterministic request/response surface to callers while
//! keeping the engine's view of the world — a flat virtual filesystem and a
//! set of synchronous capability bridges — consistent across calls.
//!
//! ```rust,ignore
//! use whelk::{ExecOptions, Session};
//!
//! let session = Session::builder(engine)
//!     .file("/a.txt", "hi")
//!     .build();
//! let result = session.exec("cat /a.txt", ExecOptions::default()).await?;
//! assert_eq!(result.stdout, "hi");
//! ```

mod block_on;
mod command;
mod engine;
mod fs;
mod intercept;
mod limits;
mod path;
mod session;
mod spawn;
mod vm;

pub mod bridge;

pub use block_on::{BlockError, wait_for};
pub use command::{
    Command, CommandContext, CommandOutput, CommandRegistry, CommandSpec, LazyCommand,
    ScriptExecutor, command_fn,
};
pub use engine::{
    DEFAULT_COMMAND_NAMES, EngineInvocation, EngineState, LayoutMode, ShellEngine, command_names,
};
pub use fs::{DirEntry, FileKind, FileSeed, FileStat, FsError, RmOptions, ShadowFs, VirtualFs};
pub use limits::ExecutionLimits;
pub use path::normalize as normalize_path;
pub use session::{ExecOptions, ExecResult, Session, SessionBuilder, SessionError};
pub use spawn::{SpawnResult, run_host_tool};
pub use vm::{
    DatabaseHandle, DatabaseRuntime, ScriptJob, ScriptOutcome, ScriptRuntime,
};
