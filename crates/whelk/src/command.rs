//! Host-registered custom commands.
//!
//! A custom command is a non-engine-native command name backed by host code.
//! It is reached either by the fast-path pipeline interceptor (never touching
//! the engine) or, from inside the engine, through the custom bridge's
//! prelude-injected delegation.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::fs::VirtualFs;
use crate::session::ExecOptions;

/// Result of running a custom command or a nested script.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code; 0 means success.
    pub exit_code: i32,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    /// Failed output with the given stderr and exit code.
    pub fn failure(stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }
}

/// Executes nested scripts on behalf of a command.
///
/// On the fast path this re-enters the owning session; inside the custom
/// bridge it re-enters the engine directly against the bridge's scratch
/// file state.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Run a script with the command's environment as the base.
    async fn exec(&self, script: &str, options: ExecOptions) -> anyhow::Result<CommandOutput>;
}

/// Everything a command sees when invoked.
#[derive(Clone)]
pub struct CommandContext {
    /// Filesystem view: the session shadow on the fast path, a throwaway
    /// scratch view inside the custom bridge.
    pub fs: Arc<dyn VirtualFs>,
    /// Working directory.
    pub cwd: String,
    /// Effective environment.
    pub env: HashMap<String, String>,
    /// Standard input (pipeline-threaded on the fast path).
    pub stdin: String,
    /// Nested script executor.
    pub executor: Arc<dyn ScriptExecutor>,
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("cwd", &self.cwd)
            .field("env", &self.env)
            .field("stdin", &self.stdin)
            .finish_non_exhaustive()
    }
}

/// A host-implemented command.
#[async_trait]
pub trait Command: Send + Sync {
    /// The name scripts invoke this command by.
    fn name(&self) -> &str;

    /// Run the command.
    ///
    /// Errors become a structured `error` field when crossing the bridge
    /// boundary; on the fast path they propagate to the `exec` caller.
    async fn execute(
        &self,
        args: &[String],
        ctx: CommandContext,
    ) -> anyhow::Result<CommandOutput>;
}

type LoaderFn =
    Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<Arc<dyn Command>>> + Send + Sync>;

/// A command whose construction is deferred until first use.
///
/// The loader runs at most once; the loaded command is cached in the
/// registry's eager map thereafter.
pub struct LazyCommand {
    name: String,
    loader: LoaderFn,
}

impl LazyCommand {
    /// Create a lazy command from an async loader.
    pub fn new<F, Fut>(name: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<dyn Command>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            loader: Box::new(move || loader().boxed()),
        }
    }

    /// The command's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for LazyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyCommand")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A command descriptor supplied at session construction.
pub enum CommandSpec {
    /// Ready to invoke.
    Eager(Arc<dyn Command>),
    /// Deferred factory, promoted on first resolution.
    Lazy(LazyCommand),
}

impl CommandSpec {
    /// The name the descriptor registers.
    pub fn name(&self) -> &str {
        match self {
            CommandSpec::Eager(command) => command.name(),
            CommandSpec::Lazy(lazy) => lazy.name(),
        }
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

impl From<Arc<dyn Command>> for CommandSpec {
    fn from(command: Arc<dyn Command>) -> Self {
        CommandSpec::Eager(command)
    }
}

impl From<LazyCommand> for CommandSpec {
    fn from(lazy: LazyCommand) -> Self {
        CommandSpec::Lazy(lazy)
    }
}

/// Registry of custom commands.
///
/// A name lives in exactly one of the two maps at any time: lazy entries move
/// to the eager map the first time they resolve.
#[derive(Default)]
pub struct CommandRegistry {
    eager: HashMap<String, Arc<dyn Command>>,
    lazy: HashMap<String, LazyCommand>,
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("eager", &self.eager.keys().collect::<Vec<_>>())
            .field("lazy", &self.lazy.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CommandRegistry {
    /// Register a descriptor, displacing any previous entry with the same
    /// name from both maps.
    pub fn insert(&mut self, spec: CommandSpec) {
        let name = spec.name().to_string();
        self.eager.remove(&name);
        self.lazy.remove(&name);
        match spec {
            CommandSpec::Eager(command) => {
                self.eager.insert(name, command);
            }
            CommandSpec::Lazy(lazy) => {
                self.lazy.insert(name, lazy);
            }
        }
    }

    /// Whether no commands are registered.
    pub fn is_empty(&self) -> bool {
        self.eager.is_empty() && self.lazy.is_empty()
    }

    /// All registered names, eager then lazy.
    pub fn names(&self) -> Vec<String> {
        self.eager
            .keys()
            .chain(self.lazy.keys())
            .cloned()
            .collect()
    }

    /// Resolve a name, promoting a lazy entry to eager on first use.
    ///
    /// A failing loader leaves the lazy entry in place so a later resolution
    /// can retry; the error propagates to the caller.
    pub async fn resolve(&mut self, name: &str) -> anyhow::Result<Option<Arc<dyn Command>>> {
        if let Some(command) = self.eager.get(name) {
            return Ok(Some(Arc::clone(command)));
        }
        let Some(lazy) = self.lazy.get(name) else {
            return Ok(None);
        };
        let loaded = (lazy.loader)().await?;
        self.lazy.remove(name);
        self.eager.insert(name.to_string(), Arc::clone(&loaded));
        Ok(Some(loaded))
    }
}

struct FnCommand<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> Command for FnCommand<F>
where
    F: Fn(Vec<String>, CommandContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<CommandOutput>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        args: &[String],
        ctx: CommandContext,
    ) -> anyhow::Result<CommandOutput> {
        (self.f)(args.to_vec(), ctx).await
    }
}

/// Wrap an async closure as an eager command.
///
/// ```rust,ignore
/// let greet = command_fn("greet", |args, _ctx| async move {
///     Ok(CommandOutput::success(format!("hello {}\n", args.join(" "))))
/// });
/// ```
pub fn command_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn Command>
where
    F: Fn(Vec<String>, CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<CommandOutput>> + Send + 'static,
{
    Arc::new(FnCommand {
        name: name.into(),
        f,
    })
}
