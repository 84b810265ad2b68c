//! Session orchestration.
//!
//! A [`Session`] owns the filesystem shadow, the command registry, and the
//! configured host capabilities. Each [`Session::exec`] call normalizes its
//! inputs, tries the fast-path interceptor, and otherwise installs the
//! capability bridges, invokes the opaque engine, and merges the returned
//! state back into the shadow.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

use crate::block_on::wait_for;
use crate::bridge::{
    self, BridgeSet, Fetcher, JsonBridge, Sleeper, VmHandler, VmRequest, VmResponse,
};
use crate::bridge::{make_custom_bridge, make_fetch_bridge, make_now_bridge, make_sleep_bridge};
use crate::command::{
    CommandContext, CommandOutput, CommandRegistry, CommandSpec, ScriptExecutor,
};
use crate::engine::{DEFAULT_COMMAND_NAMES, EngineInvocation, EngineState, LayoutMode, ShellEngine};
use crate::fs::{FileSeed, ShadowFs, VirtualFs};
use crate::intercept;
use crate::limits::ExecutionLimits;
use crate::path;
use crate::vm::{self, DatabaseRuntime, PythonSync, ScriptRuntime};

/// Shell function name the prelude delegates custom commands through.
pub(crate) const CUSTOM_BUILTIN: &str = "__whelk_custom__";

/// Environment variable carrying the command allowlist into the engine.
const ALLOWED_COMMANDS_VAR: &str = "__WHELK_ALLOWED_COMMANDS";

/// Errors surfaced by [`Session::exec`].
///
/// Script-level failures (parse errors, nonzero exits, limit violations) are
/// not errors here; they arrive through [`ExecResult::exit_code`] and
/// [`ExecResult::stderr`]. These variants cover the host side only.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The engine returned malformed result JSON.
    #[error("malformed engine result: {0}")]
    MalformedEngineResult(#[from] serde_json::Error),
    /// A host-supplied callback (command, loader) failed on the fast path.
    #[error("host callback failed: {0}")]
    HostCallback(#[from] anyhow::Error),
    /// The engine call itself could not be completed.
    #[error("engine execution failed: {0}")]
    EngineExecution(String),
}

/// Per-call options for [`Session::exec`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory override.
    pub cwd: Option<String>,
    /// Environment merged over the session's base environment.
    pub env: HashMap<String, String>,
    /// Standard input for the script.
    pub stdin: Option<String>,
}

/// Result of one [`Session::exec`] call.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Script exit code.
    pub exit_code: i32,
    /// Environment as left by the script.
    pub env: HashMap<String, String>,
}

/// Quote a string for safe single-quoted interpolation into a script.
pub(crate) fn shell_single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

type ScriptRuntimeLoader =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Arc<dyn ScriptRuntime>>> + Send + Sync>;
type DatabaseRuntimeLoader =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Arc<dyn DatabaseRuntime>>> + Send + Sync>;

struct SessionInner {
    engine: Arc<dyn ShellEngine>,
    base_env: HashMap<String, String>,
    base_cwd: String,
    default_layout: bool,
    limits: ExecutionLimits,
    allowed_commands: Option<Vec<String>>,
    fs: ShadowFs,
    registry: Arc<Mutex<CommandRegistry>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    clock: Option<bridge::Clock>,
    vm_handler: Option<Arc<dyn VmHandler>>,
    python_enabled: bool,
    python_loader: Option<ScriptRuntimeLoader>,
    python_runtime: OnceCell<Arc<dyn ScriptRuntime>>,
    python_sync: PythonSync,
    sqlite_enabled: bool,
    sqlite_loader: Option<DatabaseRuntimeLoader>,
    sqlite_runtime: OnceCell<Arc<dyn DatabaseRuntime>>,
}

/// Builder for a [`Session`].
///
/// # Example
///
/// ```rust,ignore
/// let session = Session::builder(engine)
///     .env("HOME", "/home/user")
///     .file("/a.txt", "hi")
///     .command(command_fn("greet", |args, _ctx| async move {
///         Ok(CommandOutput::success(format!("hello {}\n", args.join(" "))))
///     }))
///     .build();
///
/// let result = session.exec("cat /a.txt", ExecOptions::default()).await?;
/// ```
pub struct SessionBuilder {
    engine: Arc<dyn ShellEngine>,
    env: HashMap<String, String>,
    cwd: Option<String>,
    files: Option<HashMap<String, FileSeed>>,
    limits: ExecutionLimits,
    commands: Vec<CommandSpec>,
    allowed_commands: Option<Vec<String>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    clock: Option<bridge::Clock>,
    vm_handler: Option<Arc<dyn VmHandler>>,
    python_enabled: bool,
    python_loader: Option<ScriptRuntimeLoader>,
    sqlite_enabled: bool,
    sqlite_loader: Option<DatabaseRuntimeLoader>,
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("env", &self.env)
            .field("cwd", &self.cwd)
            .field("has_files", &self.files.is_some())
            .field("commands", &self.commands)
            .field("has_network", &self.fetcher.is_some())
            .field("python_enabled", &self.python_enabled)
            .field("sqlite_enabled", &self.sqlite_enabled)
            .finish_non_exhaustive()
    }
}

impl SessionBuilder {
    fn new(engine: Arc<dyn ShellEngine>) -> Self {
        Self {
            engine,
            env: HashMap::new(),
            cwd: None,
            files: None,
            limits: ExecutionLimits::default(),
            commands: Vec::new(),
            allowed_commands: None,
            fetcher: None,
            sleeper: None,
            clock: None,
            vm_handler: None,
            python_enabled: false,
            python_loader: None,
            sqlite_enabled: false,
            sqlite_loader: None,
        }
    }

    /// Set one base environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Merge several base environment variables.
    pub fn envs(
        mut self,
        vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set the base working directory.
    ///
    /// Configuring a cwd (or any initial file) switches the session to the
    /// minimal layout: no `/bin` stubs are installed.
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add one initial file.
    pub fn file(mut self, file_path: impl Into<String>, seed: impl Into<FileSeed>) -> Self {
        self.files
            .get_or_insert_with(HashMap::new)
            .insert(file_path.into(), seed.into());
        self
    }

    /// Add several initial files.
    pub fn files(
        mut self,
        files: impl IntoIterator<Item = (impl Into<String>, impl Into<FileSeed>)>,
    ) -> Self {
        let map = self.files.get_or_insert_with(HashMap::new);
        map.extend(files.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set the execution limits forwarded to the engine.
    pub fn limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Register a custom command (eager or lazy).
    pub fn command(mut self, spec: impl Into<CommandSpec>) -> Self {
        self.commands.push(spec.into());
        self
    }

    /// Restrict the engine to an allowlist of command names.
    pub fn allowed_commands(
        mut self,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.allowed_commands = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Enable networking with the given fetch implementation.
    ///
    /// Without this the fetch bridge is absent and scripts observe a sandbox
    /// with no network at all.
    pub fn network(mut self, fetcher: impl Fetcher + 'static) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    /// Override the sleep implementation.
    pub fn sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Some(Arc::new(sleeper));
        self
    }

    /// Override the monotonic clock.
    pub fn clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Route every nested-runtime request to a host handler, bypassing the
    /// built-in synchronizers.
    pub fn vm_handler(mut self, handler: impl VmHandler + 'static) -> Self {
        self.vm_handler = Some(Arc::new(handler));
        self
    }

    /// Enable the script runtime with a loader factory.
    ///
    /// The loader runs once per session, on the first `exec` that needs it.
    pub fn python_loader<F, Fut>(mut self, loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Arc<dyn ScriptRuntime>>> + Send + 'static,
    {
        self.python_enabled = true;
        self.python_loader = Some(Arc::new(move || loader().boxed()));
        self
    }

    /// Enable the script runtime without a loader; requests for it return an
    /// initialization error until a loader is configured.
    pub fn enable_python(mut self) -> Self {
        self.python_enabled = true;
        self
    }

    /// Enable the database runtime with a loader factory.
    pub fn sqlite_loader<F, Fut>(mut self, loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Arc<dyn DatabaseRuntime>>>
            + Send
            + 'static,
    {
        self.sqlite_enabled = true;
        self.sqlite_loader = Some(Arc::new(move || loader().boxed()));
        self
    }

    /// Enable the database runtime without a loader.
    pub fn enable_sqlite(mut self) -> Self {
        self.sqlite_enabled = true;
        self
    }

    /// Build the session.
    pub fn build(self) -> Session {
        let default_layout = self.files.is_none() && self.cwd.is_none();
        let base_cwd = match &self.cwd {
            Some(cwd) if !cwd.is_empty() => cwd.clone(),
            _ => {
                if self.files.is_some() {
                    "/".to_string()
                } else {
                    "/home/user".to_string()
                }
            }
        };

        let fs = ShadowFs::new(base_cwd.clone());
        if let Some(files) = self.files {
            fs.seed(files);
        }
        if default_layout {
            fs.install_bin_stubs(DEFAULT_COMMAND_NAMES);
        }

        let mut registry = CommandRegistry::default();
        for spec in self.commands {
            registry.insert(spec);
        }

        Session {
            inner: Arc::new(SessionInner {
                engine: self.engine,
                base_env: self.env,
                base_cwd,
                default_layout,
                limits: self.limits,
                allowed_commands: self.allowed_commands,
                fs,
                registry: Arc::new(Mutex::new(registry)),
                fetcher: self.fetcher,
                sleeper: self.sleeper,
                clock: self.clock,
                vm_handler: self.vm_handler,
                python_enabled: self.python_enabled,
                python_loader: self.python_loader,
                python_runtime: OnceCell::new(),
                python_sync: PythonSync::new(),
                sqlite_enabled: self.sqlite_enabled,
                sqlite_loader: self.sqlite_loader,
                sqlite_runtime: OnceCell::new(),
            }),
        }
    }
}

/// A sandboxed shell session.
///
/// Cheap to clone; clones share the same filesystem shadow, command
/// registry, and memoized auxiliary runtimes.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("cwd", &self.inner.base_cwd)
            .field("default_layout", &self.inner.default_layout)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start building a session around an engine.
    pub fn builder(engine: impl ShellEngine + 'static) -> SessionBuilder {
        SessionBuilder::new(Arc::new(engine))
    }

    /// The session's filesystem shadow.
    pub fn fs(&self) -> ShadowFs {
        self.inner.fs.clone()
    }

    /// The session's base working directory.
    pub fn cwd(&self) -> String {
        self.inner.base_cwd.clone()
    }

    /// The session's base environment.
    pub fn env(&self) -> HashMap<String, String> {
        self.inner.base_env.clone()
    }

    /// Execute a script in the sandbox.
    ///
    /// Scripts that are simple pipelines over registered custom commands are
    /// dispatched directly; everything else goes through the engine with the
    /// capability bridges installed for the duration of the call.
    pub async fn exec(
        &self,
        script: &str,
        options: ExecOptions,
    ) -> Result<ExecResult, SessionError> {
        self.ensure_runtimes_ready().await?;

        let quiet = script.trim().is_empty();
        if !quiet {
            tracing::info!(command = script, "exec");
        }

        let has_commands = !self.inner.registry.lock().await.is_empty();

        let mut env = self.inner.base_env.clone();
        env.extend(options.env.clone());
        if let Some(allowed) = &self.inner.allowed_commands {
            let mut allowed = allowed.clone();
            if has_commands {
                allowed.push(CUSTOM_BUILTIN.to_string());
            }
            env.insert(ALLOWED_COMMANDS_VAR.to_string(), allowed.join(","));
        }

        let cwd = path::normalize(options.cwd.as_deref().unwrap_or(&self.inner.base_cwd), "/");

        let result = if has_commands
            && let Some(result) = self
                .try_intercept(script, &env, &cwd, options.stdin.as_deref())
                .await?
        {
            result
        } else {
            self.exec_engine(script, &env, &cwd, options.stdin.as_deref())
                .await?
        };

        if !quiet {
            if !result.stdout.is_empty() {
                tracing::debug!(output = %result.stdout, "stdout");
            }
            if !result.stderr.is_empty() {
                tracing::info!(output = %result.stderr, "stderr");
            }
            tracing::info!(exit_code = result.exit_code, "exit");
        }
        Ok(result)
    }

    /// Initialize configured default runtimes up front: the vm bridge runs
    /// synchronously once the engine is in charge, so async loading has to
    /// happen here.
    async fn ensure_runtimes_ready(&self) -> Result<(), SessionError> {
        if self.inner.vm_handler.is_some() {
            return Ok(());
        }
        if self.inner.python_enabled && let Some(loader) = &self.inner.python_loader {
            self.inner
                .python_runtime
                .get_or_try_init(|| loader())
                .await
                .map_err(SessionError::HostCallback)?;
        }
        if self.inner.sqlite_enabled && let Some(loader) = &self.inner.sqlite_loader {
            self.inner
                .sqlite_runtime
                .get_or_try_init(|| loader())
                .await
                .map_err(SessionError::HostCallback)?;
        }
        Ok(())
    }

    /// Fast path: dispatch a simple pipeline over registered commands without
    /// entering the engine. Returns `None` whenever the script is not
    /// recognized; the engine remains authoritative for those.
    async fn try_intercept(
        &self,
        script: &str,
        env: &HashMap<String, String>,
        cwd: &str,
        stdin: Option<&str>,
    ) -> Result<Option<ExecResult>, SessionError> {
        let names = self.inner.registry.lock().await.names();
        if names.is_empty() || !intercept::references_custom_command(script, &names) {
            return Ok(None);
        }
        let Some(stages) = intercept::split_pipeline(script) else {
            return Ok(None);
        };

        let mut input = stdin.unwrap_or("").to_string();
        let mut stdout = String::new();
        let mut exit_code = 0;
        let mut stderr_parts: Vec<String> = Vec::new();

        for stage in &stages {
            let Some(args) = intercept::split_args(stage) else {
                return Ok(None);
            };
            let command = {
                let mut registry = self.inner.registry.lock().await;
                registry
                    .resolve(&args[0])
                    .await
                    .map_err(SessionError::HostCallback)?
            };

            let output = match command {
                Some(command) => {
                    let ctx = CommandContext {
                        fs: Arc::new(self.inner.fs.clone()) as Arc<dyn VirtualFs>,
                        cwd: cwd.to_string(),
                        env: env.clone(),
                        stdin: input.clone(),
                        executor: Arc::new(SessionExecutor {
                            session: self.clone(),
                            env: env.clone(),
                            cwd: cwd.to_string(),
                        }),
                    };
                    command
                        .execute(&args[1..], ctx)
                        .await
                        .map_err(SessionError::HostCallback)?
                }
                None => {
                    // Not ours: this single stage goes through the engine
                    // with the pipeline's current input.
                    let result = self.exec_engine(stage, env, cwd, Some(&input)).await?;
                    CommandOutput {
                        stdout: result.stdout,
                        stderr: result.stderr,
                        exit_code: result.exit_code,
                    }
                }
            };

            stdout = output.stdout;
            exit_code = output.exit_code;
            input = stdout.clone();
            if !output.stderr.is_empty() {
                stderr_parts.push(output.stderr);
            }
        }

        Ok(Some(ExecResult {
            stdout,
            stderr: stderr_parts.concat(),
            exit_code,
            env: env.clone(),
        }))
    }

    /// Run a script through the engine with bridges installed, and merge the
    /// returned state back into the filesystem shadow.
    async fn exec_engine(
        &self,
        script: &str,
        env: &HashMap<String, String>,
        cwd: &str,
        stdin: Option<&str>,
    ) -> Result<ExecResult, SessionError> {
        let mut script_to_run = script.to_string();
        if let Some(stdin) = stdin
            && !stdin.is_empty()
        {
            script_to_run = format!(
                "printf '%s' {} | {script_to_run}",
                shell_single_quote(stdin)
            );
        }
        let names = self.inner.registry.lock().await.names();
        if !names.is_empty() {
            script_to_run = format!("{}\n{script_to_run}", build_prelude(&names));
        }

        let limits_json = self.inner.limits.encode_json();
        let layout = if self.inner.default_layout {
            LayoutMode::Default
        } else {
            LayoutMode::Minimal
        };
        let snapshot = self.inner.fs.snapshot_json();
        let invocation = EngineInvocation {
            script: script_to_run,
            env_json: serde_json::to_string(env)?,
            files_json: snapshot.files,
            dirs_json: snapshot.dirs,
            links_json: snapshot.links,
            modes_json: snapshot.modes,
            cwd: cwd.to_string(),
            limits_json: limits_json.clone(),
            layout,
        };

        let bridges = self.build_bridges(limits_json, layout, !names.is_empty()).await;
        let guard = bridge::install(bridges);
        let engine = Arc::clone(&self.inner.engine);
        let joined = tokio::task::spawn_blocking(move || engine.execute(&invocation)).await;
        drop(guard);

        let result_json = joined.map_err(|error| SessionError::EngineExecution(error.to_string()))?;
        let state = EngineState::parse(&result_json)?;
        self.inner.fs.apply_state(&state);

        let exit_code = state.exit_code();
        Ok(ExecResult {
            stdout: state.stdout,
            stderr: state.stderr,
            exit_code,
            env: state.env.unwrap_or_else(|| env.clone()),
        })
    }

    /// Assemble the bridge set for one engine call from the configured
    /// capabilities.
    async fn build_bridges(
        &self,
        limits_json: String,
        layout: LayoutMode,
        has_commands: bool,
    ) -> BridgeSet {
        let mut set = BridgeSet {
            sleep: Some(make_sleep_bridge(self.inner.sleeper.clone())),
            now: Some(make_now_bridge(self.inner.clock.clone())),
            ..Default::default()
        };
        if let Some(fetcher) = &self.inner.fetcher {
            set.fetch = Some(make_fetch_bridge(Arc::clone(fetcher)));
        }
        if self.inner.vm_handler.is_some()
            || self.inner.python_enabled
            || self.inner.sqlite_enabled
        {
            set.vm = Some(self.make_vm_bridge());
        }
        if has_commands {
            set.custom = Some(make_custom_bridge(
                Arc::clone(&self.inner.registry),
                Arc::clone(&self.inner.engine),
                limits_json,
                layout,
            ));
        }
        set
    }

    fn make_vm_bridge(&self) -> JsonBridge {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |request_json: &str| {
            let response = vm_dispatch(&inner, request_json);
            bridge::vm_encode(&response)
        })
    }
}

/// Route one nested-runtime request. Total: every failure mode becomes a
/// well-formed error response.
fn vm_dispatch(inner: &Arc<SessionInner>, request_json: &str) -> VmResponse {
    let request = match serde_json::from_str::<VmRequest>(request_json) {
        Ok(request) => request,
        Err(error) => return VmResponse::failure(format!("malformed vm request: {error}")),
    };

    if let Some(handler) = &inner.vm_handler {
        let handler = Arc::clone(handler);
        return match wait_for(async move { handler.run(request).await }) {
            Ok(response) => response,
            Err(error) => VmResponse::failure(error.to_string()),
        };
    }

    match request.runtime.as_str() {
        "python3" => {
            if !inner.python_enabled {
                return VmResponse::unavailable(
                    "python3 runtime is disabled",
                    vm::normalize_files(&request.files),
                );
            }
            let Some(runtime) = inner.python_runtime.get() else {
                return VmResponse::unavailable(
                    "python3 runtime is not initialized",
                    vm::normalize_files(&request.files),
                );
            };
            match inner.python_sync.run(runtime.as_ref(), &request) {
                Ok(response) => response,
                Err(error) => VmResponse::failure(error.to_string()),
            }
        }
        "sqlite3" => {
            if !inner.sqlite_enabled {
                return VmResponse::unavailable(
                    "sqlite3 runtime is disabled",
                    vm::normalize_files(&request.files),
                );
            }
            let Some(runtime) = inner.sqlite_runtime.get() else {
                return VmResponse::unavailable(
                    "sqlite3 runtime is not initialized",
                    vm::normalize_files(&request.files),
                );
            };
            match vm::run_database(runtime.as_ref(), &request) {
                Ok(response) => response,
                Err(error) => VmResponse::failure(error.to_string()),
            }
        }
        other => VmResponse::unavailable(
            format!("unsupported vm runtime: {other}"),
            vm::normalize_files(&request.files),
        ),
    }
}

/// Shell-function prelude delegating each registered name to the custom
/// bridge builtin.
fn build_prelude(names: &[String]) -> String {
    names
        .iter()
        .map(|name| {
            format!(
                "{name}() {{ {CUSTOM_BUILTIN} {} \"$@\"; }}",
                shell_single_quote(name)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Session-backed nested executor for commands running on the fast path.
struct SessionExecutor {
    session: Session,
    env: HashMap<String, String>,
    cwd: String,
}

#[async_trait]
impl ScriptExecutor for SessionExecutor {
    async fn exec(&self, script: &str, options: ExecOptions) -> anyhow::Result<CommandOutput> {
        let mut env = self.env.clone();
        env.extend(options.env);
        let result = self
            .session
            .exec(
                script,
                ExecOptions {
                    cwd: Some(options.cwd.unwrap_or_else(|| self.cwd.clone())),
                    env,
                    stdin: options.stdin,
                },
            )
            .await?;
        Ok(CommandOutput {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
        })
    }
}
