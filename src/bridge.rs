//! Remote functions the dev server calls inside the sandbox.
//!
//! [`SandboxRegistry`] binds a single [`SandboxFunctions`] to one sandbox
//! runtime per dev server. Payloads are plain JSON; render output comes back
//! through a byte stream fed by a tracked background task.

use crate::config::BridgeConfig;
use crate::context::{SerializedRenderOptions, SerializedRequestEvent, WIRE_SCHEMA_VERSION};
use crate::error::{BridgeError, SandboxError};
use crate::sandbox::{SandboxModule, SandboxRuntime};
use crate::serialize::reconstruct;
use crate::stream::{self, BodyStream};
use crate::tasks::{BackgroundTasks, TaskHandle};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, instrument, warn};

/// Returned by `runLoader` when the loader never became importable.
pub const LOADER_IMPORT_ERROR: &str = "Error: failed to import loader!";

/// Render exports looked up on the entry module, in order.
const RENDER_EXPORTS: &[&str] = &["default", "render"];

// ============================================================================
// Symbol mapping
// ============================================================================

/// Maps a symbol name to the chunk that defines it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolMapper {
    src_base: String,
}

impl SymbolMapper {
    pub fn new(src_base: impl Into<String>) -> Self {
        Self {
            src_base: src_base.into(),
        }
    }

    /// Look the symbol's hash up in `mapping`, falling back to
    /// `[symbol, "/{src_base}/{symbol lowercased}.js"]`.
    pub fn resolve(&self, symbol: &str, mapping: Option<&Map<String, Value>>) -> Value {
        mapping
            .and_then(|mapping| mapping.get(symbol_hash(symbol)))
            .filter(|chunk| !chunk.is_null())
            .cloned()
            .unwrap_or_else(|| self.default_chunk(symbol))
    }

    fn default_chunk(&self, symbol: &str) -> Value {
        json!([
            symbol,
            format!("/{}/{}.js", self.src_base, symbol.to_lowercase())
        ])
    }
}

/// Hash part of a symbol name: everything after the last `_`, or the whole name.
pub fn symbol_hash(symbol: &str) -> &str {
    symbol.rsplit_once('_').map_or(symbol, |(_, hash)| hash)
}

// ============================================================================
// Remote function surface
// ============================================================================

/// Names of the remote functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFunction {
    RenderApp,
    RunLoader,
}

impl RemoteFunction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RenderApp => "renderApp",
            Self::RunLoader => "runLoader",
        }
    }
}

impl fmt::Display for RemoteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemoteFunction {
    type Err = BridgeError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "renderApp" => Ok(Self::RenderApp),
            "runLoader" => Ok(Self::RunLoader),
            other => Err(BridgeError::UnknownFunction(other.to_string())),
        }
    }
}

/// Arguments of `renderApp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderAppArgs {
    pub entry_point: String,
    pub render_opts: Option<SerializedRenderOptions>,
    pub src_base: String,
}

/// Arguments of `runLoader`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLoaderArgs {
    pub module_file_path: String,
    pub loader_name: String,
    pub request_ev: SerializedRequestEvent,
}

/// Result of `renderApp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Fully buffered document.
    Html(String),
    /// No render options survived reconstruction; nothing was rendered.
    Skipped,
}

/// Result of `runLoader`. Loader failures are values, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderOutcome {
    Value(Value),
    Error(String),
}

impl LoaderOutcome {
    pub fn into_value(self) -> Value {
        match self {
            Self::Value(value) => value,
            Self::Error(message) => Value::String(message),
        }
    }
}

/// A render in flight: the live body and the task producing it.
#[derive(Debug)]
pub struct StreamingRender {
    pub body: BodyStream,
    pub task: TaskHandle,
}

// ============================================================================
// Registry
// ============================================================================

/// Holds the remote functions of one dev server.
#[derive(Debug, Default)]
pub struct SandboxRegistry {
    functions: OnceLock<Arc<SandboxFunctions>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the functions to `runtime`. Later calls return the existing binding.
    pub fn register_once(
        &self,
        runtime: Arc<dyn SandboxRuntime>,
        config: BridgeConfig,
    ) -> Arc<SandboxFunctions> {
        self.functions
            .get_or_init(|| {
                info!("sandbox functions registered");
                Arc::new(SandboxFunctions::new(runtime, config))
            })
            .clone()
    }

    pub fn functions(&self) -> Result<Arc<SandboxFunctions>, BridgeError> {
        self.functions.get().cloned().ok_or(BridgeError::NotInitialized)
    }
}

/// `renderApp` and `runLoader` bound to a sandbox runtime.
pub struct SandboxFunctions {
    runtime: Arc<dyn SandboxRuntime>,
    config: BridgeConfig,
    tasks: BackgroundTasks,
}

impl fmt::Debug for SandboxFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxFunctions")
            .field("config", &self.config)
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

impl SandboxFunctions {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: BridgeConfig) -> Self {
        Self {
            runtime,
            config,
            tasks: BackgroundTasks::new(),
        }
    }

    /// Background renders; join them with [`BackgroundTasks::shutdown`].
    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    /// Dispatch a remote call by name with a JSON payload.
    pub async fn invoke(&self, name: &str, payload: Value) -> Result<Value, BridgeError> {
        match name.parse::<RemoteFunction>()? {
            RemoteFunction::RenderApp => {
                let args = serde_json::from_value(payload).map_err(|source| {
                    BridgeError::InvalidPayload {
                        function: RemoteFunction::RenderApp.as_str(),
                        source,
                    }
                })?;
                Ok(match self.render_app(args).await? {
                    RenderOutcome::Html(html) => Value::String(html),
                    RenderOutcome::Skipped => Value::Null,
                })
            }
            RemoteFunction::RunLoader => {
                let args = serde_json::from_value(payload).map_err(|source| {
                    BridgeError::InvalidPayload {
                        function: RemoteFunction::RunLoader.as_str(),
                        source,
                    }
                })?;
                Ok(self.run_loader(args).await?.into_value())
            }
        }
    }

    /// Render the app and buffer the whole document.
    pub async fn render_app(&self, args: RenderAppArgs) -> Result<RenderOutcome, BridgeError> {
        match self.start_render(args).await? {
            Some(render) => Ok(RenderOutcome::Html(render.body.text().await)),
            None => Ok(RenderOutcome::Skipped),
        }
    }

    /// Start a render and hand back the live body.
    ///
    /// The render runs as a background task that closes the body once the
    /// render function settles. `None` when the render options could not be
    /// reconstructed.
    #[instrument(skip_all, fields(entry = %args.entry_point))]
    pub async fn start_render(
        &self,
        args: RenderAppArgs,
    ) -> Result<Option<StreamingRender>, BridgeError> {
        let RenderAppArgs {
            entry_point,
            render_opts,
            src_base,
        } = args;

        let entry = self.runtime.import(&entry_point).await?;
        let export = render_export(entry.as_ref())
            .ok_or_else(|| BridgeError::MissingRenderExport(entry_point.clone()))?;

        let render_opts = render_opts.filter(|opts| {
            let supported = opts.schema_version == WIRE_SCHEMA_VERSION;
            if !supported {
                warn!(found = opts.schema_version, "unsupported render options schema");
            }
            supported
        });
        let Some(options) =
            reconstruct(render_opts, self.runtime.as_ref(), SymbolMapper::new(src_base)).await
        else {
            debug!("no render options, skipping render");
            return Ok(None);
        };

        let (writer, body) = stream::pair();
        let task = self.tasks.spawn(format!("render {entry_point}"), async move {
            let result = entry.render(export, options, writer.clone()).await;
            writer.close();
            result
        });
        Ok(Some(StreamingRender { body, task }))
    }

    /// Import a module and run one of its loaders against `request_ev`.
    ///
    /// The sandbox's env bindings are merged over the event's platform env.
    #[instrument(skip_all, fields(module = %args.module_file_path, loader = %args.loader_name))]
    pub async fn run_loader(&self, args: RunLoaderArgs) -> Result<LoaderOutcome, BridgeError> {
        let RunLoaderArgs {
            module_file_path,
            loader_name,
            mut request_ev,
        } = args;
        request_ev.platform.env.extend(self.runtime.env());

        let Some(module) = self.import_loader(&module_file_path, &loader_name).await? else {
            return Ok(LoaderOutcome::Error(LOADER_IMPORT_ERROR.to_string()));
        };

        match module.call_loader(&loader_name, &request_ev).await {
            Ok(value) => Ok(LoaderOutcome::Value(value)),
            Err(SandboxError::Closed) => Err(SandboxError::Closed.into()),
            Err(SandboxError::Script(message)) => Ok(LoaderOutcome::Error(format!("Error: {message}"))),
            Err(err) => Ok(LoaderOutcome::Error(format!("Error: {err}"))),
        }
    }

    /// Import `path` until it exports `loader_name`, with a fixed backoff.
    async fn import_loader(
        &self,
        path: &str,
        loader_name: &str,
    ) -> Result<Option<Arc<dyn SandboxModule>>, BridgeError> {
        let attempts = self.config.loader_attempts.max(1);
        for attempt in 1..=attempts {
            match self.runtime.import(path).await {
                Ok(module) if module.has_export(loader_name) => return Ok(Some(module)),
                Ok(_) => debug!(attempt, "loader export not found yet"),
                Err(SandboxError::Closed) => return Err(SandboxError::Closed.into()),
                Err(err) => debug!(attempt, error = %err, "loader import failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.loader_retry_backoff).await;
            }
        }
        warn!(attempts, "giving up on loader import");
        Ok(None)
    }
}

fn render_export(module: &dyn SandboxModule) -> Option<&'static str> {
    RENDER_EXPORTS
        .iter()
        .copied()
        .find(|name| module.has_export(name))
}
