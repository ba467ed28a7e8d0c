//! Error types for each layer of the bridge.

use std::path::PathBuf;

/// Failures while projecting a render context onto the wire schema.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    /// Server data carries no route data to forward.
    #[error("server data has no route data (`qwikcity`) to forward")]
    MissingRouteData,

    /// A prototype-pollution key was found in ambient server data.
    #[error("prototype pollution attempt: '{key}' key is forbidden in server data")]
    ForbiddenKey {
        /// The offending key.
        key: String,
    },

    /// Ambient server data is nested deeper than allowed.
    #[error("server data nesting too deep (max {max} levels)")]
    TooDeep {
        /// Maximum nesting depth.
        max: usize,
    },

    /// The payload was produced for another schema version.
    #[error("wire schema version {found} is not supported (expected {expected})")]
    UnsupportedVersion {
        /// Version found in the payload.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },

    /// The wire request event carries an unusable HTTP method.
    #[error("invalid HTTP method '{0}' in request event")]
    InvalidMethod(String),

    /// The wire request event carries an unparseable URL.
    #[error("invalid url '{url}' in request event: {source}")]
    InvalidUrl {
        /// The raw URL.
        url: String,
        /// Parse failure.
        #[source]
        source: url::ParseError,
    },

    /// JSON encoding or decoding failed.
    #[error("render options are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures raised by the sandbox runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    /// A dynamic import inside the sandbox failed.
    #[error("failed to import '{specifier}': {message}")]
    Import {
        /// Specifier that was imported.
        specifier: String,
        /// Failure reported by the sandbox.
        message: String,
    },

    /// A module does not export the requested name.
    #[error("module '{specifier}' has no export named '{name}'")]
    MissingExport {
        /// Module specifier.
        specifier: String,
        /// Export that was looked up.
        name: String,
    },

    /// Script evaluation inside the isolate failed or threw.
    #[error("script error: {0}")]
    Script(String),

    /// The sandbox thread has stopped.
    #[error("sandbox runtime is not running")]
    Closed,

    /// The sandbox could not be started.
    #[error("sandbox failed to start: {0}")]
    Startup(String),
}

/// Failures of the remote functions exposed to the sandbox.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// No sandbox functions were registered for this dev server.
    #[error("sandbox functions are not initialized")]
    NotInitialized,

    /// The remote function name is not known.
    #[error("unknown remote function: {0}")]
    UnknownFunction(String),

    /// The payload of a remote call does not match its argument shape.
    #[error("invalid payload for {function}: {source}")]
    InvalidPayload {
        /// Remote function name.
        function: &'static str,
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },

    /// The entry module exposes no render function.
    #[error("entry module '{0}' exports neither `default` nor `render`")]
    MissingRenderExport(String),

    /// The sandbox failed underneath the bridge.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Failures of the dev request dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The request URL could not be resolved against the origin.
    #[error("invalid request url '{url}': {source}")]
    InvalidUrl {
        /// Origin plus original URL.
        url: String,
        /// Parse failure.
        #[source]
        source: url::ParseError,
    },

    /// The host's index HTML transform failed.
    #[error("index html transform failed: {0}")]
    Transform(String),

    /// A remote sandbox call failed.
    #[error("render failed: {0}")]
    Bridge(#[from] BridgeError),

    /// Writing to the HTTP response failed.
    #[error("failed to write response: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while wiring the production preview middleware.
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    /// No built preview entry exists in the SSR output dir.
    #[error(
        "Unable to find output \"{}/entry.preview\" module.\n\nPlease ensure \"src/entry.preview.tsx\" has been built before the \"preview\" command.",
        .ssr_out_dir.display()
    )]
    EntryMissing {
        /// SSR output directory that was searched.
        ssr_out_dir: PathBuf,
    },

    /// The preview module's default export is not a middleware.
    #[error(
        "Entry preview module \"{}\" does not export a default middleware function",
        .path.display()
    )]
    NoDefaultMiddleware {
        /// Preview entry path.
        path: PathBuf,
    },

    /// Loading the preview module failed.
    #[error("{0}")]
    Load(String),

    /// Preview handlers block on the sandbox and need worker threads.
    #[error("preview handlers need a multi-threaded tokio runtime")]
    RuntimeFlavor,

    /// The sandbox failed while running a preview handler.
    #[error("preview handler failed: {0}")]
    Handler(#[from] SandboxError),
}

/// Failures while emitting deployment artifacts.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Writing or probing an artifact failed.
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        /// Artifact path.
        path: PathBuf,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// Encoding the routing rules failed.
    #[error("failed to encode routing rules: {0}")]
    Json(#[from] serde_json::Error),
}
