//! Middleware for previewing a production build.
//!
//! The SSR build emits an `entry.preview` module whose default export is
//! either a middleware function or a `{ router, notFound }` pair. Anything
//! unusable turns into a middleware answering `400 text/plain` with the
//! reason, so the preview server keeps running.
//!
//! [`SandboxPreviewLoader`] loads the entry into a [`JsSandbox`] rooted at the
//! SSR output dir and runs its handlers there.

use crate::error::PreviewError;
use crate::middleware::{DispatchFailure, Flow, Handler, Middleware, ResponseSink};
use crate::sandbox::{DefaultExport, HandlerRequest, HandlerResponse, JsSandbox};
use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Request, StatusCode};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, error, warn};

/// Extensions tried for the preview entry, in order.
const PREVIEW_EXTENSIONS: &[&str] = &["mjs", "cjs", "js"];

/// Default export of a preview module.
#[derive(Clone)]
pub enum PreviewExport {
    /// A single middleware function.
    Function(Handler),
    /// A router plus an optional not-found handler.
    Object {
        router: Option<Handler>,
        not_found: Option<Handler>,
    },
    /// No default export.
    Missing,
}

impl fmt::Debug for PreviewExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(_) => f.write_str("PreviewExport::Function"),
            Self::Object { router, not_found } => f
                .debug_struct("PreviewExport::Object")
                .field("router", &router.is_some())
                .field("not_found", &not_found.is_some())
                .finish(),
            Self::Missing => f.write_str("PreviewExport::Missing"),
        }
    }
}

/// Loads the default export of a built preview module.
#[async_trait]
pub trait PreviewModuleLoader: Send + Sync {
    async fn load(&self, path: &Path) -> Result<PreviewExport, PreviewError>;
}

/// First `entry.preview.{mjs,cjs,js}` present in `ssr_out_dir`.
pub async fn locate_preview_entry(ssr_out_dir: &Path) -> Option<PathBuf> {
    for ext in PREVIEW_EXTENSIONS {
        let candidate = ssr_out_dir.join(format!("entry.preview.{ext}"));
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return Some(candidate);
        }
    }
    None
}

/// Middlewares serving the preview build in `ssr_out_dir`.
pub async fn configure_preview_server(
    ssr_out_dir: &Path,
    loader: &dyn PreviewModuleLoader,
) -> Vec<Middleware> {
    match preview_middleware(ssr_out_dir, loader).await {
        Ok(middleware) => vec![middleware],
        Err(err) => vec![invalid_preview_message(err.to_string())],
    }
}

async fn preview_middleware(
    ssr_out_dir: &Path,
    loader: &dyn PreviewModuleLoader,
) -> Result<Middleware, PreviewError> {
    let path = locate_preview_entry(ssr_out_dir)
        .await
        .ok_or_else(|| PreviewError::EntryMissing {
            ssr_out_dir: ssr_out_dir.to_path_buf(),
        })?;
    debug!(entry = %path.display(), "loading preview entry");

    match loader.load(&path).await? {
        PreviewExport::Function(handler) => Ok(Middleware::Single(handler)),
        PreviewExport::Object {
            router: Some(router),
            not_found: Some(not_found),
        } => Ok(Middleware::RouterWithNotFound { router, not_found }),
        PreviewExport::Object {
            router: Some(router),
            not_found: None,
        } => Ok(Middleware::Single(router)),
        PreviewExport::Object { router: None, .. } | PreviewExport::Missing => {
            Err(PreviewError::NoDefaultMiddleware { path })
        }
    }
}

/// Preview loader running the entry inside a sandbox.
///
/// The sandbox must be rooted at the SSR output dir. Handlers block the
/// calling worker thread until the isolate answers, so the middleware chain
/// has to run on a multi-threaded tokio runtime.
#[derive(Debug, Clone)]
pub struct SandboxPreviewLoader {
    sandbox: JsSandbox,
}

impl SandboxPreviewLoader {
    pub fn new(sandbox: JsSandbox) -> Self {
        Self { sandbox }
    }

    fn handler(&self, specifier: &str, member: Option<&'static str>) -> Handler {
        let sandbox = self.sandbox.clone();
        let specifier = specifier.to_string();
        Arc::new(move |req: &Request<()>, res: &mut dyn ResponseSink| {
            let request = HandlerRequest::from_http(req);
            let response = block_on_sandbox(sandbox.call_handler(&specifier, member, &request))
                .and_then(|response| response.map_err(PreviewError::from));
            match response {
                Ok(response) => apply_response(response, res),
                Err(err) => {
                    let message = err.to_string();
                    Flow::Error(DispatchFailure {
                        report: format!("{message} ({specifier})"),
                        message,
                    })
                }
            }
        })
    }
}

#[async_trait]
impl PreviewModuleLoader for SandboxPreviewLoader {
    async fn load(&self, path: &Path) -> Result<PreviewExport, PreviewError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| PreviewError::Load(format!("invalid preview entry {}", path.display())))?;
        let specifier = format!("./{}", file_name.to_string_lossy());

        let shape = self
            .sandbox
            .describe_default(&specifier)
            .await
            .map_err(|err| PreviewError::Load(err.to_string()))?;
        debug!(?shape, %specifier, "preview entry loaded");

        Ok(match shape {
            DefaultExport::Function => PreviewExport::Function(self.handler(&specifier, None)),
            DefaultExport::Object { router, not_found } => PreviewExport::Object {
                router: router.then(|| self.handler(&specifier, Some("router"))),
                not_found: not_found.then(|| self.handler(&specifier, Some("notFound"))),
            },
            DefaultExport::Missing => PreviewExport::Missing,
        })
    }
}

/// Drive a sandbox call to completion from synchronous middleware.
fn block_on_sandbox<F: Future>(future: F) -> Result<F::Output, PreviewError> {
    let handle = Handle::try_current().map_err(|_| PreviewError::RuntimeFlavor)?;
    if handle.runtime_flavor() != RuntimeFlavor::MultiThread {
        return Err(PreviewError::RuntimeFlavor);
    }
    Ok(tokio::task::block_in_place(|| handle.block_on(future)))
}

fn apply_response(response: HandlerResponse, res: &mut dyn ResponseSink) -> Flow {
    if let Some(message) = response.error {
        return Flow::Error(DispatchFailure {
            report: message.clone(),
            message,
        });
    }
    if !response.handled {
        return Flow::Next;
    }

    for (name, value) in &response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => res.set_header(name, value),
            _ => warn!(header = %name, "dropping invalid preview response header"),
        }
    }
    let status = StatusCode::from_u16(response.status).unwrap_or_else(|_| {
        warn!(status = response.status, "invalid preview status");
        StatusCode::INTERNAL_SERVER_ERROR
    });
    res.write_head(status);
    for chunk in &response.body {
        if let Err(err) = res.write(chunk.as_bytes()) {
            debug!(error = %err, "could not write preview body");
            break;
        }
    }
    res.end();
    Flow::Done
}

/// Middleware answering every request with `400` and `message`.
pub fn invalid_preview_message(message: String) -> Middleware {
    error!("{message}");
    Middleware::single(move |_: &Request<()>, res: &mut dyn ResponseSink| {
        res.set_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        res.write_head(StatusCode::BAD_REQUEST);
        if let Err(err) = res.write(message.as_bytes()) {
            debug!(error = %err, "could not write preview error");
        }
        res.end();
        Flow::Done
    })
}
