//! Deployment artifacts for an edge-pages host, and the dev middleware
//! exposing the platform bindings to loaders.

use crate::error::AdapterError;
use crate::middleware::{Flow, Middleware, ResponseSink};
use http::Request;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Built server entry re-exported by `_worker.js`.
pub const SERVER_ENTRY: &str = "entry.cloudflare-pages";

/// Origin used for static generation when neither `CF_PAGES_URL` nor `ORIGIN` is set.
pub const DEFAULT_ORIGIN: &str = "https://your.cloudflare.pages.dev";

#[derive(Debug, Clone)]
pub struct PagesAdapterOptions {
    /// Emit `_routes.json` (function invocation routes).
    pub function_routes: bool,
    /// Pathnames prerendered as static files. They only feed static
    /// generation; `_routes.json` is unaffected.
    pub static_paths: Vec<String>,
}

impl Default for PagesAdapterOptions {
    fn default() -> Self {
        Self {
            function_routes: true,
            static_paths: Vec::new(),
        }
    }
}

/// Which requests invoke the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutesJson {
    pub version: u32,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl RoutesJson {
    /// Everything under `base` except build output and assets.
    pub fn for_base(base: &str) -> Self {
        Self {
            version: 1,
            include: vec![format!("{base}*")],
            exclude: vec![format!("{base}build/*"), format!("{base}assets/*")],
        }
    }
}

/// Files written by [`generate`]; `None` when one already existed or was disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedArtifacts {
    pub routes_json: Option<PathBuf>,
    pub worker_js: Option<PathBuf>,
}

/// Site origin from `CF_PAGES_URL`, then `ORIGIN`.
pub fn adapter_origin(lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup("CF_PAGES_URL")
        .or_else(|| lookup("ORIGIN"))
        .unwrap_or_else(|| DEFAULT_ORIGIN.to_string())
}

/// Write `_routes.json` and `_worker.js` into the client output dir.
///
/// Existing files are never overwritten.
pub async fn generate(
    client_out_dir: &Path,
    server_out_dir: &Path,
    base_pathname: &str,
    opts: &PagesAdapterOptions,
) -> Result<GeneratedArtifacts, AdapterError> {
    let mut artifacts = GeneratedArtifacts::default();

    let routes_json_path = client_out_dir.join("_routes.json");
    if opts.function_routes && !exists(&routes_json_path).await? {
        let routes = serde_json::to_string_pretty(&RoutesJson::for_base(base_pathname))?;
        write(&routes_json_path, routes).await?;
        artifacts.routes_json = Some(routes_json_path);
    } else {
        debug!(path = %routes_json_path.display(), "keeping routing rules");
    }

    let worker_js_path = client_out_dir.join("_worker.js");
    if !exists(&worker_js_path).await? {
        let import_path = worker_import_path(
            &absolute(client_out_dir)?,
            &absolute(&server_out_dir.join(SERVER_ENTRY))?,
        );
        write(
            &worker_js_path,
            format!("import {{ fetch }} from \"{import_path}\"; export default {{ fetch }};"),
        )
        .await?;
        artifacts.worker_js = Some(worker_js_path);
    }

    info!(?artifacts, "adapter artifacts generated");
    Ok(artifacts)
}

async fn exists(path: &Path) -> Result<bool, AdapterError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|source| AdapterError::Write {
            path: path.to_path_buf(),
            source,
        })
}

fn absolute(path: &Path) -> Result<PathBuf, AdapterError> {
    std::path::absolute(path).map_err(|source| AdapterError::Write {
        path: path.to_path_buf(),
        source,
    })
}

async fn write(path: &Path, contents: String) -> Result<(), AdapterError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| AdapterError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// `target` relative to `from`, with forward slashes and a leading `./` or `../`.
///
/// Both paths must be absolute.
fn worker_import_path(from: &Path, target: &Path) -> String {
    let from = normalize(from);
    let target = normalize(target);
    let common = from
        .iter()
        .zip(&target)
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<String> = vec![String::from(".."); from.len() - common];
    parts.extend(target[common..].iter().cloned());
    let relative = parts.join("/");
    if relative.starts_with("..") {
        relative
    } else {
        format!("./{relative}")
    }
}

/// Lexically resolved path segments, without root, `.` or `..`.
fn normalize(path: &Path) -> Vec<String> {
    let mut segments = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_string_lossy().into_owned()),
            Component::ParentDir => {
                segments.pop();
            }
            Component::Prefix(prefix) => {
                segments.clear();
                segments.push(prefix.as_os_str().to_string_lossy().into_owned());
            }
            Component::RootDir | Component::CurDir => {}
        }
    }
    segments
}

/// Dev middleware publishing `devPlatform: { env: bindings }` in the
/// response-scoped env data.
pub fn platform_bindings_middleware(bindings: Map<String, Value>) -> Middleware {
    Middleware::single(move |_: &Request<()>, res: &mut dyn ResponseSink| {
        res.env_data_mut()
            .insert("devPlatform".to_string(), json!({ "env": bindings }));
        Flow::Next
    })
}
