//! V8 sandbox backed by `deno_core::JsRuntime`.
//!
//! The isolate lives on a dedicated OS thread with a single-threaded tokio
//! runtime. Commands are executed sequentially on that thread and only JSON
//! text (plus the render stream writer) crosses the channel.

use super::loader::SandboxedLoader;
use super::runtime::{create_runtime, drain_console, evaluate};
use super::ops::RenderSink;
use super::{SandboxModule, SandboxRuntime};
use crate::bridge::SymbolMapper;
use crate::config::SandboxConfig;
use crate::context::SerializedRequestEvent;
use crate::error::SandboxError;
use crate::manifest::DevModuleGraph;
use crate::serialize::RenderOptions;
use crate::stream::StreamWriter;
use async_trait::async_trait;
use deno_core::JsRuntime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Commands executed on the isolate thread.
enum Command {
    Import {
        specifier: String,
        reply: oneshot::Sender<Result<ImportedModule, SandboxError>>,
    },
    CallLoader {
        specifier: String,
        name: String,
        ev_json: String,
        reply: oneshot::Sender<Result<Value, SandboxError>>,
    },
    Render {
        specifier: String,
        export: String,
        options_json: String,
        route_modules: Vec<String>,
        symbol_mapper: SymbolMapper,
        writer: StreamWriter,
        reply: oneshot::Sender<Result<(), SandboxError>>,
    },
    DescribeDefault {
        specifier: String,
        reply: oneshot::Sender<Result<DefaultExport, SandboxError>>,
    },
    CallHandler {
        specifier: String,
        member: Option<String>,
        request_json: String,
        reply: oneshot::Sender<Result<HandlerResponse, SandboxError>>,
    },
}

/// Shape of a module's default export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DefaultExport {
    Function,
    #[serde(rename_all = "camelCase")]
    Object { router: bool, not_found: bool },
    Missing,
}

/// Plain request handed to a connect-style handler in the isolate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerRequest {
    pub method: String,
    pub url: String,
    pub original_url: String,
    /// Lower-cased names; repeated headers joined with `, `.
    pub headers: BTreeMap<String, String>,
}

impl HandlerRequest {
    pub fn from_http<B>(req: &http::Request<B>) -> Self {
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in req.headers() {
            let value = String::from_utf8_lossy(value.as_bytes());
            headers
                .entry(name.as_str().to_string())
                .and_modify(|joined| {
                    joined.push_str(", ");
                    joined.push_str(&value);
                })
                .or_insert_with(|| value.into_owned());
        }
        let url = req
            .uri()
            .path_and_query()
            .map_or_else(|| String::from("/"), |path| path.as_str().to_string());
        Self {
            method: req.method().to_string(),
            original_url: url.clone(),
            url,
            headers,
        }
    }
}

/// A body chunk written by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BodyChunk {
    Text(String),
    Bytes(Vec<u8>),
}

impl BodyChunk {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }
}

/// What a handler did with the response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HandlerResponse {
    /// The handler ended the response.
    pub handled: bool,
    /// Error passed to `next` or thrown by the handler.
    #[serde(default)]
    pub error: Option<String>,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Vec<BodyChunk>,
}

/// What the isolate reports about an imported module.
#[derive(Debug, Deserialize)]
struct ImportedModule {
    specifier: String,
    exports: Vec<String>,
}

/// Result envelope produced by every bridge function in the isolate.
#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

impl Envelope {
    fn parse(text: &str) -> Result<Self, SandboxError> {
        serde_json::from_str(text)
            .map_err(|e| SandboxError::Script(format!("malformed bridge response: {e}")))
    }

    /// The value on success; otherwise the error message.
    fn into_result(self) -> Result<Value, String> {
        if self.ok {
            Ok(self.value)
        } else {
            Err(self
                .error
                .unwrap_or_else(|| String::from("unknown sandbox error")))
        }
    }
}

/// A sandbox running a V8 isolate on its own thread.
#[derive(Debug, Clone)]
pub struct JsSandbox {
    commands: mpsc::UnboundedSender<Command>,
    env: Map<String, Value>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Import { specifier, .. } => write!(f, "Import({specifier})"),
            Self::CallLoader { specifier, name, .. } => write!(f, "CallLoader({specifier}#{name})"),
            Self::Render { specifier, export, .. } => write!(f, "Render({specifier}#{export})"),
            Self::DescribeDefault { specifier, .. } => write!(f, "DescribeDefault({specifier})"),
            Self::CallHandler { specifier, member, .. } => {
                write!(f, "CallHandler({specifier}#{})", member.as_deref().unwrap_or("default"))
            }
        }
    }
}

impl JsSandbox {
    /// Start the isolate thread. Loaded modules are recorded in `graph` when given.
    pub async fn spawn(
        config: SandboxConfig,
        graph: Option<DevModuleGraph>,
    ) -> Result<Self, SandboxError> {
        let env = config.env_bindings();
        let (commands, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name(String::from("ssr-sandbox"))
            .spawn(move || {
                let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(SandboxError::Startup(e.to_string())));
                        return;
                    }
                };
                tokio_rt.block_on(run_isolate(config, graph, rx, ready_tx));
            })
            .map_err(|e| SandboxError::Startup(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| SandboxError::Startup(String::from("sandbox thread exited during startup")))??;
        info!("sandbox ready");
        Ok(Self { commands, env })
    }

    fn send(&self, command: Command) -> Result<(), SandboxError> {
        self.commands.send(command).map_err(|_| SandboxError::Closed)
    }

    /// Import `specifier` and report the shape of its default export.
    pub async fn describe_default(&self, specifier: &str) -> Result<DefaultExport, SandboxError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::DescribeDefault {
            specifier: specifier.to_string(),
            reply,
        })?;
        response.await.map_err(|_| SandboxError::Closed)?
    }

    /// Run the default export of `specifier` (or its `member`) as a
    /// connect-style handler.
    pub async fn call_handler(
        &self,
        specifier: &str,
        member: Option<&str>,
        request: &HandlerRequest,
    ) -> Result<HandlerResponse, SandboxError> {
        let request_json =
            serde_json::to_string(request).map_err(|e| SandboxError::Script(e.to_string()))?;
        let (reply, response) = oneshot::channel();
        self.send(Command::CallHandler {
            specifier: specifier.to_string(),
            member: member.map(str::to_string),
            request_json,
            reply,
        })?;
        response.await.map_err(|_| SandboxError::Closed)?
    }
}

#[async_trait]
impl SandboxRuntime for JsSandbox {
    async fn import(&self, specifier: &str) -> Result<Arc<dyn SandboxModule>, SandboxError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Import {
            specifier: specifier.to_string(),
            reply,
        })?;
        let imported = response.await.map_err(|_| SandboxError::Closed)??;
        Ok(Arc::new(JsModule {
            specifier: imported.specifier,
            exports: imported.exports,
            commands: self.commands.clone(),
        }))
    }

    fn env(&self) -> Map<String, Value> {
        self.env.clone()
    }
}

/// A module imported into a [`JsSandbox`].
#[derive(Debug, Clone)]
pub struct JsModule {
    specifier: String,
    exports: Vec<String>,
    commands: mpsc::UnboundedSender<Command>,
}

impl JsModule {
    pub fn exports(&self) -> &[String] {
        &self.exports
    }
}

#[async_trait]
impl SandboxModule for JsModule {
    fn specifier(&self) -> &str {
        &self.specifier
    }

    fn has_export(&self, name: &str) -> bool {
        self.exports.iter().any(|export| export == name)
    }

    async fn call_loader(
        &self,
        name: &str,
        ev: &SerializedRequestEvent,
    ) -> Result<Value, SandboxError> {
        let ev_json = serde_json::to_string(ev).map_err(|e| SandboxError::Script(e.to_string()))?;
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::CallLoader {
                specifier: self.specifier.clone(),
                name: name.to_string(),
                ev_json,
                reply,
            })
            .map_err(|_| SandboxError::Closed)?;
        response.await.map_err(|_| SandboxError::Closed)?
    }

    async fn render(
        &self,
        export: &str,
        options: RenderOptions,
        writer: StreamWriter,
    ) -> Result<(), SandboxError> {
        let RenderOptions {
            options,
            route_modules,
            symbol_mapper,
        } = options;
        let options_json =
            serde_json::to_string(&options).map_err(|e| SandboxError::Script(e.to_string()))?;
        let route_modules = route_modules
            .iter()
            .map(|module| module.specifier().to_string())
            .collect();

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Render {
                specifier: self.specifier.clone(),
                export: export.to_string(),
                options_json,
                route_modules,
                symbol_mapper,
                writer,
                reply,
            })
            .map_err(|_| SandboxError::Closed)?;
        response.await.map_err(|_| SandboxError::Closed)?
    }
}

// ============================================================================
// Isolate thread
// ============================================================================

async fn run_isolate(
    config: SandboxConfig,
    graph: Option<DevModuleGraph>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    ready: oneshot::Sender<Result<(), SandboxError>>,
) {
    let loader = match SandboxedLoader::new(&config.chunks_dir) {
        Ok(loader) => match graph {
            Some(graph) => loader.with_graph(graph),
            None => loader,
        },
        Err(e) => {
            let _ = ready.send(Err(SandboxError::Startup(e.to_string())));
            return;
        }
    };
    let mut runtime = create_runtime(&config, loader.clone());
    let _ = ready.send(Ok(()));

    while let Some(command) = rx.recv().await {
        debug!(?command, "sandbox command");
        match command {
            Command::Import { specifier, reply } => {
                let result = import_module(&mut runtime, &loader, &specifier).await;
                let _ = reply.send(result);
            }
            Command::CallLoader {
                specifier,
                name,
                ev_json,
                reply,
            } => {
                let code = format!(
                    "globalThis.__ssr_bridge__.callLoader({}, {}, {ev_json})",
                    js_string(&specifier),
                    js_string(&name),
                );
                let result = bridge_call(&mut runtime, code)
                    .await
                    .and_then(|value| value.map_err(SandboxError::Script));
                let _ = reply.send(result);
            }
            Command::Render {
                specifier,
                export,
                options_json,
                route_modules,
                symbol_mapper,
                writer,
                reply,
            } => {
                {
                    let op_state = runtime.op_state();
                    let mut state = op_state.borrow_mut();
                    state.put(RenderSink(writer.clone()));
                    state.put(symbol_mapper);
                }
                let code = format!(
                    "globalThis.__ssr_bridge__.render({}, {}, {options_json}, {})",
                    js_string(&specifier),
                    js_string(&export),
                    serde_json::to_string(&route_modules).unwrap_or_else(|_| String::from("[]")),
                );
                let result = bridge_call(&mut runtime, code)
                    .await
                    .and_then(|value| value.map(drop).map_err(SandboxError::Script));
                runtime.op_state().borrow_mut().try_take::<RenderSink>();
                writer.close();
                let _ = reply.send(result);
            }
            Command::DescribeDefault { specifier, reply } => {
                let result: Result<DefaultExport, SandboxError> = async {
                    let resolved = loader.resolve_specifier(&specifier)?;
                    let code = format!(
                        "globalThis.__ssr_bridge__.describeDefault({})",
                        js_string(resolved.as_str())
                    );
                    let value = bridge_call(&mut runtime, code)
                        .await?
                        .map_err(|message| SandboxError::Import {
                            specifier: specifier.clone(),
                            message,
                        })?;
                    serde_json::from_value(value).map_err(|e| SandboxError::Script(e.to_string()))
                }
                .await;
                let _ = reply.send(result);
            }
            Command::CallHandler {
                specifier,
                member,
                request_json,
                reply,
            } => {
                let result: Result<HandlerResponse, SandboxError> = async {
                    let resolved = loader.resolve_specifier(&specifier)?;
                    let member = member.as_deref().map_or_else(|| String::from("null"), js_string);
                    let code = format!(
                        "globalThis.__ssr_bridge__.handle({}, {member}, {request_json})",
                        js_string(resolved.as_str()),
                    );
                    let value = bridge_call(&mut runtime, code)
                        .await?
                        .map_err(SandboxError::Script)?;
                    serde_json::from_value(value).map_err(|e| SandboxError::Script(e.to_string()))
                }
                .await;
                let _ = reply.send(result);
            }
        }
        drain_console(&mut runtime).emit();
    }
    debug!("sandbox command channel closed");
}

async fn import_module(
    runtime: &mut JsRuntime,
    loader: &SandboxedLoader,
    specifier: &str,
) -> Result<ImportedModule, SandboxError> {
    let resolved = loader.resolve_specifier(specifier)?;
    let code = format!(
        "globalThis.__ssr_bridge__.importModule({})",
        js_string(resolved.as_str())
    );
    let value = bridge_call(runtime, code)
        .await?
        .map_err(|message| SandboxError::Import {
            specifier: specifier.to_string(),
            message,
        })?;
    serde_json::from_value(value).map_err(|e| SandboxError::Script(e.to_string()))
}

/// Run a bridge function; the outer error is a failure of the isolate itself.
async fn bridge_call(
    runtime: &mut JsRuntime,
    code: String,
) -> Result<Result<Value, String>, SandboxError> {
    let text = evaluate(runtime, code).await?;
    Ok(Envelope::parse(&text)?.into_result())
}

/// Encode a string as a JS string literal.
fn js_string(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{RenderAppArgs, RenderOutcome, SandboxFunctions};
    use crate::config::BridgeConfig;
    use crate::context::{RenderContext, RouteData, RouteModulePath, ServerData};
    use crate::manifest::ModuleGraph;
    use crate::serialize::{serialize, serialize_request_event};
    use http::Method;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};
    use url::Url;

    const ENTRY: &str = r#"
export default async function render(opts) {
  const page = opts.serverData.qwikcity.loadedRoute[2].at(-1);
  opts.stream.write("<html><body>");
  await Promise.resolve();
  opts.stream.write(page.title);
  const chunk = opts.symbolMapper("s_abc123", { abc123: "/src/chunk.js" });
  opts.stream.write(`<i>${chunk}</i>`);
  console.log("rendered", opts.serverData.url);
  opts.stream.write("</body></html>");
}
"#;

    const PAGE: &str = r#"
export const title = "About";
export const useGreeting = {
  __qrl: function (ev) {
    return { greeting: `hi from ${ev.pathname}`, kv: ev.platform.env.KV ?? null };
  },
};
export function useBroken() {
  throw new Error("loader exploded");
}
"#;

    fn chunks_dir() -> TempDir {
        let dir = tempdir().unwrap();
        write(dir.path(), "src/entry.ssr.js", ENTRY);
        write(dir.path(), "src/routes/about/index.js", PAGE);
        dir
    }

    fn write(root: &Path, path: &str, code: &str) {
        let path = root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, code).unwrap();
    }

    async fn sandbox(dir: &TempDir, graph: Option<DevModuleGraph>) -> JsSandbox {
        let mut config = SandboxConfig {
            chunks_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.bindings.insert("KV".to_string(), json!("x"));
        JsSandbox::spawn(config, graph).await.unwrap()
    }

    #[tokio::test]
    async fn test_import_reports_exports() {
        let dir = chunks_dir();
        let sandbox = sandbox(&dir, None).await;

        let module = sandbox.import("/src/routes/about/index.js").await.unwrap();
        assert!(module.has_export("title"));
        assert!(module.has_export("useGreeting"));
        assert!(!module.has_export("default"));

        let err = sandbox.import("/src/missing.js").await.unwrap_err();
        assert!(matches!(err, SandboxError::Import { .. }));
    }

    #[tokio::test]
    async fn test_loader_runs_with_event_and_env() {
        let dir = chunks_dir();
        let functions = SandboxFunctions::new(Arc::new(sandbox(&dir, None).await), BridgeConfig::default());
        let url = Url::parse("http://localhost:5173/about").unwrap();
        let ev = serialize_request_event(&RouteData::new(&url, Method::GET).ev);

        let value = functions
            .invoke(
                "runLoader",
                json!({
                    "moduleFilePath": "/src/routes/about/index.js",
                    "loaderName": "useGreeting",
                    "requestEv": ev.clone(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(value, json!({ "greeting": "hi from /about", "kv": "x" }));

        let value = functions
            .invoke(
                "runLoader",
                json!({
                    "moduleFilePath": "/src/routes/about/index.js",
                    "loaderName": "useBroken",
                    "requestEv": ev,
                }),
            )
            .await
            .unwrap();
        assert_eq!(value, json!("Error: loader exploded"));
    }

    #[tokio::test]
    async fn test_render_app_streams_document_from_isolate() {
        let dir = chunks_dir();
        let graph = DevModuleGraph::new();
        let functions = SandboxFunctions::new(
            Arc::new(sandbox(&dir, Some(graph.clone())).await),
            BridgeConfig::default(),
        );

        let url = Url::parse("http://localhost:5173/about").unwrap();
        let mut route = RouteData::new(&url, Method::GET);
        route.loaded_route.modules = vec![RouteModulePath::new("/src/routes/about/index.js")];
        let options = serialize(&RenderContext {
            debug: true,
            snapshot: true,
            manifest: None,
            server_data: ServerData {
                url: url.to_string(),
                route: Some(route),
                ..Default::default()
            },
        })
        .unwrap();

        let outcome = functions
            .render_app(RenderAppArgs {
                entry_point: "./src/entry.ssr.js".to_string(),
                render_opts: Some(options),
                src_base: "src".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RenderOutcome::Html(
                "<html><body>About<i>/src/chunk.js</i></body></html>".to_string()
            )
        );
        functions.tasks().shutdown().await;

        let urls: Vec<_> = graph.modules().into_iter().map(|node| node.url).collect();
        assert!(urls.contains(&"/src/entry.ssr.js".to_string()));
        assert!(urls.contains(&"/src/routes/about/index.js".to_string()));
    }

    const PREVIEW: &str = r#"
export default {
  router(req, res, next) {
    if (req.url !== "/hello") return next();
    res.setHeader("Content-Type", "text/plain");
    res.statusCode = 201;
    res.write("hi ");
    res.end(new Uint8Array([111, 107]));
  },
  notFound(req, res) {
    res.writeHead(404, { "X-Missing": req.url });
    res.end("nope");
  },
};
"#;

    fn preview_request(path: &str) -> HandlerRequest {
        HandlerRequest::from_http(&http::Request::get(path).body(()).unwrap())
    }

    #[tokio::test]
    async fn test_describe_default_export() {
        let dir = chunks_dir();
        write(dir.path(), "entry.preview.mjs", PREVIEW);
        write(dir.path(), "handler.js", "export default () => {};");
        let sandbox = sandbox(&dir, None).await;

        assert_eq!(
            sandbox.describe_default("./entry.preview.mjs").await.unwrap(),
            DefaultExport::Object {
                router: true,
                not_found: true
            }
        );
        assert_eq!(
            sandbox.describe_default("./handler.js").await.unwrap(),
            DefaultExport::Function
        );
        assert_eq!(
            sandbox.describe_default("/src/routes/about/index.js").await.unwrap(),
            DefaultExport::Missing
        );
        assert!(sandbox.describe_default("./missing.mjs").await.is_err());
    }

    #[tokio::test]
    async fn test_call_handler_collects_response() {
        let dir = chunks_dir();
        write(dir.path(), "entry.preview.mjs", PREVIEW);
        let sandbox = sandbox(&dir, None).await;

        let response = sandbox
            .call_handler("./entry.preview.mjs", Some("router"), &preview_request("/hello"))
            .await
            .unwrap();
        assert!(response.handled);
        assert_eq!(response.status, 201);
        assert_eq!(response.headers["content-type"], "text/plain");
        assert_eq!(
            response.body,
            vec![BodyChunk::Text("hi ".to_string()), BodyChunk::Bytes(b"ok".to_vec())]
        );

        let passed = sandbox
            .call_handler("./entry.preview.mjs", Some("router"), &preview_request("/other"))
            .await
            .unwrap();
        assert!(!passed.handled);
        assert_eq!(passed.error, None);

        let missing = sandbox
            .call_handler("./entry.preview.mjs", Some("notFound"), &preview_request("/other"))
            .await
            .unwrap();
        assert_eq!(missing.status, 404);
        assert_eq!(missing.headers["x-missing"], "/other");
    }

    #[tokio::test]
    async fn test_call_handler_reports_thrown_error() {
        let dir = chunks_dir();
        write(
            dir.path(),
            "entry.preview.js",
            "export default async () => { throw new Error(\"preview exploded\"); };",
        );
        let sandbox = sandbox(&dir, None).await;

        let response = sandbox
            .call_handler("./entry.preview.js", None, &preview_request("/"))
            .await
            .unwrap();
        assert!(!response.handled);
        assert_eq!(response.error.as_deref(), Some("preview exploded"));
    }

    #[test]
    fn test_handler_request_joins_repeated_headers() {
        let req = http::Request::post("/api?x=1")
            .header("Accept", "text/html")
            .header("accept", "*/*")
            .body(())
            .unwrap();

        let request = HandlerRequest::from_http(&req);
        assert_eq!(request.method, "POST");
        assert_eq!(request.url, "/api?x=1");
        assert_eq!(request.original_url, "/api?x=1");
        assert_eq!(request.headers["accept"], "text/html, */*");
    }

    #[tokio::test]
    async fn test_spawn_fails_for_missing_chunks_dir() {
        let config = SandboxConfig {
            chunks_dir: "/definitely/not/here".into(),
            ..Default::default()
        };
        let err = JsSandbox::spawn(config, None).await.unwrap_err();
        assert!(matches!(err, SandboxError::Startup(_)));
    }

    #[test]
    fn test_envelope() {
        let ok = Envelope::parse(r#"{"ok":true,"value":{"a":1}}"#).unwrap();
        assert_eq!(ok.into_result(), Ok(json!({ "a": 1 })));
        let err = Envelope::parse(r#"{"ok":false,"error":"boom"}"#).unwrap();
        assert_eq!(err.into_result(), Err("boom".to_string()));
        assert!(Envelope::parse("not json").is_err());
    }
}
