//! Dev-server middleware that server-renders page requests inside the sandbox.
//!
//! A request moves through
//! `Idle → Filtering → (Passthrough | BuildingContext) → Dispatched → Streaming → Completed | Failed`.
//! Whatever the outcome, a pending-render callback installed on the response
//! is resolved exactly once before [`DevDispatcher::handle`] returns.

use crate::bridge::{RenderAppArgs, RenderOutcome, SandboxFunctions};
use crate::config::DevServerConfig;
use crate::context::{
    LoadedRoute, RenderContext, RequestEvent, RouteData, SerializedRequestEvent, ServerData,
    RESERVED_SERVER_DATA_KEYS,
};
use crate::devtools;
use crate::error::{DispatchError, SerializeError};
use crate::filter::should_render;
use crate::manifest::{self, ModuleGraph};
use crate::middleware::{DispatchFailure, Flow, ResponseSink};
use crate::serialize;
use async_trait::async_trait;
use http::header::{
    HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONTENT_TYPE, HOST,
};
use http::{HeaderMap, Method, Request};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

const X_POWERED_BY: HeaderName = HeaderName::from_static("x-powered-by");

/// Headers sent with every dev-rendered document.
const SSR_HEADERS: [(HeaderName, &str); 4] = [
    (CONTENT_TYPE, "text/html; charset=utf-8"),
    (CACHE_CONTROL, "no-cache, no-store, max-age=0"),
    (ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (X_POWERED_BY, "Qwik Vite Dev Server"),
];

/// Hooks the dispatcher borrows from the dev-server host.
#[async_trait]
pub trait DevHost: Send + Sync {
    /// Apply the host's index-HTML transforms (client-only dev mode).
    async fn transform_index_html(&self, _url: &str, html: String) -> Result<String, DispatchError> {
        Ok(html)
    }

    /// Map generated-code positions in an error report back to sources.
    fn fix_stacktrace(&self, report: String) -> String {
        report
    }
}

/// Host without transforms or source maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainHost;

impl DevHost for PlainHost {}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Filtering,
    Passthrough,
    BuildingContext,
    Dispatched,
    Streaming,
    Completed,
    Failed,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Filtering => "filtering",
            Self::Passthrough => "passthrough",
            Self::BuildingContext => "building-context",
            Self::Dispatched => "dispatched",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn transition(state: &mut DispatchState, next: DispatchState) {
    debug!(from = %state, to = %next, "dispatch state");
    *state = next;
}

/// The SSR middleware of the dev server.
pub struct DevDispatcher {
    config: DevServerConfig,
    graph: Arc<dyn ModuleGraph>,
    functions: Arc<SandboxFunctions>,
    host: Arc<dyn DevHost>,
}

impl fmt::Debug for DevDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevDispatcher")
            .field("config", &self.config)
            .field("functions", &self.functions)
            .finish_non_exhaustive()
    }
}

impl DevDispatcher {
    pub fn new(
        config: DevServerConfig,
        graph: Arc<dyn ModuleGraph>,
        functions: Arc<SandboxFunctions>,
        host: Arc<dyn DevHost>,
    ) -> Self {
        info!("Expect significant performance loss in development.");
        info!("Disabling the browser's cache results in waterfall requests.");
        Self {
            config,
            graph,
            functions,
            host,
        }
    }

    pub fn config(&self) -> &DevServerConfig {
        &self.config
    }

    /// Handle one request. `Flow::Next` passes it on untouched.
    #[instrument(skip_all, fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle(&self, req: &Request<()>, res: &mut dyn ResponseSink) -> Flow {
        let mut state = DispatchState::Idle;
        let flow = match self.dispatch(req, res, &mut state).await {
            Ok(flow) => flow,
            Err(err) => {
                transition(&mut state, DispatchState::Failed);
                self.failure(&err)
            }
        };

        if let Some(resolve) = res.take_render_resolve() {
            resolve();
        }
        flow
    }

    async fn dispatch(
        &self,
        req: &Request<()>,
        res: &mut dyn ResponseSink,
        state: &mut DispatchState,
    ) -> Result<Flow, DispatchError> {
        transition(state, DispatchState::Filtering);
        let url = request_url(req, &self.config)?;
        if !should_render(req, &url) {
            transition(state, DispatchState::Passthrough);
            return Ok(Flow::Next);
        }

        transition(state, DispatchState::BuildingContext);
        let server_data = server_data(res.env_data(), &url, req.method(), req.headers());
        let status = res.status();

        if let Some(entry_url) = self.config.client_dev_entry_url() {
            let html = devtools::dev_index_html(&entry_url, &server_data.ambient_json());
            let html = self.host.transform_index_html(url.path(), html).await?;
            write_ssr_head(res, status);
            res.write(html.as_bytes())?;
            res.end();
            transition(state, DispatchState::Completed);
            return Ok(Flow::Done);
        }

        let mut snapshot = manifest::snapshot(self.graph.as_ref(), &self.config.root_dir_str());
        let context = RenderContext {
            debug: true,
            snapshot: true,
            manifest: Some(snapshot.clone()),
            server_data,
        };
        let render_opts = match serialize::serialize(&context) {
            Ok(options) => Some(options),
            Err(err) => {
                warn!(error = %err, "render context could not be serialized");
                None
            }
        };

        transition(state, DispatchState::Dispatched);
        let outcome = self
            .functions
            .render_app(RenderAppArgs {
                entry_point: self.config.entry_point.clone(),
                render_opts,
                src_base: self.config.src_base(),
            })
            .await?;
        let RenderOutcome::Html(html) = outcome else {
            transition(state, DispatchState::Passthrough);
            return Ok(Flow::Next);
        };

        transition(state, DispatchState::Streaming);
        write_ssr_head(res, status);
        for href in manifest::diff(self.graph.as_ref(), &mut snapshot) {
            res.write(format!(r#"<link rel="stylesheet" href="{href}">"#).as_bytes())?;
        }
        res.write(html.as_bytes())?;
        let footer =
            devtools::end_ssr_script(&self.config.dev_tools, &self.config.src_dir_or_default());
        res.write(footer.as_bytes())?;
        res.end();

        transition(state, DispatchState::Completed);
        Ok(Flow::Done)
    }

    fn failure(&self, err: &DispatchError) -> Flow {
        let report = self.host.fix_stacktrace(format_error(err));
        error!("{report}");
        Flow::Error(DispatchFailure {
            message: self.host.fix_stacktrace(err.to_string()),
            report,
        })
    }
}

/// Error middleware installed after the dispatcher: adds the overlay styles
/// to an unfinished response and keeps the error flowing.
pub fn error_overlay(failure: DispatchFailure, res: &mut dyn ResponseSink) -> Flow {
    if !res.is_ended() {
        if let Err(err) = res.write(devtools::error_overlay_style().as_bytes()) {
            debug!(error = %err, "could not write error overlay styles");
        }
    }
    Flow::Error(failure)
}

/// Origin of a request: `ORIGIN`, else protocol and host from the proxy
/// headers, the request URI or the `Host` header.
pub fn resolve_origin<B>(req: &Request<B>, config: &DevServerConfig) -> String {
    if let Some(origin) = &config.origin {
        return origin.clone();
    }
    let headers = req.headers();
    let protocol = configured_header(headers, config.protocol_header.as_deref())
        .unwrap_or_else(|| {
            let tls = req.uri().scheme_str() == Some("https");
            String::from(if tls { "https" } else { "http" })
        });
    let host = configured_header(headers, config.host_header.as_deref())
        .or_else(|| req.uri().authority().map(|authority| authority.to_string()))
        .or_else(|| header_str(headers, HOST.as_str()))
        .unwrap_or_else(|| String::from("localhost"));
    format!("{protocol}://{host}")
}

fn configured_header(headers: &HeaderMap, name: Option<&str>) -> Option<String> {
    name.and_then(|name| header_str(headers, &name.to_ascii_lowercase()))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn request_url<B>(req: &Request<B>, config: &DevServerConfig) -> Result<Url, DispatchError> {
    let origin = resolve_origin(req, config);
    let path = req
        .uri()
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str());
    Url::parse(&origin)
        .and_then(|base| base.join(path))
        .map_err(|source| DispatchError::InvalidUrl {
            url: format!("{origin}{path}"),
            source,
        })
}

fn write_ssr_head(res: &mut dyn ResponseSink, status: http::StatusCode) {
    for (name, value) in SSR_HEADERS {
        res.set_header(name, HeaderValue::from_static(value));
    }
    res.write_head(status);
}

/// Server data for a render: the response-scoped env data plus the absolute URL.
fn server_data(
    env_data: &Map<String, Value>,
    url: &Url,
    method: &Method,
    headers: &HeaderMap,
) -> ServerData {
    let mut fields = env_data.clone();
    let qwikcity = fields.remove("qwikcity");
    let locale = fields
        .get("locale")
        .and_then(Value::as_str)
        .map(str::to_string);
    let container_attributes = container_attributes(fields.get("containerAttributes"));
    fields.retain(|key, _| !RESERVED_SERVER_DATA_KEYS.contains(&key.as_str()));

    ServerData {
        url: url.to_string(),
        locale,
        container_attributes,
        route: Some(route_data(qwikcity, url, method, headers)),
        fields,
    }
}

/// String-valued container attributes; anything else is dropped.
fn container_attributes(value: Option<&Value>) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    match value {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (name, value) in map {
                match value {
                    Value::String(value) => {
                        attributes.insert(name.clone(), value.clone());
                    }
                    other => warn!(attribute = %name, value = %other, "ignoring non-string container attribute"),
                }
            }
        }
        Some(other) => warn!(value = %other, "ignoring containerAttributes that is not an object"),
    }
    attributes
}

/// Route data from the routing middleware's `qwikcity` entry, if any.
fn route_data(qwikcity: Option<Value>, url: &Url, method: &Method, headers: &HeaderMap) -> RouteData {
    let mut route = RouteData::new(url, method.clone());
    let Some(Value::Object(mut qwikcity)) = qwikcity else {
        route.ev.headers = headers.clone();
        return route;
    };

    let ev = qwikcity.remove("ev").map(|ev| {
        serde_json::from_value::<SerializedRequestEvent>(ev)
            .map_err(SerializeError::from)
            .and_then(RequestEvent::try_from)
    });
    match ev {
        Some(Ok(ev)) => route.ev = ev,
        Some(Err(err)) => warn!(error = %err, "ignoring unusable request event in env data"),
        None => {}
    }

    if let Some(loaded) = qwikcity.remove("loadedRoute") {
        match serde_json::from_value::<LoadedRoute>(loaded) {
            Ok(loaded) => {
                if route.ev.route.as_ref() == Some(&route.loaded_route) {
                    route.ev.params = loaded.params.clone();
                    route.ev.route = Some(loaded.clone());
                }
                route.loaded_route = loaded;
            }
            Err(err) => warn!(error = %err, "ignoring unusable loaded route in env data"),
        }
    }

    route.ev.headers = headers.clone();
    route.extra = qwikcity;
    route
}

/// Error message followed by its cause chain.
fn format_error(err: &dyn StdError) -> String {
    let mut report = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        report.push_str("\n  caused by: ");
        report.push_str(&cause.to_string());
        source = cause.source();
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::error::SandboxError;
    use crate::manifest::{DevModuleGraph, ModuleNode};
    use crate::middleware::BufferedResponse;
    use crate::serialize::RenderOptions;
    use crate::stream::StreamWriter;
    use crate::testing::{chunked_renderer, FakeModule, FakeSandbox, RenderFn};
    use futures::FutureExt;
    use http::header::ACCEPT;
    use http::StatusCode;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const ENTRY: &str = "./src/entry.ssr.js";

    fn page(path: &str) -> Request<()> {
        Request::get(path)
            .header(HOST, "localhost:5173")
            .header(ACCEPT, "text/html,application/xhtml+xml")
            .body(())
            .unwrap()
    }

    fn dispatcher_with(
        sandbox: FakeSandbox,
        graph: DevModuleGraph,
        config: DevServerConfig,
        host: Arc<dyn DevHost>,
    ) -> DevDispatcher {
        let functions = Arc::new(SandboxFunctions::new(Arc::new(sandbox), BridgeConfig::default()));
        DevDispatcher::new(config, Arc::new(graph), functions, host)
    }

    fn dispatcher(renderer: RenderFn, graph: DevModuleGraph) -> DevDispatcher {
        let sandbox = FakeSandbox::new().with(FakeModule::new(ENTRY).with_renderer("default", renderer));
        dispatcher_with(sandbox, graph, DevServerConfig::default(), Arc::new(PlainHost))
    }

    fn counted(res: BufferedResponse) -> (BufferedResponse, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let res = res.with_render_resolve(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (res, calls)
    }

    #[tokio::test]
    async fn test_renders_page_with_headers_and_footer() {
        let dispatcher = dispatcher(
            chunked_renderer(&["<html>", "<body>about</body>", "</html>"]),
            DevModuleGraph::new(),
        );
        let (mut res, calls) = counted(BufferedResponse::new());

        let flow = dispatcher.handle(&page("/about"), &mut res).await;

        assert_eq!(flow, Flow::Done);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[CONTENT_TYPE], "text/html; charset=utf-8");
        assert_eq!(res.headers()[CACHE_CONTROL], "no-cache, no-store, max-age=0");
        assert_eq!(res.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(res.headers()["x-powered-by"], "Qwik Vite Dev Server");
        assert!(res.is_ended());

        let body = res.body_text();
        assert!(body.starts_with("<html><body>about</body></html>\n<style>"));
        assert!(body.contains(r#"<script type="module" src="/@vite/client"></script>"#));
        assert!(body.contains("globalThis.qwikdevtools"));
    }

    #[tokio::test]
    async fn test_keeps_status_set_by_earlier_middleware() {
        let dispatcher = dispatcher(chunked_renderer(&["<html></html>"]), DevModuleGraph::new());
        let mut res = BufferedResponse::new();
        res.set_status(StatusCode::NOT_FOUND);

        dispatcher.handle(&page("/missing"), &mut res).await;

        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(res.head_written());
    }

    #[tokio::test]
    async fn test_render_sees_server_data_from_env() {
        let seen = Arc::new(Mutex::new(None));
        let recorder = seen.clone();
        let renderer: RenderFn = Arc::new(move |options: RenderOptions, writer: StreamWriter| {
            *recorder.lock().unwrap() = Some(options.options.clone());
            async move {
                writer.write("<html></html>").unwrap();
                Ok::<_, SandboxError>(())
            }
            .boxed()
        });
        let dispatcher = dispatcher(renderer, DevModuleGraph::new());
        let env = json!({
            "theme": "dark",
            "locale": "de",
            "qwikcity": {
                "loadedRoute": ["/about/", { "lang": "de" }, [], null, null],
                "response": { "status": 200 }
            }
        });
        let mut res = BufferedResponse::new()
            .with_env_data(env.as_object().unwrap().clone());

        assert_eq!(dispatcher.handle(&page("/about?x=1"), &mut res).await, Flow::Done);

        let options = seen.lock().unwrap().take().unwrap();
        assert!(options.debug);
        assert!(options.snapshot);
        assert!(options.manifest.is_some());
        assert_eq!(options.prefetch_strategy, None);
        assert_eq!(options.locale.as_deref(), Some("de"));
        assert_eq!(options.server_data.url, "http://localhost:5173/about?x=1");
        assert_eq!(options.server_data.fields["theme"], json!("dark"));
        assert_eq!(options.server_data.qwikcity.loaded_route.route_name, "/about/");
        assert_eq!(options.server_data.qwikcity.extra["response"], json!({ "status": 200 }));
        assert_eq!(options.server_data.ev.params["lang"], "de");
        assert_eq!(options.server_data.ev.pathname, "/about");
    }

    #[tokio::test]
    async fn test_assets_pass_through() {
        let dispatcher = dispatcher(chunked_renderer(&["never"]), DevModuleGraph::new());
        let (mut res, calls) = counted(BufferedResponse::new());

        let flow = dispatcher.handle(&page("/app.js"), &mut res).await;

        assert_eq!(flow, Flow::Next);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!res.head_written());
        assert!(res.body().is_empty());
    }

    #[tokio::test]
    async fn test_late_stylesheets_are_linked_before_body() {
        let graph = DevModuleGraph::new();
        graph.record(ModuleNode::new("/src/global.css"));
        let late = graph.clone();
        let renderer: RenderFn = Arc::new(move |_options: RenderOptions, writer: StreamWriter| {
            late.record(ModuleNode::new("/src/routes/about/about.css"));
            late.record(ModuleNode::new("/src/routes/about/about.css?inline"));
            async move {
                writer.write("<html></html>").unwrap();
                Ok::<_, SandboxError>(())
            }
            .boxed()
        });
        let dispatcher = dispatcher(renderer, graph);
        let mut res = BufferedResponse::new();

        dispatcher.handle(&page("/about"), &mut res).await;

        let body = res.body_text();
        assert!(body.starts_with(
            r#"<link rel="stylesheet" href="/src/routes/about/about.css"><html></html>"#
        ));
        assert!(!body.contains(r#"href="/src/global.css""#));
    }

    #[tokio::test]
    async fn test_skipped_render_passes_to_next() {
        let sandbox = FakeSandbox::new().with(
            FakeModule::new(ENTRY).with_renderer("default", chunked_renderer(&["never"])),
        );
        let dispatcher = dispatcher_with(
            sandbox,
            DevModuleGraph::new(),
            DevServerConfig::default(),
            Arc::new(PlainHost),
        );
        // Route module that does not exist in the sandbox: reconstruction fails closed.
        let env = json!({
            "qwikcity": {
                "loadedRoute": ["/", {}, [{ "__filePath": "/src/routes/index.tsx" }], null, null]
            }
        });
        let (mut res, calls) = counted(
            BufferedResponse::new().with_env_data(env.as_object().unwrap().clone()),
        );

        assert_eq!(dispatcher.handle(&page("/"), &mut res).await, Flow::Next);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(res.body().is_empty());
    }

    #[derive(Default)]
    struct RecordingHost {
        transformed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DevHost for RecordingHost {
        async fn transform_index_html(&self, url: &str, html: String) -> Result<String, DispatchError> {
            self.transformed.lock().unwrap().push(url.to_string());
            Ok(html.replace("<head>", "<head><!-- transformed -->"))
        }

        fn fix_stacktrace(&self, report: String) -> String {
            report.replace("./src/entry.ssr.js", "/project/src/entry.ssr.tsx")
        }
    }

    #[tokio::test]
    async fn test_client_dev_mode_skips_the_sandbox() {
        let sandbox = FakeSandbox::new();
        let host = Arc::new(RecordingHost::default());
        let config = DevServerConfig {
            root_dir: "/project".into(),
            client_dev_input: Some("/project/src/entry.dev.tsx".into()),
            ..Default::default()
        };
        let dispatcher = dispatcher_with(sandbox.clone(), DevModuleGraph::new(), config, host.clone());
        let (mut res, calls) = counted(BufferedResponse::new());

        assert_eq!(dispatcher.handle(&page("/about"), &mut res).await, Flow::Done);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sandbox.attempts(ENTRY), 0);
        assert_eq!(*host.transformed.lock().unwrap(), vec!["/about".to_string()]);
        assert_eq!(res.headers()["x-powered-by"], "Qwik Vite Dev Server");
        let body = res.body_text();
        assert!(body.contains("<head><!-- transformed -->"));
        assert!(body.contains(r#"import("/src/entry.dev.tsx?qwik-vite-dev-client=")"#));
        assert!(body.contains(r#"\"url\":\"http://localhost:5173/about\""#));
    }

    #[tokio::test]
    async fn test_render_failure_is_forwarded_to_error_middleware() {
        let host = Arc::new(RecordingHost::default());
        let dispatcher = dispatcher_with(
            FakeSandbox::new(),
            DevModuleGraph::new(),
            DevServerConfig::default(),
            host,
        );
        let (mut res, calls) = counted(BufferedResponse::new());

        let flow = dispatcher.handle(&page("/"), &mut res).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let Flow::Error(failure) = flow else {
            panic!("expected an error flow, got {flow:?}");
        };
        assert_eq!(
            failure.message,
            "render failed: failed to import '/project/src/entry.ssr.tsx': module not found"
        );
        assert!(failure.report.contains("\n  caused by: "));

        let flow = error_overlay(failure.clone(), &mut res);
        assert_eq!(flow, Flow::Error(failure));
        assert_eq!(res.body_text(), devtools::error_overlay_style());
    }

    #[test]
    fn test_error_overlay_leaves_ended_response_alone() {
        let mut res = BufferedResponse::new();
        res.end();
        let failure = DispatchFailure {
            message: "boom".to_string(),
            report: "boom".to_string(),
        };
        assert_eq!(error_overlay(failure.clone(), &mut res), Flow::Error(failure));
        assert!(res.body().is_empty());
    }

    #[test]
    fn test_origin_from_host_header() {
        let config = DevServerConfig::default();
        assert_eq!(resolve_origin(&page("/"), &config), "http://localhost:5173");
    }

    #[test]
    fn test_origin_overrides() {
        let req = Request::get("/")
            .header(HOST, "localhost:5173")
            .header("x-forwarded-proto", "https")
            .header("x-forwarded-host", "shop.example.com")
            .body(())
            .unwrap();

        let proxied = DevServerConfig {
            protocol_header: Some("X-Forwarded-Proto".to_string()),
            host_header: Some("X-Forwarded-Host".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_origin(&req, &proxied), "https://shop.example.com");

        let fixed = DevServerConfig {
            origin: Some("https://fixed.example".to_string()),
            ..proxied
        };
        assert_eq!(resolve_origin(&req, &fixed), "https://fixed.example");
    }

    #[test]
    fn test_origin_from_absolute_uri() {
        let req = Request::get("https://secure.local:8443/cart").body(()).unwrap();
        assert_eq!(
            resolve_origin(&req, &DevServerConfig::default()),
            "https://secure.local:8443"
        );
    }

    #[test]
    fn test_container_attributes_keep_strings_only() {
        let value = json!({ "lang": "en", "data-count": 3, "dir": "ltr", "hidden": null });
        assert_eq!(
            container_attributes(Some(&value)),
            BTreeMap::from([
                ("dir".to_string(), "ltr".to_string()),
                ("lang".to_string(), "en".to_string()),
            ])
        );
        assert!(container_attributes(Some(&json!(["lang"]))).is_empty());
        assert!(container_attributes(None).is_empty());
    }

    #[test]
    fn test_dispatch_state_names() {
        assert_eq!(DispatchState::BuildingContext.to_string(), "building-context");
        assert_eq!(DispatchState::Failed.to_string(), "failed");
    }
}
