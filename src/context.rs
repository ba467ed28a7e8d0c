//! In-memory render context and the plain-data wire schema that crosses the
//! sandbox boundary.
//!
//! The in-memory side ([`RenderContext`], [`ServerData`], [`RequestEvent`])
//! may hold live handles. The wire side (`Serialized*`) holds plain data only
//! and is versioned by [`WIRE_SCHEMA_VERSION`].

use crate::manifest::ManifestSnapshot;
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Version of the render-options wire schema.
pub const WIRE_SCHEMA_VERSION: u32 = 1;

/// Route parameters extracted by route matching.
pub type RouteParams = BTreeMap<String, String>;

/// Fields of the in-memory context that never reach the wire, as JSON
/// pointers into the serialized render options.
pub const OMITTED_FIELDS: &[&str] = &[
    "/serverData/ev/headers",
    "/serverData/ev/cookies",
    "/serverData/ev/sharedMap",
    "/serverData/ev/platform/env",
    "/serverData/ev/platform/native",
    "/symbolMapper",
    "/stream",
];

/// Server-data keys owned by the schema; ambient fields with these names are dropped.
pub(crate) const RESERVED_SERVER_DATA_KEYS: &[&str] =
    &["url", "locale", "containerAttributes", "qwikcity", "ev"];

/// Reference to a route module by file path, as produced by route matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteModulePath {
    /// Module file path, imported inside the sandbox before render.
    #[serde(rename = "__filePath")]
    pub file_path: String,
}

impl RouteModulePath {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }
}

/// Route match plus the ordered route modules (layouts first, page last).
///
/// Encoded on the wire as `[routeName, params, modules, menu, bundleNames]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "LoadedRouteTuple", into = "LoadedRouteTuple")]
pub struct LoadedRoute {
    pub route_name: String,
    pub params: RouteParams,
    pub modules: Vec<RouteModulePath>,
    pub menu: Option<Value>,
    pub bundle_names: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize)]
struct LoadedRouteTuple(
    String,
    RouteParams,
    Vec<RouteModulePath>,
    Option<Value>,
    Option<Vec<String>>,
);

impl From<LoadedRouteTuple> for LoadedRoute {
    fn from(LoadedRouteTuple(route_name, params, modules, menu, bundle_names): LoadedRouteTuple) -> Self {
        Self {
            route_name,
            params,
            modules,
            menu,
            bundle_names,
        }
    }
}

impl From<LoadedRoute> for LoadedRouteTuple {
    fn from(route: LoadedRoute) -> Self {
        Self(
            route.route_name,
            route.params,
            route.modules,
            route.menu,
            route.bundle_names,
        )
    }
}

/// How the request is being served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
    Static,
    #[default]
    Dev,
    Server,
}

/// Live serializer object attached to a request; only its kind crosses the wire.
#[derive(Clone)]
pub struct SerializerHandle {
    pub kind: String,
    pub instance: Option<Arc<dyn Any + Send + Sync>>,
}

impl SerializerHandle {
    /// A stand-in carrying only the kind, as rebuilt from the wire.
    pub fn stand_in(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            instance: None,
        }
    }
}

impl fmt::Debug for SerializerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializerHandle")
            .field("kind", &self.kind)
            .field("live", &self.instance.is_some())
            .finish()
    }
}

/// Platform bindings of a request.
#[derive(Clone)]
pub struct Platform {
    pub ssr: bool,
    /// Host runtime version, when rendering under a node-like host.
    pub node: Option<String>,
    /// Environment bindings (KV namespaces, secrets).
    pub env: Map<String, Value>,
    /// Native platform object; never serializable.
    pub native: Option<Arc<dyn Any + Send + Sync>>,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            ssr: true,
            node: None,
            env: Map::new(),
            native: None,
        }
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("ssr", &self.ssr)
            .field("node", &self.node)
            .field("env", &self.env)
            .field("native", &self.native.is_some())
            .finish()
    }
}

/// Per-request execution handle.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub loaders: Map<String, Value>,
    pub mode: RequestMode,
    pub serializer: Option<SerializerHandle>,
    pub route: Option<LoadedRoute>,
    pub trailing_slash: bool,
    pub base_pathname: String,
    pub method: Method,
    pub params: RouteParams,
    pub pathname: String,
    pub url: Url,
    pub platform: Platform,
    pub headers: HeaderMap,
    pub cookies: BTreeMap<String, String>,
    pub shared_map: Map<String, Value>,
}

impl RequestEvent {
    /// A fresh handle for `method url` with default platform bindings.
    pub fn new(url: &Url, method: Method) -> Self {
        Self {
            loaders: Map::new(),
            mode: RequestMode::Dev,
            serializer: None,
            route: None,
            trailing_slash: false,
            base_pathname: String::from("/"),
            method,
            params: RouteParams::new(),
            pathname: url.path().to_string(),
            url: url.clone(),
            platform: Platform::default(),
            headers: HeaderMap::new(),
            cookies: BTreeMap::new(),
            shared_map: Map::new(),
        }
    }
}

/// Route data attached by the routing middleware.
#[derive(Debug, Clone)]
pub struct RouteData {
    pub loaded_route: LoadedRoute,
    pub ev: RequestEvent,
    /// Other plain route fields (response status, route name, ...).
    pub extra: Map<String, Value>,
}

impl RouteData {
    /// Route data for a request that matched no declared route modules.
    pub fn new(url: &Url, method: Method) -> Self {
        let ev = RequestEvent::new(url, method);
        let loaded_route = LoadedRoute {
            route_name: ev.pathname.clone(),
            params: RouteParams::new(),
            modules: Vec::new(),
            menu: None,
            bundle_names: None,
        };
        Self {
            ev: RequestEvent {
                route: Some(loaded_route.clone()),
                ..ev
            },
            loaded_route,
            extra: Map::new(),
        }
    }
}

/// Response-scoped server data handed to the renderer.
#[derive(Debug, Clone, Default)]
pub struct ServerData {
    pub url: String,
    pub locale: Option<String>,
    pub container_attributes: BTreeMap<String, String>,
    pub route: Option<RouteData>,
    /// Ambient plain fields contributed by earlier middlewares.
    pub fields: Map<String, Value>,
}

impl ServerData {
    /// Plain-data view without route data, as embedded in the client dev bootstrap.
    pub fn ambient_json(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("url".to_string(), Value::String(self.url.clone()));
        if let Some(locale) = &self.locale {
            object.insert("locale".to_string(), Value::String(locale.clone()));
        }
        if !self.container_attributes.is_empty() {
            object.insert(
                "containerAttributes".to_string(),
                serde_json::to_value(&self.container_attributes).unwrap_or_default(),
            );
        }
        Value::Object(object)
    }
}

/// Complete input to a render operation.
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub debug: bool,
    pub snapshot: bool,
    pub manifest: Option<ManifestSnapshot>,
    pub server_data: ServerData,
}

// ============================================================================
// Wire schema
// ============================================================================

/// Render options as they cross the sandbox boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedRenderOptions {
    pub schema_version: u32,
    pub debug: bool,
    pub locale: Option<String>,
    pub snapshot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ManifestSnapshot>,
    /// Always `null`; prefetching is the renderer's default in dev.
    pub prefetch_strategy: Option<Value>,
    pub server_data: SerializedServerData,
    pub container_attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedServerData {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub container_attributes: BTreeMap<String, String>,
    pub qwikcity: SerializedRouteData,
    pub ev: SerializedRequestEvent,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedRouteData {
    pub loaded_route: LoadedRoute,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Whitelisted plain-data projection of [`RequestEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedRequestEvent {
    #[serde(rename = "___@_RequestEvLoaders", default)]
    pub loaders: Map<String, Value>,
    #[serde(rename = "___@_RequestEvMode", default)]
    pub mode: RequestMode,
    #[serde(rename = "___@_RequestEvQwikSerializer", default)]
    pub serializer: Option<String>,
    #[serde(rename = "___@_RequestEvRoute", default)]
    pub route: Option<LoadedRoute>,
    #[serde(rename = "___@_RequestEvTrailingSlash", default)]
    pub trailing_slash: bool,
    #[serde(rename = "basePathname")]
    pub base_pathname: String,
    pub method: String,
    pub params: RouteParams,
    pub pathname: String,
    pub platform: SerializedPlatform,
    pub url: String,
}

/// Non-native platform fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedPlatform {
    pub ssr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Filled inside the sandbox from its own bindings, never by the host.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub env: Map<String, Value>,
}
