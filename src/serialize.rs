//! Projection of the in-memory render context onto the wire schema, and the
//! sandbox-side reconstruction of route modules.

use crate::bridge::SymbolMapper;
use crate::context::{
    Platform, RenderContext, RequestEvent, SerializedPlatform, SerializedRenderOptions,
    SerializedRequestEvent, SerializedRouteData, SerializedServerData, SerializerHandle,
    RESERVED_SERVER_DATA_KEYS, WIRE_SCHEMA_VERSION,
};
use crate::error::SerializeError;
use crate::sandbox::{SandboxModule, SandboxRuntime};
use crate::sanitize;
use http::{HeaderMap, Method};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Route-data key holding the loaded route.
const LOADED_ROUTE_KEY: &str = "loadedRoute";

/// Render options after reconstruction inside the sandbox.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Plain render options as received over the wire.
    pub options: SerializedRenderOptions,
    /// Imported route modules, in the order of the loaded route.
    pub route_modules: Vec<Arc<dyn SandboxModule>>,
    /// Resolves symbol names to chunks for the renderer.
    pub symbol_mapper: SymbolMapper,
}

/// Project a render context onto the wire schema.
///
/// Only whitelisted plain fields cross; live handles, headers, cookies, the
/// shared map and platform bindings stay behind. The result has already been
/// through a structural clone, so it holds exactly what the sandbox receives.
pub fn serialize(ctx: &RenderContext) -> Result<SerializedRenderOptions, SerializeError> {
    let server_data = &ctx.server_data;
    let route = server_data
        .route
        .as_ref()
        .ok_or(SerializeError::MissingRouteData)?;

    let fields = plain_fields(&server_data.fields, RESERVED_SERVER_DATA_KEYS)?;
    let extra = plain_fields(&route.extra, &[LOADED_ROUTE_KEY])?;

    let options = SerializedRenderOptions {
        schema_version: WIRE_SCHEMA_VERSION,
        debug: ctx.debug,
        locale: server_data.locale.clone(),
        snapshot: ctx.snapshot,
        manifest: ctx.manifest.clone(),
        prefetch_strategy: None,
        server_data: SerializedServerData {
            url: server_data.url.clone(),
            locale: server_data.locale.clone(),
            container_attributes: server_data.container_attributes.clone(),
            qwikcity: SerializedRouteData {
                loaded_route: route.loaded_route.clone(),
                extra,
            },
            ev: serialize_request_event(&route.ev),
            fields,
        },
        container_attributes: server_data.container_attributes.clone(),
    };

    structural_clone(&options)
}

/// Copy ambient fields without `reserved` keys, rejecting polluted data.
fn plain_fields(
    fields: &Map<String, Value>,
    reserved: &[&str],
) -> Result<Map<String, Value>, SerializeError> {
    let mut plain = fields.clone();
    plain.retain(|key, _| !reserved.contains(&key.as_str()));
    sanitize::check_fields(&plain)?;
    Ok(plain)
}

/// Whitelisted projection of a request event.
pub fn serialize_request_event(ev: &RequestEvent) -> SerializedRequestEvent {
    // Exhaustive on purpose: a new field must be placed on one side.
    let RequestEvent {
        loaders,
        mode,
        serializer,
        route,
        trailing_slash,
        base_pathname,
        method,
        params,
        pathname,
        url,
        platform,
        headers: _,
        cookies: _,
        shared_map: _,
    } = ev;
    let Platform {
        ssr: _,
        node,
        env: _,
        native: _,
    } = platform;

    SerializedRequestEvent {
        loaders: loaders.clone(),
        mode: *mode,
        serializer: serializer.as_ref().map(|handle| handle.kind.clone()),
        route: route.clone(),
        trailing_slash: *trailing_slash,
        base_pathname: base_pathname.clone(),
        method: method.to_string(),
        params: params.clone(),
        pathname: pathname.clone(),
        platform: SerializedPlatform {
            ssr: true,
            node: node.clone(),
            env: Map::new(),
        },
        url: url.to_string(),
    }
}

impl TryFrom<SerializedRequestEvent> for RequestEvent {
    type Error = SerializeError;

    fn try_from(wire: SerializedRequestEvent) -> Result<Self, Self::Error> {
        let SerializedRequestEvent {
            loaders,
            mode,
            serializer,
            route,
            trailing_slash,
            base_pathname,
            method,
            params,
            pathname,
            platform: SerializedPlatform { ssr, node, env },
            url,
        } = wire;

        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| SerializeError::InvalidMethod(method.clone()))?;
        let url = Url::parse(&url).map_err(|source| SerializeError::InvalidUrl {
            url: url.clone(),
            source,
        })?;

        Ok(Self {
            loaders,
            mode,
            serializer: serializer.map(SerializerHandle::stand_in),
            route,
            trailing_slash,
            base_pathname,
            method,
            params,
            pathname,
            url,
            platform: Platform {
                ssr,
                node,
                env,
                native: None,
            },
            headers: HeaderMap::new(),
            cookies: BTreeMap::new(),
            shared_map: Map::new(),
        })
    }
}

/// Deep copy through JSON text, the only form that crosses the boundary.
pub fn structural_clone(
    options: &SerializedRenderOptions,
) -> Result<SerializedRenderOptions, SerializeError> {
    from_wire(&to_wire(options)?)
}

/// Encode render options as wire text.
pub fn to_wire(options: &SerializedRenderOptions) -> Result<String, SerializeError> {
    Ok(serde_json::to_string(options)?)
}

/// Decode wire text, rejecting payloads from another schema version.
pub fn from_wire(text: &str) -> Result<SerializedRenderOptions, SerializeError> {
    let value: Value = serde_json::from_str(text)?;
    let found = value
        .get("schemaVersion")
        .and_then(Value::as_u64)
        .unwrap_or_default();
    if found != u64::from(WIRE_SCHEMA_VERSION) {
        return Err(SerializeError::UnsupportedVersion {
            found: u32::try_from(found).unwrap_or(u32::MAX),
            expected: WIRE_SCHEMA_VERSION,
        });
    }
    Ok(serde_json::from_value(value)?)
}

/// Replace each route module path with its imported module.
///
/// Fail-closed: one failed import yields `None` and nothing is rendered.
pub async fn reconstruct(
    plain: Option<SerializedRenderOptions>,
    runtime: &dyn SandboxRuntime,
    symbol_mapper: SymbolMapper,
) -> Option<RenderOptions> {
    let options = plain?;
    let paths = &options.server_data.qwikcity.loaded_route.modules;

    let mut route_modules = Vec::with_capacity(paths.len());
    for path in paths {
        match runtime.import(&path.file_path).await {
            Ok(module) => route_modules.push(module),
            Err(err) => {
                warn!(module = %path.file_path, error = %err, "route module import failed, skipping render");
                return None;
            }
        }
    }
    debug!(modules = route_modules.len(), "route modules reconstructed");

    Some(RenderOptions {
        options,
        route_modules,
        symbol_mapper,
    })
}
