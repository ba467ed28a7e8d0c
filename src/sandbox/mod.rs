//! The isolated worker runtime that loads and runs application code.
//!
//! The bridge only talks to the sandbox through [`SandboxRuntime`] and
//! [`SandboxModule`]; [`JsSandbox`] is the V8 implementation.
//!
//! ## Security Guarantees
//!
//! - **No filesystem access**: Only the configured chunks directory is readable
//! - **No network access**: Remote imports are blocked
//! - **No environment access**: loaders only see the bindings handed to them
//! - **Dynamic imports sandboxed**: `import()` only works within the chunks dir

use crate::context::SerializedRequestEvent;
use crate::error::SandboxError;
use crate::serialize::RenderOptions;
use crate::stream::StreamWriter;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

mod js;
mod loader;
mod ops;
mod runtime;

pub use js::{BodyChunk, DefaultExport, HandlerRequest, HandlerResponse, JsModule, JsSandbox};
pub use loader::SandboxedLoader;
pub use ops::ConsoleOutput;

/// An isolated runtime able to import modules by specifier.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Import a module inside the sandbox.
    async fn import(&self, specifier: &str) -> Result<Arc<dyn SandboxModule>, SandboxError>;

    /// Environment bindings of the sandbox (KV namespaces, secrets).
    fn env(&self) -> Map<String, Value>;
}

/// Handle to a module living inside the sandbox.
#[async_trait]
pub trait SandboxModule: Send + Sync + fmt::Debug {
    /// Resolved specifier of the module.
    fn specifier(&self) -> &str;

    fn has_export(&self, name: &str) -> bool;

    /// Call the loader exported as `name` with the request event as both
    /// receiver and argument. Resolves to the loader's plain JSON result.
    async fn call_loader(
        &self,
        name: &str,
        ev: &SerializedRequestEvent,
    ) -> Result<Value, SandboxError>;

    /// Run the render function exported as `export`, writing into `writer`.
    ///
    /// Resolves once the render function settles. The writer is closed by
    /// the caller, not by the module.
    async fn render(
        &self,
        export: &str,
        options: RenderOptions,
        writer: StreamWriter,
    ) -> Result<(), SandboxError>;
}
