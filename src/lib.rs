//! # SSR Dev Bridge
//!
//! Server-side rendering for a dev server, executed inside a sandboxed
//! worker runtime built on deno_core.
//!
//! A request flows through the dev middleware chain like this:
//!
//! 1. [`filter::should_render`] decides whether the request is a page render.
//! 2. [`DevDispatcher`] builds the render context and a manifest snapshot.
//! 3. [`serialize::serialize`] projects the context onto a versioned,
//!    plain-data wire schema.
//! 4. [`SandboxFunctions::render_app`] reconstructs the route modules inside
//!    the sandbox and streams the render back.
//! 5. The dispatcher writes late stylesheet links, the document and the dev
//!    footer to the response.
//!
//! ## Security Guarantees
//!
//! - **No filesystem access**: Only the configured chunks directory is readable
//! - **No network access**: All HTTP/HTTPS imports are blocked
//! - **No environment access**: loaders see only the bindings handed to them
//! - **Dynamic imports sandboxed**: `import()` only works within the chunks dir
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ssr_dev_bridge::{
//!     BridgeConfig, DevDispatcher, DevModuleGraph, DevServerConfig, JsSandbox, PlainHost,
//!     SandboxConfig, SandboxRegistry,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let graph = DevModuleGraph::new();
//!     let sandbox = JsSandbox::spawn(
//!         SandboxConfig {
//!             chunks_dir: "./dist/chunks".into(),
//!             ..Default::default()
//!         },
//!         Some(graph.clone()),
//!     )
//!     .await?;
//!
//!     let registry = SandboxRegistry::new();
//!     let functions = registry.register_once(Arc::new(sandbox), BridgeConfig::default());
//!     let dispatcher = DevDispatcher::new(
//!         DevServerConfig::default().with_env(),
//!         Arc::new(graph),
//!         functions.clone(),
//!         Arc::new(PlainHost),
//!     );
//!     // dispatcher.handle(&request, &mut response).await
//!
//!     functions.tasks().shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod context;
pub mod devtools;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod manifest;
pub mod middleware;
pub mod preview;
pub mod sandbox;
mod sanitize;
pub mod serialize;
pub mod stream;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use bridge::{SandboxFunctions, SandboxRegistry, SymbolMapper};
pub use config::{BridgeConfig, DevServerConfig, DevToolsOptions, SandboxConfig};
pub use dispatcher::{DevDispatcher, DevHost, PlainHost};
pub use error::{AdapterError, BridgeError, DispatchError, PreviewError, SandboxError, SerializeError};
pub use manifest::{DevModuleGraph, ManifestSnapshot, ModuleGraph};
pub use middleware::{BufferedResponse, Flow, Middleware, ResponseSink};
pub use sandbox::{ConsoleOutput, JsSandbox, SandboxModule, SandboxRuntime};
