//! In-memory sandbox used by unit tests.

use crate::context::SerializedRequestEvent;
use crate::error::SandboxError;
use crate::sandbox::{SandboxModule, SandboxRuntime};
use crate::serialize::RenderOptions;
use crate::stream::StreamWriter;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type LoaderFn =
    Arc<dyn Fn(&SerializedRequestEvent) -> Result<Value, SandboxError> + Send + Sync>;
pub type RenderFn =
    Arc<dyn Fn(RenderOptions, StreamWriter) -> BoxFuture<'static, Result<(), SandboxError>> + Send + Sync>;

/// Renderer writing `chunks` one by one with a short pause in between.
pub fn chunked_renderer(chunks: &[&str]) -> RenderFn {
    let chunks: Vec<String> = chunks.iter().map(|chunk| chunk.to_string()).collect();
    Arc::new(move |_options: RenderOptions, writer: StreamWriter| {
        let chunks = chunks.clone();
        async move {
            for chunk in chunks {
                writer.write(chunk).map_err(|err| SandboxError::Script(err.to_string()))?;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Ok(())
        }
        .boxed()
    })
}

/// A module with canned loaders and renderers.
#[derive(Clone)]
pub struct FakeModule {
    specifier: String,
    loaders: HashMap<String, LoaderFn>,
    renderers: HashMap<String, RenderFn>,
    available_from: u32,
}

impl FakeModule {
    pub fn new(specifier: impl Into<String>) -> Self {
        Self {
            specifier: specifier.into(),
            loaders: HashMap::new(),
            renderers: HashMap::new(),
            available_from: 1,
        }
    }

    pub fn with_loader<F>(mut self, name: &str, loader: F) -> Self
    where
        F: Fn(&SerializedRequestEvent) -> Result<Value, SandboxError> + Send + Sync + 'static,
    {
        self.loaders.insert(name.to_string(), Arc::new(loader));
        self
    }

    pub fn with_renderer(mut self, name: &str, renderer: RenderFn) -> Self {
        self.renderers.insert(name.to_string(), renderer);
        self
    }

    /// Imports fail until the `attempt`-th one.
    pub fn available_from(mut self, attempt: u32) -> Self {
        self.available_from = attempt;
        self
    }
}

impl fmt::Debug for FakeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeModule")
            .field("specifier", &self.specifier)
            .field("loaders", &self.loaders.keys().collect::<Vec<_>>())
            .field("renderers", &self.renderers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl SandboxModule for FakeModule {
    fn specifier(&self) -> &str {
        &self.specifier
    }

    fn has_export(&self, name: &str) -> bool {
        self.loaders.contains_key(name) || self.renderers.contains_key(name)
    }

    async fn call_loader(
        &self,
        name: &str,
        ev: &SerializedRequestEvent,
    ) -> Result<Value, SandboxError> {
        let loader = self.loaders.get(name).ok_or_else(|| SandboxError::MissingExport {
            specifier: self.specifier.clone(),
            name: name.to_string(),
        })?;
        loader(ev)
    }

    async fn render(
        &self,
        export: &str,
        options: RenderOptions,
        writer: StreamWriter,
    ) -> Result<(), SandboxError> {
        let renderer = self.renderers.get(export).ok_or_else(|| SandboxError::MissingExport {
            specifier: self.specifier.clone(),
            name: export.to_string(),
        })?;
        renderer(options, writer).await
    }
}

/// Sandbox serving [`FakeModule`]s and counting import attempts.
#[derive(Clone, Default)]
pub struct FakeSandbox {
    modules: HashMap<String, FakeModule>,
    env: Map<String, Value>,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, module: FakeModule) -> Self {
        self.modules.insert(module.specifier.clone(), module);
        self
    }

    /// Module without exports.
    pub fn with_module(self, specifier: &str) -> Self {
        self.with(FakeModule::new(specifier))
    }

    pub fn with_env(mut self, name: &str, value: Value) -> Self {
        self.env.insert(name.to_string(), value);
        self
    }

    /// Import attempts seen for `specifier`.
    pub fn attempts(&self, specifier: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(specifier)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SandboxRuntime for FakeSandbox {
    async fn import(&self, specifier: &str) -> Result<Arc<dyn SandboxModule>, SandboxError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(specifier.to_string()).or_default();
            *count += 1;
            *count
        };
        match self.modules.get(specifier) {
            Some(module) if attempt >= module.available_from => Ok(Arc::new(module.clone())),
            _ => Err(SandboxError::Import {
                specifier: specifier.to_string(),
                message: String::from("module not found"),
            }),
        }
    }

    fn env(&self) -> Map<String, Value> {
        self.env.clone()
    }
}
