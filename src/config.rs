//! Configuration for the sandbox, the bridge and the dev server.

use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the SSR sandbox
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Directory containing the JS chunks (only this dir is accessible)
    pub chunks_dir: PathBuf,
    /// Maximum heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
    /// KV namespaces exposed as platform bindings
    pub kv_namespaces: Vec<String>,
    /// Extra plain-data bindings exposed to loaders
    pub bindings: Map<String, Value>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            chunks_dir: PathBuf::from("./chunks"),
            max_heap_size: Some(64 * 1024 * 1024), // 64MB default
            kv_namespaces: Vec::new(),
            bindings: Map::new(),
        }
    }
}

impl SandboxConfig {
    /// Environment bindings the sandbox hands to loaders.
    ///
    /// KV namespaces appear as descriptors; explicit bindings win on name clashes.
    pub fn env_bindings(&self) -> Map<String, Value> {
        let mut env = Map::new();
        for namespace in &self.kv_namespaces {
            env.insert(
                namespace.clone(),
                json!({ "type": "kv", "namespace": namespace }),
            );
        }
        for (name, value) in &self.bindings {
            env.insert(name.clone(), value.clone());
        }
        env
    }
}

/// Tuning for the remote functions.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Import attempts for a loader module before giving up.
    pub loader_attempts: u32,
    /// Fixed delay between loader import attempts.
    pub loader_retry_backoff: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            loader_attempts: 3,
            loader_retry_backoff: Duration::from_millis(200),
        }
    }
}

/// Developer tooling appended to every dev render.
#[derive(Debug, Clone)]
pub struct DevToolsOptions {
    /// Hot keys for click-to-source; `None` disables the click-to-component overlay.
    pub click_to_source: Option<Vec<String>>,
}

impl Default for DevToolsOptions {
    fn default() -> Self {
        Self {
            click_to_source: Some(vec!["Alt".to_string()]),
        }
    }
}

/// Dev server settings consumed by the dispatcher.
#[derive(Debug, Clone)]
pub struct DevServerConfig {
    /// Project root.
    pub root_dir: PathBuf,
    /// Source directory, defaults to `<root>/src`.
    pub src_dir: Option<PathBuf>,
    /// SSR entry module imported inside the sandbox.
    pub entry_point: String,
    /// Client entry when running in client-only dev mode.
    pub client_dev_input: Option<PathBuf>,
    /// Developer tooling options.
    pub dev_tools: DevToolsOptions,
    /// Fixed origin overriding request-derived origins (`ORIGIN`).
    pub origin: Option<String>,
    /// Header carrying the protocol behind a proxy (`PROTOCOL_HEADER`).
    pub protocol_header: Option<String>,
    /// Header carrying the host behind a proxy (`HOST_HEADER`).
    pub host_header: Option<String>,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            src_dir: None,
            entry_point: String::from("./src/entry.ssr.js"),
            client_dev_input: None,
            dev_tools: DevToolsOptions::default(),
            origin: None,
            protocol_header: None,
            host_header: None,
        }
    }
}

impl DevServerConfig {
    /// Apply `ORIGIN`, `PROTOCOL_HEADER` and `HOST_HEADER` from the process environment.
    pub fn with_env(self) -> Self {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Apply origin overrides from an arbitrary variable lookup.
    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());
        if let Some(origin) = non_empty("ORIGIN") {
            self.origin = Some(origin);
        }
        if let Some(header) = non_empty("PROTOCOL_HEADER") {
            self.protocol_header = Some(header);
        }
        if let Some(header) = non_empty("HOST_HEADER") {
            self.host_header = Some(header);
        }
        self
    }

    /// Source directory relative to the root, with forward slashes.
    pub fn src_base(&self) -> String {
        match &self.src_dir {
            Some(src_dir) => slashed(src_dir.strip_prefix(&self.root_dir).unwrap_or(src_dir)),
            None => String::from("src"),
        }
    }

    /// Absolute-ish source directory used by the inspector.
    pub fn src_dir_or_default(&self) -> PathBuf {
        self.src_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("src"))
    }

    /// URL of the client entry when client-only dev mode is active.
    pub fn client_dev_entry_url(&self) -> Option<String> {
        self.client_dev_input.as_ref().map(|input| {
            let relative = input.strip_prefix(&self.root_dir).unwrap_or(input);
            format!("/{}", slashed(relative).trim_start_matches('/'))
        })
    }

    /// Root directory as a URL-ish prefix for module graph URLs.
    pub fn root_dir_str(&self) -> String {
        slashed(&self.root_dir)
    }
}

fn slashed(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_src_base_defaults_to_src() {
        assert_eq!(DevServerConfig::default().src_base(), "src");
    }

    #[test]
    fn test_src_base_is_relative_to_root() {
        let config = DevServerConfig {
            root_dir: PathBuf::from("/project"),
            src_dir: Some(PathBuf::from("/project/app/src")),
            ..Default::default()
        };
        assert_eq!(config.src_base(), "app/src");
    }

    #[test]
    fn test_client_dev_entry_url() {
        let config = DevServerConfig {
            root_dir: PathBuf::from("/project"),
            client_dev_input: Some(PathBuf::from("/project/src/entry.dev.tsx")),
            ..Default::default()
        };
        assert_eq!(
            config.client_dev_entry_url().as_deref(),
            Some("/src/entry.dev.tsx")
        );
        assert_eq!(DevServerConfig::default().client_dev_entry_url(), None);
    }

    #[test]
    fn test_apply_env_overrides() {
        let config = DevServerConfig::default().apply_env(|key| match key {
            "ORIGIN" => Some("https://example.dev".to_string()),
            "HOST_HEADER" => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.origin.as_deref(), Some("https://example.dev"));
        assert_eq!(config.host_header, None);
        assert_eq!(config.protocol_header, None);
    }

    #[test]
    fn test_env_bindings_merge_kv_and_explicit() {
        let mut config = SandboxConfig {
            kv_namespaces: vec!["CACHE".to_string(), "KV".to_string()],
            ..Default::default()
        };
        config.bindings.insert("KV".to_string(), json!("x"));

        let env = config.env_bindings();
        assert_eq!(env["KV"], json!("x"));
        assert_eq!(env["CACHE"], json!({ "type": "kv", "namespace": "CACHE" }));
    }
}
