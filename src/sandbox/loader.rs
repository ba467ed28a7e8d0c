//! Module loader that only serves JS from the chunks directory.
//! Blocks all network access, filesystem escape, and restricts to .js/.mjs files.

use crate::error::SandboxError;
use crate::manifest::{DevModuleGraph, ModuleNode};
use deno_core::{
    anyhow::{anyhow, Error},
    ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode, ModuleSpecifier,
    ModuleType, RequestedModuleType, ResolutionKind,
};
use std::path::{Path, PathBuf};
use tracing::trace;

/// A module loader that restricts all imports to a single directory.
///
/// Security guarantees:
/// - No network access (http/https URLs rejected)
/// - No filesystem escape (path traversal blocked via canonicalization)
/// - Only .js and .mjs files allowed
/// - Dynamic imports supported but sandboxed
///
/// Root-absolute specifiers (`/src/routes/index.js`) are served from the
/// chunks directory, the way a dev server serves them from the project root.
#[derive(Debug, Clone)]
pub struct SandboxedLoader {
    allowed_dir: PathBuf,
    graph: Option<DevModuleGraph>,
}

impl SandboxedLoader {
    /// Create a new sandboxed loader that only allows loading from `allowed_dir`.
    pub fn new(allowed_dir: impl AsRef<Path>) -> Result<Self, Error> {
        let canonical = allowed_dir
            .as_ref()
            .canonicalize()
            .map_err(|e| anyhow!("Failed to canonicalize allowed_dir: {}", e))?;

        if !canonical.is_dir() {
            return Err(anyhow!("allowed_dir must be a directory"));
        }

        Ok(Self {
            allowed_dir: canonical,
            graph: None,
        })
    }

    /// Record every loaded module in `graph`.
    pub fn with_graph(mut self, graph: DevModuleGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Resolve a top-level specifier (no referrer) to a file URL in the chunks dir.
    pub fn resolve_specifier(&self, specifier: &str) -> Result<ModuleSpecifier, SandboxError> {
        let root = ModuleSpecifier::from_directory_path(&self.allowed_dir).map_err(|_| {
            SandboxError::Import {
                specifier: specifier.to_string(),
                message: String::from("chunks dir is not a valid file URL"),
            }
        })?;
        self.resolve(specifier, root.as_str(), ResolutionKind::DynamicImport)
            .map_err(|e| SandboxError::Import {
                specifier: specifier.to_string(),
                message: e.to_string(),
            })
    }

    /// Check if a path is within the allowed directory.
    /// Uses canonicalization to resolve symlinks and prevent traversal.
    fn is_path_allowed(&self, path: &Path) -> bool {
        match path.canonicalize() {
            Ok(canonical) => canonical.starts_with(&self.allowed_dir),
            Err(_) => false,
        }
    }

    /// Validate file extension is allowed (.js or .mjs only)
    fn is_extension_allowed(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("js") | Some("mjs")
        )
    }

    /// `/`-absolute paths outside the chunks dir are rooted at the chunks dir.
    fn root_absolute(&self, specifier: &str) -> PathBuf {
        let path = Path::new(specifier);
        if path.starts_with(&self.allowed_dir) {
            path.to_path_buf()
        } else {
            self.allowed_dir.join(specifier.trim_start_matches('/'))
        }
    }

    /// Dev URL of a module: its path under the chunks dir.
    fn dev_url(&self, path: &Path) -> String {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let relative = canonical.strip_prefix(&self.allowed_dir).unwrap_or(&canonical);
        format!("/{}", relative.to_string_lossy().replace('\\', "/"))
    }
}

impl ModuleLoader for SandboxedLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        // Block all remote URLs
        if specifier.starts_with("http://")
            || specifier.starts_with("https://")
            || specifier.starts_with("data:")
            || specifier.starts_with("blob:")
        {
            return Err(anyhow!("Remote imports are forbidden: {}", specifier));
        }

        let resolved = if specifier.starts_with("./") || specifier.starts_with("../") {
            let referrer_url = ModuleSpecifier::parse(referrer)
                .map_err(|e| anyhow!("Invalid referrer '{}': {}", referrer, e))?;
            referrer_url
                .join(specifier)
                .map_err(|e| anyhow!("Failed to resolve '{}': {}", specifier, e))?
        } else if specifier.starts_with("file://") {
            ModuleSpecifier::parse(specifier)
                .map_err(|e| anyhow!("Invalid file URL '{}': {}", specifier, e))?
        } else if specifier.starts_with('/') {
            ModuleSpecifier::from_file_path(self.root_absolute(specifier))
                .map_err(|_| anyhow!("Invalid absolute path: {}", specifier))?
        } else {
            // Bare specifier (`chunk-abc123.js`) resolves from the chunks dir root
            ModuleSpecifier::from_file_path(self.allowed_dir.join(specifier))
                .map_err(|_| anyhow!("Invalid bare specifier: {}", specifier))?
        };

        if resolved.scheme() != "file" {
            return Err(anyhow!(
                "Only file:// URLs allowed, got: {}",
                resolved.scheme()
            ));
        }

        let path = resolved
            .to_file_path()
            .map_err(|_| anyhow!("Failed to convert URL to path: {}", resolved))?;

        if !self.is_path_allowed(&path) {
            return Err(anyhow!(
                "Access denied: '{}' is outside the allowed directory",
                path.display()
            ));
        }

        if !Self::is_extension_allowed(&path) {
            return Err(anyhow!(
                "Only .js and .mjs files allowed, got: {}",
                path.display()
            ));
        }

        Ok(resolved)
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        let specifier = module_specifier.clone();

        let path = match specifier.to_file_path() {
            Ok(p) => p,
            Err(_) => {
                return ModuleLoadResponse::Sync(Err(anyhow!("Invalid file path: {}", specifier)));
            }
        };

        // Re-checked here: dynamic imports can reach load with a stale resolution
        if !self.is_path_allowed(&path) || !Self::is_extension_allowed(&path) {
            return ModuleLoadResponse::Sync(Err(anyhow!("Access denied: {}", path.display())));
        }

        let code = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                return ModuleLoadResponse::Sync(Err(anyhow!(
                    "Failed to read '{}': {}",
                    path.display(),
                    e
                )));
            }
        };

        if let Some(graph) = &self.graph {
            let url = self.dev_url(&path);
            trace!(%url, "module loaded");
            graph.record(ModuleNode::new(url));
        }

        ModuleLoadResponse::Sync(Ok(ModuleSource::new(
            ModuleType::JavaScript,
            ModuleSourceCode::String(code.into()),
            &specifier,
            None,
        )))
    }
}
