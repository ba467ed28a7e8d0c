//! Module graph watcher: builds the manifest snapshot before a render and
//! discovers stylesheets that only appeared while rendering.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

/// Extensions treated as stylesheet modules.
const STYLESHEET_EXTENSIONS: &[&str] = &[".css", ".scss", ".sass"];

/// A module tracked by the dev module graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleNode {
    /// Dev-server URL of the module (may carry a query).
    pub url: String,
    /// Name of the render hook this module implements, if any.
    pub hook: Option<String>,
    /// Set once the module has been hot-reloaded.
    pub last_hmr_timestamp: Option<u64>,
}

impl ModuleNode {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            hook: None,
            last_hmr_timestamp: None,
        }
    }

    pub fn with_hook(mut self, hook: impl Into<String>) -> Self {
        self.hook = Some(hook.into());
        self
    }

    /// URL with a cache-busting timestamp once hot-reloaded.
    pub fn versioned_url(&self) -> String {
        match self.last_hmr_timestamp {
            Some(timestamp) => format!("{}?t={timestamp}", self.url),
            None => self.url.clone(),
        }
    }

    /// Plain stylesheet module (no query such as `?inline` or `?used`).
    pub fn is_stylesheet(&self) -> bool {
        let (path, query) = parse_id(&self.url);
        query.is_empty() && STYLESHEET_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    }
}

/// Split a module id into path and query.
fn parse_id(id: &str) -> (&str, &str) {
    id.split_once('?').unwrap_or((id, ""))
}

/// Live view of the bundler's module graph.
pub trait ModuleGraph: Send + Sync {
    /// Every tracked module, in graph order.
    fn modules(&self) -> Vec<ModuleNode>;
}

/// Where an injection is placed in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectionLocation {
    Head,
    Body,
}

/// A tag injected into the rendered document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Injection {
    pub tag: String,
    pub location: InjectionLocation,
    pub attributes: BTreeMap<String, String>,
}

impl Injection {
    /// `<link rel="stylesheet">` in the document head.
    pub fn stylesheet(href: impl Into<String>) -> Self {
        Self {
            tag: String::from("link"),
            location: InjectionLocation::Head,
            attributes: BTreeMap::from([
                (String::from("rel"), String::from("stylesheet")),
                (String::from("href"), href.into()),
            ]),
        }
    }
}

/// Symbol→chunk mapping and injections computed before a render.
///
/// Only ever grows: [`diff`] appends stylesheets discovered after render.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSnapshot {
    pub manifest_hash: String,
    pub symbols: Map<String, Value>,
    pub mapping: BTreeMap<String, String>,
    pub bundles: Map<String, Value>,
    pub injections: Vec<Injection>,
    pub version: String,
    #[serde(skip)]
    seen_stylesheets: HashSet<String>,
}

impl Default for ManifestSnapshot {
    fn default() -> Self {
        Self {
            manifest_hash: String::new(),
            symbols: Map::new(),
            mapping: BTreeMap::new(),
            bundles: Map::new(),
            injections: Vec::new(),
            version: String::from("1"),
            seen_stylesheets: HashSet::new(),
        }
    }
}

// The seen set is bookkeeping for `diff` and never crosses the wire.
impl PartialEq for ManifestSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.manifest_hash == other.manifest_hash
            && self.symbols == other.symbols
            && self.mapping == other.mapping
            && self.bundles == other.bundles
            && self.injections == other.injections
            && self.version == other.version
    }
}

impl ManifestSnapshot {
    /// Whether a stylesheet URL is already part of the snapshot.
    pub fn has_stylesheet(&self, url: &str) -> bool {
        self.seen_stylesheets.contains(url)
    }
}

/// Scan the graph into a fresh snapshot.
pub fn snapshot(graph: &dyn ModuleGraph, root_dir: &str) -> ManifestSnapshot {
    let mut manifest = ManifestSnapshot::default();
    for node in graph.modules() {
        let url = node.versioned_url();
        if let Some(hook) = &node.hook {
            manifest
                .mapping
                .insert(hook.clone(), relative_url(&url, root_dir));
        }
        if node.is_stylesheet() && manifest.seen_stylesheets.insert(node.url.clone()) {
            manifest.injections.push(Injection::stylesheet(url));
        }
    }
    manifest
}

/// Stylesheets loaded since `snapshot` was taken, in discovery order.
///
/// Newly found URLs are recorded in the snapshot, so a second call without
/// graph changes returns nothing.
pub fn diff(graph: &dyn ModuleGraph, snapshot: &mut ManifestSnapshot) -> Vec<String> {
    let mut added = Vec::new();
    for node in graph.modules() {
        if node.is_stylesheet() && snapshot.seen_stylesheets.insert(node.url.clone()) {
            snapshot
                .injections
                .push(Injection::stylesheet(node.url.clone()));
            added.push(node.url);
        }
    }
    added
}

/// Strip the project root from a module URL, keeping a leading slash.
fn relative_url(url: &str, base: &str) -> String {
    match url.strip_prefix(base) {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        Some(rest) => format!("/{rest}"),
        None => url.to_string(),
    }
}

/// In-memory module graph fed by the sandbox loader and the dev host.
#[derive(Debug, Clone, Default)]
pub struct DevModuleGraph {
    nodes: Arc<RwLock<IndexMap<String, ModuleNode>>>,
}

impl DevModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a module; re-recording a known URL keeps its position.
    pub fn record(&self, node: ModuleNode) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.insert(node.url.clone(), node);
    }

    /// Mark a module as hot-reloaded at `timestamp`. Returns false if unknown.
    pub fn mark_reloaded(&self, url: &str, timestamp: u64) -> bool {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        match nodes.get_mut(url) {
            Some(node) => {
                node.last_hmr_timestamp = Some(timestamp);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ModuleGraph for DevModuleGraph {
    fn modules(&self) -> Vec<ModuleNode> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn graph(nodes: &[ModuleNode]) -> DevModuleGraph {
        let graph = DevModuleGraph::new();
        for node in nodes {
            graph.record(node.clone());
        }
        graph
    }

    #[test]
    fn test_snapshot_maps_hooks_relative_to_root() {
        let graph = graph(&[
            ModuleNode::new("/project/src/routes/index.tsx_entry_abc123.js")
                .with_hook("s_abc123"),
            ModuleNode::new("/src/components/header.tsx_header_def456.js").with_hook("s_def456"),
        ]);
        graph.mark_reloaded("/src/components/header.tsx_header_def456.js", 1700);

        let manifest = snapshot(&graph, "/project");
        assert_eq!(
            manifest.mapping,
            BTreeMap::from([
                (
                    "s_abc123".to_string(),
                    "/src/routes/index.tsx_entry_abc123.js".to_string()
                ),
                (
                    "s_def456".to_string(),
                    "/src/components/header.tsx_header_def456.js?t=1700".to_string()
                ),
            ])
        );
        assert_eq!(manifest.version, "1");
    }

    #[test]
    fn test_snapshot_collects_plain_stylesheets_only() {
        let graph = graph(&[
            ModuleNode::new("/src/global.css"),
            ModuleNode::new("/src/theme.scss"),
            ModuleNode::new("/src/inline.css?inline"),
            ModuleNode::new("/src/root.tsx"),
        ]);

        let manifest = snapshot(&graph, "/project");
        let hrefs: Vec<_> = manifest
            .injections
            .iter()
            .map(|injection| injection.attributes["href"].as_str())
            .collect();
        assert_eq!(hrefs, ["/src/global.css", "/src/theme.scss"]);
        assert!(manifest
            .injections
            .iter()
            .all(|injection| injection.location == InjectionLocation::Head));
    }

    #[test]
    fn test_reloaded_stylesheet_href_is_versioned() {
        let graph = graph(&[ModuleNode::new("/src/global.css")]);
        graph.mark_reloaded("/src/global.css", 42);

        let manifest = snapshot(&graph, "/project");
        assert_eq!(manifest.injections[0].attributes["href"], "/src/global.css?t=42");
        assert!(manifest.has_stylesheet("/src/global.css"));
    }

    #[test]
    fn test_diff_reports_only_new_stylesheets_in_order() {
        let graph = graph(&[ModuleNode::new("/src/global.css")]);
        let mut manifest = snapshot(&graph, "/project");

        graph.record(ModuleNode::new("/src/components/card.css"));
        graph.record(ModuleNode::new("/src/components/card.tsx"));
        graph.record(ModuleNode::new("/src/components/button.sass"));

        assert_eq!(
            diff(&graph, &mut manifest),
            ["/src/components/card.css", "/src/components/button.sass"]
        );
        assert_eq!(manifest.injections.len(), 3);
    }

    #[test]
    fn test_diff_is_idempotent() {
        let graph = graph(&[ModuleNode::new("/src/global.css")]);
        let mut manifest = snapshot(&graph, "/project");
        graph.record(ModuleNode::new("/src/late.css"));

        assert_eq!(diff(&graph, &mut manifest), ["/src/late.css"]);
        assert!(diff(&graph, &mut manifest).is_empty());
    }

    #[test]
    fn test_snapshot_serializes_without_seen_set() {
        let graph = graph(&[ModuleNode::new("/src/global.css")]);
        let value = serde_json::to_value(snapshot(&graph, "/")).unwrap();
        assert_eq!(value["version"], "1");
        assert!(value.get("seenStylesheets").is_none());
        assert_eq!(value["injections"][0]["attributes"]["rel"], "stylesheet");
    }

    #[test]
    fn test_snapshot_equal_after_wire_round_trip() {
        let graph = graph(&[
            ModuleNode::new("/src/global.css"),
            ModuleNode::new("/src/routes/index.tsx_entry_abc123.js").with_hook("s_abc123"),
        ]);
        let manifest = snapshot(&graph, "/");

        let decoded: ManifestSnapshot =
            serde_json::from_value(serde_json::to_value(&manifest).unwrap()).unwrap();

        assert!(!decoded.has_stylesheet("/src/global.css"));
        assert_eq!(decoded, manifest);
    }
}
