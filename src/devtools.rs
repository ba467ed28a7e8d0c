//! Developer tooling appended to dev renders, and the client-only dev page.

use crate::config::DevToolsOptions;
use serde_json::{json, Value};
use std::path::Path;
use url::Url;

/// Styles for the dev server's error overlay.
pub const ERROR_OVERLAY_STYLES: &str = include_str!("assets/error-overlay.css");

const ERROR_HOST: &str = include_str!("assets/error-host.html");
const PERF_WARNING: &str = include_str!("assets/perf-warning.html");
const IMAGE_DEV_TOOLS: &str = include_str!("assets/image-size-runtime.html");
const CLICK_TO_COMPONENT: &str = include_str!("assets/click-to-component.html");

/// Query flag marking the client entry import in client-only dev mode.
pub const VITE_DEV_CLIENT_QS: &str = "qwik-vite-dev-client";

/// `<style>` block with the error overlay styles.
pub fn error_overlay_style() -> String {
    format!("<style>{ERROR_OVERLAY_STYLES}</style>")
}

/// Footer written after every dev render.
pub fn end_ssr_script(opts: &DevToolsOptions, src_dir: &Path) -> String {
    format!(
        "\n{}\n<script type=\"module\" src=\"/@vite/client\"></script>\n{ERROR_HOST}\n{PERF_WARNING}\n{}\n",
        error_overlay_style(),
        dev_inspector(opts, src_dir),
    )
}

/// Inspector bootstrap: `globalThis.qwikdevtools`, image checks and,
/// when hot keys are configured, click-to-source.
fn dev_inspector(opts: &DevToolsOptions, src_dir: &Path) -> String {
    let qwikdevtools = json!({
        "hotKeys": opts.click_to_source.clone().unwrap_or_default(),
        "srcDir": inspector_src_dir(src_dir),
    });
    let click_to_component = if opts.click_to_source.is_some() {
        CLICK_TO_COMPONENT
    } else {
        ""
    };
    format!(
        "<script>\n      globalThis.qwikdevtools = {};\n    </script>{IMAGE_DEV_TOOLS}{click_to_component}",
        escape_script(&qwikdevtools.to_string()),
    )
}

/// Source dir as an URL on a placeholder origin, with a trailing slash.
fn inspector_src_dir(src_dir: &Path) -> String {
    let path = format!("{}/", src_dir.to_string_lossy().replace('\\', "/"));
    Url::parse("http://local.local")
        .and_then(|base| base.join(&path))
        .map(String::from)
        .unwrap_or_else(|_| format!("http://local.local/{}", path.trim_start_matches('/')))
}

/// Bootstrap page for client-only dev mode: imports the client entry and
/// hands it the server data.
pub fn dev_index_html(entry_url: &str, server_data: &Value) -> String {
    // JSON text embedded as a JS string literal, parsed again in the page
    let embedded = Value::String(server_data.to_string()).to_string();
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
  </head>
  <body>
    <script type="module">
    async function main() {{
      const mod = await import("{entry_url}?{VITE_DEV_CLIENT_QS}=");
      if (mod.default) {{
        const serverData = JSON.parse({embedded})
        mod.default({{
          serverData,
        }});
      }}
    }}
    main();
    </script>
    {ERROR_HOST}
  </body>
</html>"#,
        embedded = escape_script(&embedded),
    )
}

/// Keep JSON from closing the surrounding `<script>` element.
fn escape_script(json: &str) -> String {
    json.replace('<', "\\u003c")
}
