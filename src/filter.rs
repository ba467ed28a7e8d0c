//! Decides whether a dev-server request is server-rendered or passed through
//! to the next middleware.

use http::header::ACCEPT;
use http::Request;
use regex::Regex;
use std::sync::LazyLock;
use url::Url;

/// Trailing file extension on a pathname.
static EXTENSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.[\w?=&]+$").expect("valid extension pattern"));

/// Internal dev-server prefixes: filesystem proxy, module-id proxy, client runtime.
static INTERNAL_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:/@fs/|/@id/|/@vite/)").expect("valid prefix pattern"));

/// Path markers used by dev tooling: live-reload probe and editor-open requests.
const DEV_TOOLING_MARKERS: &[&str] = &["_-vite-ping", "__open-in-editor"];

/// Framework build-artifact path served by the bundler.
const FRAMEWORK_BUILD_PATH: &str = "@builder.io/qwik/build";

/// Whether `req` should be server-rendered.
///
/// Rules are evaluated in order and the first match wins. A bare `*/*`
/// accept header is checked before the `text/html` membership test so that
/// plain HTTP clients (curl) get HTML.
pub fn should_render<B>(req: &Request<B>, url: &Url) -> bool {
    let pathname = url.path();

    if EXTENSION_RE.is_match(pathname) && !pathname.ends_with(".html") {
        return false;
    }
    if DEV_TOOLING_MARKERS
        .iter()
        .any(|marker| pathname.contains(marker))
    {
        return false;
    }
    if url
        .query_pairs()
        .any(|(key, value)| key == "html-proxy" || (key == "ssr" && value == "false"))
    {
        return false;
    }
    if INTERNAL_PREFIX_RE.is_match(pathname) || pathname.contains(FRAMEWORK_BUILD_PATH) {
        return false;
    }

    let accepts = accepted_types(req);
    if accepts.len() == 1 && accepts[0] == "*/*" {
        return true;
    }
    accepts.iter().any(|accept| accept == "text/html")
}

/// Media types from every `Accept` header, parameters stripped.
fn accepted_types<B>(req: &Request<B>) -> Vec<String> {
    let joined = req
        .headers()
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect::<Vec<_>>()
        .join(",");

    joined
        .split(',')
        .map(|accept| accept.split(';').next().unwrap_or_default().trim().to_string())
        .collect()
}
