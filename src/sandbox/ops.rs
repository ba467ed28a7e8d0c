//! Ops backing the worker globals and the render bridge inside the isolate.

use crate::bridge::SymbolMapper;
use crate::stream::StreamWriter;
use base64::Engine;
use deno_core::anyhow::{anyhow, Error};
use deno_core::{op2, OpState};
use tracing::{debug, error, info, warn};

// ============================================================================
// Console Output Capture
// ============================================================================

/// Console output captured while a command runs in the sandbox
#[derive(Debug, Default, Clone)]
pub struct ConsoleOutput {
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

impl ConsoleOutput {
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.warns.is_empty() && self.errors.is_empty()
    }

    /// Re-emit captured lines as tracing events.
    pub fn emit(&self) {
        for line in &self.logs {
            info!(target: "sandbox::console", "{line}");
        }
        for line in &self.warns {
            warn!(target: "sandbox::console", "{line}");
        }
        for line in &self.errors {
            error!(target: "sandbox::console", "{line}");
        }
    }
}

#[op2(fast)]
pub fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.logs.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.warns.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.errors.push(msg.to_string());
    }
}

// ============================================================================
// Render Bridge
// ============================================================================

/// Writer of the render currently running in the isolate.
pub struct RenderSink(pub StreamWriter);

#[op2(fast)]
pub fn op_render_write(state: &mut OpState, #[string] chunk: &str) {
    write_chunk(state, chunk.as_bytes().to_vec());
}

#[op2(fast)]
pub fn op_render_write_bytes(state: &mut OpState, #[buffer] chunk: &[u8]) {
    write_chunk(state, chunk.to_vec());
}

fn write_chunk(state: &mut OpState, chunk: Vec<u8>) {
    match state.try_borrow::<RenderSink>() {
        Some(RenderSink(writer)) => {
            if writer.write(chunk).is_err() {
                debug!("dropping render chunk written after close");
            }
        }
        None => debug!("dropping render chunk, no render in progress"),
    }
}

#[op2(fast)]
pub fn op_render_close(state: &mut OpState) {
    if let Some(RenderSink(writer)) = state.try_take::<RenderSink>() {
        writer.close();
    }
}

#[op2]
#[serde]
pub fn op_resolve_symbol(
    state: &mut OpState,
    #[string] symbol: &str,
    #[serde] mapping: Option<serde_json::Map<String, serde_json::Value>>,
) -> serde_json::Value {
    match state.try_borrow::<SymbolMapper>() {
        Some(mapper) => mapper.resolve(symbol, mapping.as_ref()),
        None => SymbolMapper::new("src").resolve(symbol, mapping.as_ref()),
    }
}

// ============================================================================
// Crypto Ops
// ============================================================================

#[op2]
#[string]
pub fn op_crypto_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[op2(fast)]
pub fn op_crypto_get_random_values(#[buffer] buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

#[op2]
#[buffer]
pub fn op_crypto_subtle_digest(
    #[string] algorithm: &str,
    #[buffer] data: &[u8],
) -> Result<Vec<u8>, Error> {
    digest(algorithm, data)
}

/// SHA digest by WebCrypto algorithm name (`SHA-256`, `sha384`, ...).
pub(crate) fn digest(algorithm: &str, data: &[u8]) -> Result<Vec<u8>, Error> {
    use sha2::{Digest, Sha256, Sha384, Sha512};

    match algorithm.to_uppercase().replace('-', "").as_str() {
        "SHA256" => Ok(Sha256::digest(data).to_vec()),
        "SHA384" => Ok(Sha384::digest(data).to_vec()),
        "SHA512" => Ok(Sha512::digest(data).to_vec()),
        _ => Err(anyhow!(
            "Unsupported algorithm: {}. Supported: SHA-256, SHA-384, SHA-512",
            algorithm
        )),
    }
}

// ============================================================================
// Encoding Ops
// ============================================================================

#[op2]
#[string]
pub fn op_btoa(#[string] data: &str) -> String {
    btoa(data)
}

#[op2]
#[string]
pub fn op_atob(#[string] data: &str) -> Result<String, Error> {
    atob(data)
}

/// btoa expects Latin-1, but UTF-8 input is accepted as-is
pub(crate) fn btoa(data: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(data.as_bytes())
}

pub(crate) fn atob(data: &str) -> Result<String, Error> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| anyhow!("Invalid base64: {}", e))?;
    String::from_utf8(bytes).map_err(|e| anyhow!("Invalid UTF-8 in decoded data: {}", e))
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    ssr_bridge_runtime,
    ops = [
        op_console_log,
        op_console_warn,
        op_console_error,
        op_render_write,
        op_render_write_bytes,
        op_render_close,
        op_resolve_symbol,
        op_crypto_random_uuid,
        op_crypto_get_random_values,
        op_crypto_subtle_digest,
        op_btoa,
        op_atob,
    ],
    esm_entry_point = "ext:ssr_bridge_runtime/bootstrap.js",
    esm = ["ext:ssr_bridge_runtime/bootstrap.js" = "src/sandbox/bootstrap.js"],
);
