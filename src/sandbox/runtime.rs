//! Isolate construction and script evaluation.
//!
//! Provides only the minimal worker APIs:
//! - console.log/info/debug/warn/error (captured, re-emitted as tracing events)
//! - atob, btoa
//! - crypto.randomUUID, crypto.getRandomValues, crypto.subtle.digest
//! - Module loading from the chunks directory only
//! - No fs, net, env, or other system access

use super::loader::SandboxedLoader;
use super::ops::{ssr_bridge_runtime, ConsoleOutput};
use crate::config::SandboxConfig;
use crate::error::SandboxError;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use std::rc::Rc;
use tracing::warn;

/// Create the isolate for a sandbox.
pub(crate) fn create_runtime(config: &SandboxConfig, loader: SandboxedLoader) -> JsRuntime {
    let create_params = config
        .max_heap_size
        .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

    let mut runtime = JsRuntime::new(RuntimeOptions {
        module_loader: Some(Rc::new(loader)),
        extensions: vec![ssr_bridge_runtime::init_ops_and_esm()],
        create_params,
        ..Default::default()
    });

    if config.max_heap_size.is_some() {
        // Keep the limit: V8 raises an OOM error instead of growing the heap
        runtime.add_near_heap_limit_callback(|current, initial| {
            warn!(
                current_mb = current / (1024 * 1024),
                initial_mb = initial / (1024 * 1024),
                "sandbox near heap limit"
            );
            current
        });
    }

    runtime.op_state().borrow_mut().put(ConsoleOutput::default());
    runtime
}

/// Take the console output captured since the last call.
pub(crate) fn drain_console(runtime: &mut JsRuntime) -> ConsoleOutput {
    std::mem::take(
        runtime
            .op_state()
            .borrow_mut()
            .borrow_mut::<ConsoleOutput>(),
    )
}

/// Evaluate `code`, drive the event loop, and return the string it settles to.
pub(crate) async fn evaluate(runtime: &mut JsRuntime, code: String) -> Result<String, SandboxError> {
    let global = runtime
        .execute_script("<ssr-bridge>", code)
        .map_err(|e| SandboxError::Script(e.to_string()))?;

    runtime
        .run_event_loop(PollEventLoopOptions::default())
        .await
        .map_err(|e| SandboxError::Script(e.to_string()))?;

    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, &global);

    if let Ok(promise) = v8::Local::<v8::Promise>::try_from(local) {
        match promise.state() {
            v8::PromiseState::Fulfilled => {
                let result = promise.result(scope);
                if result.is_string() {
                    Ok(result.to_rust_string_lossy(scope))
                } else {
                    Err(SandboxError::Script(String::from(
                        "bridge call must resolve to a string",
                    )))
                }
            }
            v8::PromiseState::Rejected => {
                let exception = promise.result(scope);
                Err(SandboxError::Script(exception.to_rust_string_lossy(scope)))
            }
            v8::PromiseState::Pending => Err(SandboxError::Script(String::from(
                "bridge call returned an unresolved promise",
            ))),
        }
    } else if local.is_string() {
        Ok(local.to_rust_string_lossy(scope))
    } else {
        Err(SandboxError::Script(String::from(
            "bridge call must return a string",
        )))
    }
}
