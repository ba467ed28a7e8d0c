//! Connect-style middleware surface shared by the dev dispatcher, the preview
//! server and the deployment adapter.

use bytes::BytesMut;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Request, StatusCode};
use serde_json::{Map, Value};
use std::fmt;
use std::io;
use std::sync::Arc;

/// Callback resolving a pending render on the host side.
pub type RenderResolve = Box<dyn FnOnce() + Send>;

/// A failure forwarded to the error middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    /// Error message after stack-trace fixing.
    pub message: String,
    /// Full report including the cause chain.
    pub report: String,
}

/// What a middleware asks the chain to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Not handled, continue with the next middleware.
    Next,
    /// Response written.
    Done,
    /// Pass to the error middleware.
    Error(DispatchFailure),
}

/// The writable HTTP response seen by middlewares.
pub trait ResponseSink: Send {
    /// Status that will be sent (defaults to 200).
    fn status(&self) -> StatusCode;
    fn set_status(&mut self, status: StatusCode);
    fn set_header(&mut self, name: HeaderName, value: HeaderValue);
    fn write_head(&mut self, status: StatusCode);
    fn write(&mut self, chunk: &[u8]) -> io::Result<()>;
    fn end(&mut self);
    fn is_ended(&self) -> bool;

    /// Response-scoped data contributed by earlier middlewares.
    fn env_data(&self) -> &Map<String, Value>;
    fn env_data_mut(&mut self) -> &mut Map<String, Value>;

    /// Take the pending-render callback, if one was installed.
    fn take_render_resolve(&mut self) -> Option<RenderResolve>;
}

/// Synchronous middleware function.
pub type Handler = Arc<dyn Fn(&Request<()>, &mut dyn ResponseSink) -> Flow + Send + Sync>;

/// A middleware installed on the server.
#[derive(Clone)]
pub enum Middleware {
    Single(Handler),
    /// Router first; the not-found handler runs when the router passes.
    RouterWithNotFound { router: Handler, not_found: Handler },
}

impl Middleware {
    pub fn single<F>(handler: F) -> Self
    where
        F: Fn(&Request<()>, &mut dyn ResponseSink) -> Flow + Send + Sync + 'static,
    {
        Self::Single(Arc::new(handler))
    }

    pub fn handle(&self, req: &Request<()>, res: &mut dyn ResponseSink) -> Flow {
        match self {
            Self::Single(handler) => handler(req, res),
            Self::RouterWithNotFound { router, not_found } => match router(req, res) {
                Flow::Next => not_found(req, res),
                flow => flow,
            },
        }
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(_) => f.write_str("Middleware::Single"),
            Self::RouterWithNotFound { .. } => f.write_str("Middleware::RouterWithNotFound"),
        }
    }
}

/// Run middlewares in order until one handles the request or fails.
pub fn run_chain(middlewares: &[Middleware], req: &Request<()>, res: &mut dyn ResponseSink) -> Flow {
    for middleware in middlewares {
        match middleware.handle(req, res) {
            Flow::Next => continue,
            flow => return flow,
        }
    }
    Flow::Next
}

/// In-memory response, used by the CLI and in tests.
#[derive(Default)]
pub struct BufferedResponse {
    status: Option<StatusCode>,
    headers: HeaderMap,
    head_written: bool,
    body: BytesMut,
    ended: bool,
    env_data: Map<String, Value>,
    render_resolve: Option<RenderResolve>,
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env_data(mut self, env_data: Map<String, Value>) -> Self {
        self.env_data = env_data;
        self
    }

    pub fn with_render_resolve(mut self, resolve: impl FnOnce() + Send + 'static) -> Self {
        self.render_resolve = Some(Box::new(resolve));
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn head_written(&self) -> bool {
        self.head_written
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl fmt::Debug for BufferedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedResponse")
            .field("status", &self.status())
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

impl ResponseSink for BufferedResponse {
    fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    fn write_head(&mut self, status: StatusCode) {
        self.status = Some(status);
        self.head_written = true;
    }

    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.ended {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after end of response",
            ));
        }
        self.head_written = true;
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    fn end(&mut self) {
        self.head_written = true;
        self.ended = true;
    }

    fn is_ended(&self) -> bool {
        self.ended
    }

    fn env_data(&self) -> &Map<String, Value> {
        &self.env_data
    }

    fn env_data_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.env_data
    }

    fn take_render_resolve(&mut self) -> Option<RenderResolve> {
        self.render_resolve.take()
    }
}
