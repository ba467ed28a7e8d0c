//! SSR dev bridge CLI
//!
//! Single-shot mode:
//!   ssr-dev-bridge render --chunks-dir <dir> [--entry <entry>] [<path>] [--env-data <json>]
//!
//! Server mode (persistent process, reads from stdin):
//!   ssr-dev-bridge serve --chunks-dir <dir> [--entry <entry>]
//!
//! Production preview (one request through the built preview entry):
//!   ssr-dev-bridge preview --ssr-out-dir <dir> [<path>]
//!
//! Deployment artifacts:
//!   ssr-dev-bridge generate --client-out-dir <dir> --server-out-dir <dir> [--base /]
//!
//! Protocol (server mode):
//!   Request (stdin):
//!     /about?lang=de
//!     {"theme":"dark"}
//!
//!   Response (stdout):
//!     Status:Ok
//!     Length:1234
//!
//!     <!DOCTYPE html>...
//!
//!   Error response:
//!     Status:Error
//!     Length:42
//!
//!     render failed: failed to import ...

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use http::header::{ACCEPT, HOST};
use http::Request;
use serde_json::{Map, Value};
use ssr_dev_bridge::adapter::{self, PagesAdapterOptions};
use ssr_dev_bridge::middleware::run_chain;
use ssr_dev_bridge::preview::{configure_preview_server, SandboxPreviewLoader};
use ssr_dev_bridge::{
    BridgeConfig, BufferedResponse, DevDispatcher, DevModuleGraph, DevServerConfig, Flow,
    JsSandbox, Middleware, PlainHost, ResponseSink, SandboxConfig, SandboxFunctions, SandboxRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ssr-dev-bridge", version, about = "Dev-server SSR inside a sandboxed worker runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Render one request and print the document.
    Render {
        #[command(flatten)]
        sandbox: SandboxArgs,
        /// Request path, with query.
        #[arg(default_value = "/")]
        path: String,
        /// Response-scoped env data (JSON object) handed to the render.
        #[arg(long)]
        env_data: Option<String>,
    },
    /// Serve render requests from stdin until it closes.
    Serve {
        #[command(flatten)]
        sandbox: SandboxArgs,
    },
    /// Serve one request through the built `entry.preview` module.
    Preview {
        /// SSR output dir holding `entry.preview.{mjs,js}`.
        #[arg(long)]
        ssr_out_dir: PathBuf,
        /// Request path, with query.
        #[arg(default_value = "/")]
        path: String,
        /// Heap limit of the isolate in MiB.
        #[arg(long, default_value_t = 64)]
        max_heap_mb: usize,
    },
    /// Write `_routes.json` and `_worker.js` for an edge-pages deployment.
    Generate {
        #[arg(long)]
        client_out_dir: PathBuf,
        #[arg(long)]
        server_out_dir: PathBuf,
        /// Base pathname of the site.
        #[arg(long, default_value = "/")]
        base: String,
        /// Skip `_routes.json`.
        #[arg(long)]
        no_function_routes: bool,
        /// Pathnames served as static files.
        #[arg(long = "static-path")]
        static_paths: Vec<String>,
    },
}

#[derive(Debug, Args)]
struct SandboxArgs {
    /// Directory with the built JS chunks; nothing outside it is readable.
    #[arg(long, env = "SSR_CHUNKS_DIR")]
    chunks_dir: PathBuf,
    /// SSR entry module, relative to the chunks dir.
    #[arg(long, default_value = "./entry.ssr.js")]
    entry: String,
    /// Heap limit of the isolate in MiB.
    #[arg(long, default_value_t = 64)]
    max_heap_mb: usize,
    /// KV namespaces exposed to loaders.
    #[arg(long = "kv")]
    kv_namespaces: Vec<String>,
}

/// The dev pipeline the CLI drives: platform bindings, then SSR.
struct DevServer {
    bindings: Vec<Middleware>,
    dispatcher: DevDispatcher,
    functions: Arc<SandboxFunctions>,
}

impl DevServer {
    async fn start(args: SandboxArgs) -> Result<Self> {
        let config = SandboxConfig {
            chunks_dir: args.chunks_dir.clone(),
            max_heap_size: Some(args.max_heap_mb * 1024 * 1024),
            kv_namespaces: args.kv_namespaces,
            ..Default::default()
        };
        let bindings = vec![adapter::platform_bindings_middleware(config.env_bindings())];

        let graph = DevModuleGraph::new();
        let sandbox = JsSandbox::spawn(config, Some(graph.clone()))
            .await
            .context("failed to start sandbox")?;

        let registry = SandboxRegistry::new();
        let functions = registry.register_once(Arc::new(sandbox), BridgeConfig::default());
        let dispatcher = DevDispatcher::new(
            DevServerConfig {
                root_dir: args.chunks_dir,
                entry_point: args.entry,
                ..Default::default()
            }
            .with_env(),
            Arc::new(graph),
            functions.clone(),
            Arc::new(PlainHost),
        );

        Ok(Self {
            bindings,
            dispatcher,
            functions,
        })
    }

    /// Render `path`; the body on success, the failure message otherwise.
    async fn render(&self, path: &str, env_data: Map<String, Value>) -> Result<String> {
        let req = Request::get(path)
            .header(HOST, "localhost")
            .header(ACCEPT, "text/html")
            .body(())
            .with_context(|| format!("invalid request path '{path}'"))?;
        let mut res = BufferedResponse::new().with_env_data(env_data);

        let flow = match run_chain(&self.bindings, &req, &mut res) {
            Flow::Next => self.dispatcher.handle(&req, &mut res).await,
            flow => flow,
        };
        match flow {
            Flow::Done => Ok(res.body_text()),
            Flow::Next => bail!("'{path}' is not a page request"),
            Flow::Error(failure) => Err(anyhow!(failure.message)),
        }
    }

    async fn shutdown(self) {
        self.functions.tasks().shutdown().await;
    }
}

fn parse_env_data(json: &str) -> Result<Map<String, Value>> {
    if json.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str(json).context("invalid env data JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("env data must be a JSON object, got {other}"),
    }
}

/// Run in single-shot mode
async fn run_single_shot(args: SandboxArgs, path: &str, env_data: Option<&str>) -> Result<()> {
    let env_data = parse_env_data(env_data.unwrap_or_default())?;
    let server = DevServer::start(args).await?;
    let result = server.render(path, env_data).await;
    server.shutdown().await;

    println!("{}", result?);
    Ok(())
}

/// Run in server mode (persistent process, reads requests from stdin)
async fn run_server(args: SandboxArgs) -> Result<()> {
    // Sandbox starts once; V8 cold start happens here
    let server = DevServer::start(args).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    info!("server ready, reading from stdin");

    while let Some(path_line) = lines.next_line().await? {
        let env_line = lines.next_line().await?.unwrap_or_default();
        let path = path_line.trim();

        let result = match parse_env_data(&env_line) {
            Ok(env_data) => server.render(path, env_data).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(html) => write_response(&mut stdout, true, &html).await?,
            Err(err) => write_response(&mut stdout, false, &format!("{err:#}")).await?,
        }
    }

    info!("stdin closed, shutting down");
    server.shutdown().await;
    Ok(())
}

/// Run one request through the preview middlewares and print the body
async fn run_preview(ssr_out_dir: PathBuf, path: &str, max_heap_mb: usize) -> Result<()> {
    let config = SandboxConfig {
        chunks_dir: ssr_out_dir.clone(),
        max_heap_size: Some(max_heap_mb * 1024 * 1024),
        ..Default::default()
    };
    let sandbox = JsSandbox::spawn(config, None)
        .await
        .context("failed to start preview sandbox")?;
    let middlewares = configure_preview_server(&ssr_out_dir, &SandboxPreviewLoader::new(sandbox)).await;

    let req = Request::get(path)
        .header(HOST, "localhost")
        .header(ACCEPT, "text/html")
        .body(())
        .with_context(|| format!("invalid request path '{path}'"))?;
    let mut res = BufferedResponse::new();
    match run_chain(&middlewares, &req, &mut res) {
        Flow::Done => {
            info!(status = %res.status(), "preview response");
            println!("{}", res.body_text());
            Ok(())
        }
        Flow::Next => bail!("preview server did not handle '{path}'"),
        Flow::Error(failure) => Err(anyhow!(failure.message)),
    }
}

/// Write response in length-prefixed protocol
async fn write_response(stdout: &mut tokio::io::Stdout, ok: bool, body: &str) -> Result<()> {
    let status = if ok { "Ok" } else { "Error" };
    let head = format!("Status:{status}\nLength:{}\n\n", body.len());
    stdout.write_all(head.as_bytes()).await?;
    stdout.write_all(body.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Render {
            sandbox,
            path,
            env_data,
        } => run_single_shot(sandbox, &path, env_data.as_deref()).await,
        Command::Serve { sandbox } => run_server(sandbox).await,
        Command::Preview {
            ssr_out_dir,
            path,
            max_heap_mb,
        } => run_preview(ssr_out_dir, &path, max_heap_mb).await,
        Command::Generate {
            client_out_dir,
            server_out_dir,
            base,
            no_function_routes,
            static_paths,
        } => {
            let opts = PagesAdapterOptions {
                function_routes: !no_function_routes,
                static_paths,
            };
            let origin = adapter::adapter_origin(|key| std::env::var(key).ok());
            info!(%origin, base = %base, "generating adapter artifacts");
            let artifacts = adapter::generate(&client_out_dir, &server_out_dir, &base, &opts).await?;
            for path in [artifacts.routes_json, artifacts.worker_js].into_iter().flatten() {
                println!("wrote {}", path.display());
            }
            Ok(())
        }
    }
}
