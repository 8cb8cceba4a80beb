//! Script Bridge CLI
//!
//! Runs one request through the simulated host with the built-in handlers
//! and prints what the client would receive.
//!
//! # Usage
//!
//! ```bash
//! # Default greeting
//! script-bridge
//!
//! # Echo a body delivered in 4-byte pieces
//! script-bridge --method POST --uri /echo --body "hello there" --chunk-size 4
//!
//! # Custom directory configuration
//! script-bridge --config bridge.toml --uri /headers -H "X-Trace: 1"
//! ```

use anyhow::Context;
use clap::Parser;
use http::StatusCode;
use script_bridge::{
    BridgeConfig, DirectoryConfig, HostRequest, Phase, ScriptContext, SimulatedHost, Status,
};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Script Bridge - run a request through script handlers
#[derive(Parser, Debug)]
#[command(name = "script-bridge")]
#[command(author = "Ivan Pasco <ivan@cleanframework.com>")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a request through the script bridge's simulated host", long_about = None)]
struct Args {
    /// TOML configuration file; built-in directories are used without one
    #[arg(short, long, env = "SCRIPT_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Request method
    #[arg(short, long, default_value = "GET")]
    method: String,

    /// Request URI, with optional query string
    #[arg(short, long, default_value = "/")]
    uri: String,

    /// Request header as "Name: value"; may be repeated
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    headers: Vec<String>,

    /// Request body
    #[arg(short, long)]
    body: Option<String>,

    /// Size of the pieces the body is delivered in
    #[arg(long, default_value = "8192")]
    chunk_size: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn default_config() -> BridgeConfig {
    BridgeConfig::default()
        .with_directory(DirectoryConfig::new("/").with_handler(Phase::Handler, "hello"))
        .with_directory(DirectoryConfig::new("/echo").with_handler(Phase::Handler, "echo"))
        .with_directory(DirectoryConfig::new("/headers").with_handler(Phase::Handler, "headers"))
        .with_directory(
            DirectoryConfig::new("/private")
                .with_handler(Phase::AuthenHandler, "deny")
                .with_handler(Phase::Handler, "hello"),
        )
}

fn register_builtins(context: &ScriptContext) {
    context.register_fn("hello", |req, py| {
        req.set_content_type("text/plain")?;
        req.write(py, format!("Hello from {}\n", req.uri()?), false)?;
        Ok(Status::Ok)
    });

    context.register_fn("echo", |req, py| {
        let body = req.read(py, None)?;
        let content_type = req
            .headers_in()
            .find("Content-Type")?
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "application/octet-stream".to_owned());
        req.set_content_type(&content_type)?;
        req.write(py, &body, false)?;
        Ok(Status::Ok)
    });

    context.register_fn("headers", |req, py| {
        req.set_content_type("text/plain")?;
        let mut out = String::new();
        for (k, v) in req.headers_in().items()? {
            out.push_str(&format!("{}: {}\n", k, v));
        }
        req.write(py, out, false)?;
        Ok(Status::Ok)
    });

    context.register_fn("deny", |req, _py| {
        req.err_headers_out()
            .set("WWW-Authenticate", "Basic realm=\"private\"")?;
        Ok(Status::Http(StatusCode::UNAUTHORIZED))
    });
}

fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let (k, v) = raw
        .split_once(':')
        .with_context(|| format!("header must look like \"Name: value\": {}", raw))?;
    Ok((k.trim().to_owned(), v.trim().to_owned()))
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => default_config(),
    };

    let mut request = HostRequest::new(&args.method, &args.uri).chunk_size(args.chunk_size);
    for raw in &args.headers {
        let (k, v) = parse_header(raw)?;
        request = request.header(k, v);
    }
    if let Some(body) = args.body {
        request = request.body(body);
    }

    let host = SimulatedHost::new(config)?;
    register_builtins(host.context());

    info!("Request: {} {}", request.method, request.uri);
    let response = host.run(request)?;
    info!("Status: {}", response.status);

    print!("{}", String::from_utf8_lossy(&response.output));
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    // Handlers block on the transport, so keep them off the async workers.
    match tokio::task::spawn_blocking(move || run(args)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Request failed: {:#}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Worker panicked: {}", e);
            std::process::exit(1);
        }
    }
}
