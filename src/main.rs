//! Fluxserve entry point.
//!
//! ## CLI Subcommands
//!
//! - `fluxserve` or `fluxserve serve` - run the HTTP server (default)
//! - `fluxserve version` - print the version
//! - `fluxserve help` - usage
//!
//! `serve` takes `--config PATH`; without it, defaults plus environment
//! overrides apply. Configured models are served by the built-in echo
//! generator unless a real loader is wired in through the library API.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use fluxserve::registry::EchoLoader;
use fluxserve::{telemetry, Config, Server, ShutdownResult};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("serve");

    match command {
        "serve" | "" => match run_serve(&args).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Server error: {e}");
                ExitCode::FAILURE
            }
        },
        "version" | "--version" | "-V" => {
            println!("fluxserve {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {command}");
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "fluxserve - streaming inference server v{version}

USAGE:
    fluxserve [COMMAND] [OPTIONS]

COMMANDS:
    serve        Run the HTTP server (default when no command given)
    version      Show version information
    help         Show this help message

OPTIONS:
    --config PATH  Load configuration from a TOML file

ENVIRONMENT:
    FLUXSERVE_HOST  Bind host override
    FLUXSERVE_PORT  Bind port override
    FLUXSERVE_LOG   Log filter override (also honors RUST_LOG)

ENDPOINTS:
    POST /infer         One-shot inference, JSON response
    POST /infer_stream  Newline-delimited JSON token stream
    GET  /health        Liveness (503 while draining)
    GET  /models        Loaded models and versions
    GET  /metrics       Sliding-window aggregates per model
    GET  /status        Composite debug view
"
    );
}

fn load_config(args: &[String]) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config_path = None;
    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                let path = args
                    .get(i + 1)
                    .ok_or("Missing value for --config")?;
                config_path = Some(path.clone());
                i += 2;
            }
            other => return Err(format!("Unknown argument: {other}").into()),
        }
    }
    let config = match config_path {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    Ok(config)
}

async fn run_serve(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args)?;
    telemetry::init_tracing(&config.log);
    telemetry::init_metrics();

    let server = Server::new(config);
    for model in &server.config.models {
        server
            .registry
            .register_loader(&model.name, Arc::new(EchoLoader), true)?;
    }
    server.load_configured().await?;
    server.spawn_background();

    let server = Arc::new(server);
    let app = fluxserve::router(Arc::clone(&server));

    let addr = server.config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    let shutdown_server = Arc::clone(&server);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "signal listener failed");
        }
        tracing::info!("shutdown signal received, draining");
        match shutdown_server.graceful_shutdown().await {
            ShutdownResult::Complete => tracing::info!("drain complete"),
            ShutdownResult::Timeout { remaining } => {
                tracing::warn!(remaining, "drain budget elapsed");
            }
        }
    })
    .await?;

    Ok(())
}
