//! Netservices RPC - TCP endpoint, stdio worker and one-shot client.
//!
//! `serve` exposes a demo object on a TCP port, either directly or fanned out
//! across a worker pool. `worker` is the stdio side of a process worker and is
//! launched by `serve --workers N --process-workers`. `call` connects to a
//! running endpoint, performs one call and prints the JSON result.

mod demo;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use netservices::{MuxOptions, Service, ServiceApiOptions, ServiceAppOptions};
use serde_json::Value;
use server::{ServerConfig, WorkerKind};
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "netservices-rpc")]
#[command(about = "Bidirectional RPC endpoint for netservices")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo object over TCP
    Serve(ServeArgs),
    /// Run as a process worker over stdin/stdout
    Worker,
    /// Call a method on a running endpoint and print the result
    Call(CallArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Number of pool workers (0 = serve in this process)
    #[arg(short, long, default_value = "0")]
    workers: usize,

    /// Run workers as child processes instead of threads
    #[arg(long)]
    process_workers: bool,

    /// Replace workers that exit
    #[arg(long)]
    restart_workers: bool,

    /// Egress queue limit per connection, in bytes
    #[arg(long)]
    egress_limit: Option<usize>,

    /// Ingress queue limit per connection, in bytes
    #[arg(long)]
    ingress_limit: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct CallArgs {
    /// Address of the endpoint
    #[arg(long, default_value = "127.0.0.1:7000")]
    addr: String,

    /// Call timeout in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Dot-separated method path, e.g. `greeter.greet`
    path: String,

    /// Arguments; each is parsed as JSON and falls back to a plain string
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Stdout carries frames in worker mode, so logs always go to stderr
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Worker => worker().await,
        Command::Call(args) => call(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    info!("Starting netservices RPC server");

    let mut mux_options = MuxOptions::new();
    if let Some(limit) = args.egress_limit {
        mux_options = mux_options.with_egress_limit(limit);
    }
    if let Some(limit) = args.ingress_limit {
        mux_options = mux_options.with_ingress_limit(limit);
    }

    let addr = server::start_server(ServerConfig {
        host: args.host,
        port: args.port,
        workers: args.workers,
        worker_kind: if args.process_workers {
            WorkerKind::Process
        } else {
            WorkerKind::Thread
        },
        restart_workers: args.restart_workers,
        mux_options,
    })
    .await?;

    // Print port for launchers to read (intentional stdout for IPC)
    println!("RPC_PORT={}", addr.port());

    info!("RPC server running on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}

async fn worker() -> Result<()> {
    let state = netservices::serve_stdio(|service| {
        service.create_service_app(demo::demo_object(), ServiceAppOptions::default())?;
        Ok(())
    })
    .await?;
    info!("Worker link ended: {:?}", state);
    Ok(())
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn call(args: CallArgs) -> Result<()> {
    let stream = tokio::net::TcpStream::connect(&args.addr).await?;
    let service = Service::new(stream, MuxOptions::default());

    let mut options = ServiceApiOptions::new();
    if let Some(millis) = args.timeout {
        options = options.with_timeout(Duration::from_millis(millis));
    }
    let api = service.create_service_api(options)?;

    let call_args: Vec<Value> = args.args.iter().map(|raw| parse_arg(raw)).collect();
    let result = api.call(args.path.as_str(), call_args).await;
    service.close();

    let value = result?;
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}
