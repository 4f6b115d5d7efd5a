//! TCP endpoint serving the demo object, directly or through a worker pool.

use crate::demo::demo_object;
use netservices::{
    MuxOptions, ProcessWorker, Service, ServiceAppOptions, ServicePool, ServicePoolOptions,
    ThreadWorker,
};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// How connections are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Thread,
    Process,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Zero serves every connection in this process.
    pub workers: usize,
    pub worker_kind: WorkerKind,
    pub restart_workers: bool,
    pub mux_options: MuxOptions,
}

enum Backend {
    Direct,
    Pool(ServicePool),
}

impl Backend {
    fn serve(&self, stream: TcpStream, peer: SocketAddr, options: MuxOptions) {
        match self {
            Backend::Direct => {
                let service = Service::new(stream, options);
                let app = service.create_service_app(demo_object(), ServiceAppOptions::default());
                if let Err(err) = app {
                    warn!("Failed to serve {}: {}", peer, err);
                    return;
                }
                tokio::spawn(async move {
                    let state = service.closed().await;
                    debug!("Connection {} ended: {:?}", peer, state);
                });
            }
            Backend::Pool(pool) => {
                let mux = pool.connect_with(stream, options);
                tokio::spawn(async move {
                    let state = mux.closed().await;
                    debug!("Connection {} ended: {:?}", peer, state);
                });
            }
        }
    }
}

async fn start_pool(config: &ServerConfig) -> anyhow::Result<ServicePool> {
    let options = match config.worker_kind {
        WorkerKind::Thread => ServicePoolOptions::new(
            config.workers,
            ThreadWorker::new(|service: &Service| {
                service.create_service_app(demo_object(), ServiceAppOptions::default())?;
                Ok(())
            })
            .with_name("netservices-rpc-worker"),
        ),
        WorkerKind::Process => {
            let program = std::env::current_exe()?;
            ServicePoolOptions::new(
                config.workers,
                ProcessWorker::new(program).with_arg("worker"),
            )
        }
    }
    .with_restart_on_error(config.restart_workers);

    let pool = ServicePool::start(options);
    pool.ready().await;
    if pool.worker_count() == 0 {
        anyhow::bail!("none of the {} workers started", config.workers);
    }
    info!("{} of {} workers ready", pool.worker_count(), config.workers);
    Ok(pool)
}

/// Start the TCP endpoint.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(config: ServerConfig) -> anyhow::Result<SocketAddr> {
    let backend = if config.workers == 0 {
        Backend::Direct
    } else {
        Backend::Pool(start_pool(&config).await?)
    };

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    let options = config.mux_options;
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    backend.serve(stream, peer, options);
                }
                Err(err) => warn!("Failed to accept connection: {}", err),
            }
        }
    });

    Ok(actual_addr)
}
