//! Worker endpoints for a `ServicePool`.
//!
//! A worker is an isolated execution context running its own `Service`. The
//! pool only ever talks to it through a `Transport`:
//!
//! - [`ThreadWorker`]: a dedicated OS thread with its own single-threaded
//!   runtime, connected by an in-process object channel.
//! - [`ProcessWorker`]: a child process speaking framed bytes over its stdin
//!   and stdout. The child announces readiness by printing
//!   [`PoolConfig::WORKER_READY_MARKER`] on its own line; [`serve_stdio`]
//!   implements that side.

use crate::config::{MuxConfig, MuxOptions, PoolConfig};
use crate::error::{Result, ServiceError};
use crate::mux::LinkState;
use crate::service::Service;
use crate::transport::{ObjectStream, Transport};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Starts workers for a pool.
#[async_trait]
pub trait WorkerSpawner: Send + Sync + 'static {
    /// Start worker `index`, resolving once it is ready to take calls.
    async fn spawn(&self, index: usize) -> Result<Transport>;

    /// Short human-readable description, used in logs.
    fn describe(&self) -> String;
}

/// Configures the `Service` a worker runs, typically by exposing an object.
pub type WorkerEntry = Arc<dyn Fn(&Service) -> Result<()> + Send + Sync>;

/// Runs each worker on its own OS thread.
#[derive(Clone)]
pub struct ThreadWorker {
    entry: WorkerEntry,
    name: String,
    channel_capacity: usize,
}

impl fmt::Debug for ThreadWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadWorker")
            .field("name", &self.name)
            .field("channel_capacity", &self.channel_capacity)
            .finish_non_exhaustive()
    }
}

impl ThreadWorker {
    pub fn new<F>(entry: F) -> Self
    where
        F: Fn(&Service) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            entry: Arc::new(entry),
            name: "netservices-worker".to_string(),
            channel_capacity: MuxConfig::OBJECT_CHANNEL_CAPACITY,
        }
    }

    /// Prefix of the worker thread names.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

#[async_trait]
impl WorkerSpawner for ThreadWorker {
    async fn spawn(&self, index: usize) -> Result<Transport> {
        let (pool_end, worker_end) = ObjectStream::pair(self.channel_capacity);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let entry = self.entry.clone();

        std::thread::Builder::new()
            .name(format!("{}-{}", self.name, index))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.into()));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let service = Service::new(worker_end, MuxOptions::default());
                    if let Err(err) = entry(&service) {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));

                    let state = service.closed().await;
                    debug!("Worker thread {} finished: {:?}", index, state);
                });
            })?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Transport::objects(pool_end)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ServiceError::instantiation(format!(
                "Worker {} exited before it was ready.",
                index
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("thread:{}", self.name)
    }
}

/// Runs each worker as a child process.
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    program: PathBuf,
    args: Vec<String>,
    env_vars: Vec<(String, String)>,
    ready_timeout: Duration,
}

impl ProcessWorker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_vars: Vec::new(),
            ready_timeout: PoolConfig::WORKER_READY_TIMEOUT,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// How long the child may take to print the readiness marker.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

#[async_trait]
impl WorkerSpawner for ProcessWorker {
    async fn spawn(&self, index: usize) -> Result<Transport> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.env_vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(PoolConfig::WORKER_INDEX_ENV, index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ServiceError::instantiation(format!(
                    "Failed to spawn worker {} ({}): {}",
                    index,
                    self.program.display(),
                    e
                ))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ServiceError::instantiation("Worker stdio is not piped."));
        };
        let mut stdout = BufReader::new(stdout);

        let ready = tokio::time::timeout(self.ready_timeout, wait_for_marker(&mut stdout)).await;
        let failure = match ready {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(_) => Some(ServiceError::instantiation(format!(
                "Worker {} did not become ready within {:?}.",
                index, self.ready_timeout
            ))),
        };
        if let Some(err) = failure {
            let _ = child.start_kill();
            return Err(err);
        }

        let pid = child.id();
        info!("Worker process {} ready (pid {:?})", index, pid);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("Worker process {} exited: {}", index, status),
                Err(e) => warn!("Failed to wait for worker process {}: {}", index, e),
            }
        });

        Ok(Transport::from_split(stdout, stdin))
    }

    fn describe(&self) -> String {
        format!("process:{}", self.program.display())
    }
}

async fn wait_for_marker(stdout: &mut BufReader<ChildStdout>) -> Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if stdout.read_line(&mut line).await? == 0 {
            return Err(ServiceError::instantiation(
                "Worker exited before it was ready.",
            ));
        }
        if line.trim_end() == PoolConfig::WORKER_READY_MARKER {
            return Ok(());
        }
        debug!("Worker output before ready: {}", line.trim_end());
    }
}

/// Run a worker over this process's stdin and stdout.
///
/// `setup` configures the service (usually `create_service_app`); the
/// readiness marker is printed afterwards, and the returned future resolves
/// when the pool closes the link. Nothing else may write to stdout.
pub async fn serve_stdio<F>(setup: F) -> Result<LinkState>
where
    F: FnOnce(&Service) -> Result<()>,
{
    let service = Service::new(
        Transport::from_split(tokio::io::stdin(), tokio::io::stdout()),
        MuxOptions::default(),
    );
    setup(&service)?;

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("{}\n", PoolConfig::WORKER_READY_MARKER).as_bytes())
        .await?;
    stdout.flush().await?;

    Ok(service.closed().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{Args, ExposedObject};
    use crate::config::{ServiceApiOptions, ServiceAppOptions};
    use crate::error::RemoteError;
    use crate::mux::Mux;
    use crate::ServiceApi;
    use serde_json::json;

    #[tokio::test]
    async fn test_thread_worker_serves_calls() {
        let worker = ThreadWorker::new(|service: &Service| {
            let object = ExposedObject::builder().method_sync("whereAmI", |_: Args| {
                Ok::<_, RemoteError>(std::thread::current().name().map(str::to_string))
            });
            service.create_service_app(object, ServiceAppOptions::default())?;
            Ok(())
        })
        .with_name("unit");

        let transport = worker.spawn(3).await.unwrap();
        let api = ServiceApi::new(Mux::new(transport, MuxOptions::default()), ServiceApiOptions::default());
        assert_eq!(api.call("whereAmI", ()).await.unwrap(), json!("unit-3"));
    }

    #[tokio::test]
    async fn test_thread_worker_setup_failure_is_reported() {
        let worker = ThreadWorker::new(|_: &Service| Err(ServiceError::instantiation("no setup")));
        let err = worker.spawn(0).await.unwrap_err();
        assert_eq!(err.to_string(), "no setup");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_worker_that_never_signals_fails() {
        let worker = ProcessWorker::new("sh").with_args(["-c", "echo hello; exit 0"]);
        let err = worker.spawn(0).await.unwrap_err();
        assert_eq!(err.name(), "InstantiationError");
    }

    #[test]
    fn test_describe() {
        assert_eq!(ProcessWorker::new("/bin/worker").describe(), "process:/bin/worker");
        assert!(ThreadWorker::new(|_: &Service| Ok(())).describe().starts_with("thread:"));
    }
}
