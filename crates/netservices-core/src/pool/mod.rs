//! Worker pool dispatcher.
//!
//! A `ServicePool` accepts external connections and forwards every `Call` they
//! send to one of its workers, round-robin. Each forwarded call gets a fresh
//! UUID so calls from different connections never collide on a worker; the
//! original id is restored when the worker's result is routed back.
//!
//! ```text
//! client A --\                    /--> worker 0
//!             >-- ServicePool ---<
//! client B --/   (uuid -> conn)   \--> worker 1
//! ```

mod worker;

pub use worker::{serve_stdio, ProcessWorker, ThreadWorker, WorkerEntry, WorkerSpawner};

use crate::config::{MuxOptions, ServicePoolOptions};
use crate::error::{RemoteError, Result, ServiceError};
use crate::identifier::{IdentifierGenerator, UuidIdentifierGenerator};
use crate::message::{CallMessage, ResultMessage};
use crate::mux::{LinkState, Mux, MuxListener};
use crate::transport::Transport;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where a forwarded call came from.
struct MuxMap {
    mux: Mux,
    id: String,
    worker: usize,
}

#[derive(Clone)]
struct WorkerHandle {
    index: usize,
    mux: Mux,
}

struct PoolInner {
    options: ServicePoolOptions,
    workers: Mutex<VecDeque<WorkerHandle>>,
    pending: Mutex<HashMap<String, MuxMap>>,
    ids: UuidIdentifierGenerator,
    next_index: AtomicUsize,
    ready: watch::Sender<bool>,
    shutting_down: AtomicBool,
}

impl PoolInner {
    /// Round-robin: take from the front, put back at the end.
    fn next_worker(&self) -> Option<WorkerHandle> {
        let mut workers = self.workers.lock().expect("workers lock poisoned");
        let worker = workers.pop_front()?;
        workers.push_back(worker.clone());
        Some(worker)
    }

    fn forward(&self, origin: &Mux, call: &CallMessage) {
        let Some(worker) = self.next_worker() else {
            warn!(
                "No worker available; dropping call {} ({})",
                call.id,
                call.joined_path()
            );
            return;
        };

        let token = self.ids.next_id();
        self.pending.lock().expect("pending lock poisoned").insert(
            token.clone(),
            MuxMap {
                mux: origin.clone(),
                id: call.id.clone(),
                worker: worker.index,
            },
        );

        let mut forwarded = call.clone();
        forwarded.id = token.clone();
        if let Err(err) = worker.mux.mux(forwarded) {
            warn!("Failed to forward call to worker {}: {}", worker.index, err);
            if self.take_pending(&token).is_some() {
                let _ = origin.mux(ResultMessage::failure(call.id.clone(), &err.into()));
            }
        }
    }

    fn route_result(&self, worker: usize, result: &ResultMessage) {
        let Some(entry) = self.take_pending(&result.id) else {
            warn!(
                "Result from worker {} has an unregistered identifier: {}",
                worker, result.id
            );
            return;
        };

        let mut routed = result.clone();
        routed.id = entry.id;
        if let Err(err) = entry.mux.mux(routed) {
            debug!("Could not route result back to its connection: {}", err);
        }
    }

    fn take_pending(&self, token: &str) -> Option<MuxMap> {
        self.pending.lock().expect("pending lock poisoned").remove(token)
    }

    /// Drop every pending entry matching `predicate`.
    fn purge(&self, predicate: impl Fn(&MuxMap) -> bool) -> Vec<MuxMap> {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let tokens: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(token, _)| token.clone())
            .collect();
        tokens
            .into_iter()
            .filter_map(|token| pending.remove(&token))
            .collect()
    }

    fn worker_exited(self: &Arc<Self>, index: usize, state: &LinkState) {
        self.workers
            .lock()
            .expect("workers lock poisoned")
            .retain(|worker| worker.index != index);

        let orphaned = self.purge(|entry| entry.worker == index);
        if !orphaned.is_empty() {
            debug!("Failing {} calls left on worker {}", orphaned.len(), index);
        }
        let err: RemoteError = ServiceError::StreamClosed {
            message: format!("Worker {} exited.", index),
        }
        .into();
        for entry in orphaned {
            let _ = entry.mux.mux(ResultMessage::failure(entry.id, &err));
        }

        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        match state {
            LinkState::Failed(err) => warn!("Worker {} failed: {}", index, err),
            _ => info!("Worker {} exited", index),
        }

        if self.options.restart_worker_on_error {
            let inner = self.clone();
            let index = self.next_index.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if let Err(err) = start_worker(&inner, index).await {
                    error!("Failed to restart worker {}: {}", index, err);
                }
            });
        }
    }
}

async fn start_worker(inner: &Arc<PoolInner>, index: usize) -> Result<()> {
    let transport = inner.options.worker.spawn(index).await?;
    let mux = Mux::new(transport, MuxOptions::default());

    if inner.shutting_down.load(Ordering::SeqCst) {
        mux.close();
        return Ok(());
    }

    inner
        .workers
        .lock()
        .expect("workers lock poisoned")
        .push_back(WorkerHandle {
            index,
            mux: mux.clone(),
        });
    mux.listen(Arc::new(WorkerListener {
        pool: Arc::downgrade(inner),
        index,
    }));
    info!("Worker {} ready ({})", index, inner.options.worker.describe());
    Ok(())
}

/// Distributes calls from many connections across a set of workers.
#[derive(Clone)]
pub struct ServicePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ServicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePool")
            .field("options", &self.inner.options)
            .field("workers", &self.worker_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl ServicePool {
    /// Start `options.worker_count` workers in the background.
    ///
    /// Calls are accepted right away; until a worker is ready they are dropped.
    /// Await [`ready`](Self::ready) to know when the initial workers have
    /// either started or failed. Must be called from within a tokio runtime.
    pub fn start(options: ServicePoolOptions) -> Self {
        let worker_count = options.worker_count;
        let (ready, _) = watch::channel(false);
        let inner = Arc::new(PoolInner {
            options,
            workers: Mutex::new(VecDeque::with_capacity(worker_count)),
            pending: Mutex::new(HashMap::new()),
            ids: UuidIdentifierGenerator,
            next_index: AtomicUsize::new(worker_count),
            ready,
            shutting_down: AtomicBool::new(false),
        });

        let starting: Vec<_> = (0..worker_count)
            .map(|index| {
                let inner = inner.clone();
                tokio::spawn(async move { start_worker(&inner, index).await })
            })
            .collect();

        let pool = inner.clone();
        tokio::spawn(async move {
            for (index, handle) in starting.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error!("Worker {} failed to start: {}", index, err),
                    Err(err) => error!("Worker {} start task failed: {}", index, err),
                }
            }
            info!(
                "Service pool ready: {}/{} workers",
                pool.workers.lock().expect("workers lock poisoned").len(),
                worker_count
            );
            pool.ready.send_replace(true);
        });

        Self { inner }
    }

    /// Wait until every initially requested worker has started or failed.
    pub async fn ready(&self) {
        let mut receiver = self.inner.ready.subscribe();
        let _ = receiver.wait_for(|ready| *ready).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Serve an external connection through the pool.
    pub fn connect(&self, transport: impl Into<Transport>) -> Mux {
        self.connect_with(transport, MuxOptions::default())
    }

    pub fn connect_with(&self, transport: impl Into<Transport>, options: MuxOptions) -> Mux {
        let mux = Mux::new(transport, options);
        mux.listen(Arc::new(ConnectionListener {
            pool: Arc::downgrade(&self.inner),
        }));
        mux
    }

    /// Workers currently available for calls.
    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().expect("workers lock poisoned").len()
    }

    /// Calls forwarded to a worker and not yet answered.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("pending lock poisoned").len()
    }

    /// Close every worker and stop restarting them.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let workers: Vec<WorkerHandle> = self
            .inner
            .workers
            .lock()
            .expect("workers lock poisoned")
            .drain(..)
            .collect();
        info!("Shutting down {} workers", workers.len());
        for worker in workers {
            worker.mux.close();
        }
    }
}

/// Start a pool. See [`ServicePool::start`].
pub fn create_service_pool(options: ServicePoolOptions) -> ServicePool {
    ServicePool::start(options)
}

struct ConnectionListener {
    pool: Weak<PoolInner>,
}

impl MuxListener for ConnectionListener {
    fn on_call(&self, mux: &Mux, call: &CallMessage) {
        if let Some(pool) = self.pool.upgrade() {
            pool.forward(mux, call);
        }
    }

    fn on_result(&self, _mux: &Mux, result: &ResultMessage) {
        warn!("Ignoring result {} sent by an external connection", result.id);
    }

    fn on_close(&self, mux: &Mux, _state: &LinkState) {
        if let Some(pool) = self.pool.upgrade() {
            let purged = pool.purge(|entry| entry.mux.same_link(mux));
            if !purged.is_empty() {
                debug!("Connection closed with {} calls in flight", purged.len());
            }
        }
    }
}

struct WorkerListener {
    pool: Weak<PoolInner>,
    index: usize,
}

impl MuxListener for WorkerListener {
    fn on_call(&self, mux: &Mux, call: &CallMessage) {
        let err = ServiceError::not_implemented(
            "A call from a worker to an arbitrary remote Service is not implemented.",
        );
        warn!("Worker {} called {}: {}", self.index, call.joined_path(), err);
        let _ = mux.mux(ResultMessage::failure(call.id.clone(), &err.into()));
    }

    fn on_result(&self, _mux: &Mux, result: &ResultMessage) {
        if let Some(pool) = self.pool.upgrade() {
            pool.route_result(self.index, result);
        }
    }

    fn on_close(&self, _mux: &Mux, state: &LinkState) {
        if let Some(pool) = self.pool.upgrade() {
            pool.worker_exited(self.index, state);
        }
    }
}
