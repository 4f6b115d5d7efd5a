//! Centralized configuration for netservices.
//!
//! Constant tables for framing and worker management, plus the option structs
//! accepted by the constructors (`Service::new`, `create_service_api`,
//! `create_service_app`, `ServicePool::start`).

use crate::identifier::{IdentifierGenerator, NumericIdentifierGenerator};
use crate::pool::WorkerSpawner;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Framing and queue configuration.
pub struct MuxConfig;

impl MuxConfig {
    /// Length of the big-endian frame length prefix in byte mode.
    pub const FRAME_HEADER_LEN: usize = 6;
    /// Largest total frame length a 6-byte prefix can express.
    pub const MAX_FRAME_LEN: u64 = (1 << 48) - 1;
    /// Size of each read from a byte-mode transport.
    pub const READ_CHUNK_SIZE: usize = 64 * 1024;
    /// Default capacity of an in-process object channel.
    pub const OBJECT_CHANNEL_CAPACITY: usize = 1024;
    /// How long a gracefully closed link keeps flushing queued egress.
    pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Worker pool configuration.
pub struct PoolConfig;

impl PoolConfig {
    /// How long a worker may take to signal readiness.
    pub const WORKER_READY_TIMEOUT: Duration = Duration::from_secs(30);
    /// Line a stdio worker prints before its stdout switches to framed traffic.
    pub const WORKER_READY_MARKER: &'static str = "NETSERVICES_WORKER_READY";
    /// Environment variable carrying a process worker's index.
    pub const WORKER_INDEX_ENV: &'static str = "NETSERVICES_WORKER_INDEX";
}

/// Queue limits for a `Mux`.
///
/// Exceeding a limit destroys the link. The egress limit counts bytes in byte
/// mode and messages in object mode. The ingress limit applies to byte mode
/// only; an object transport is bounded by its channel capacity instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxOptions {
    /// Undecoded bytes the reader may buffer. Ignored by object transports.
    pub ingress_queue_size_limit: Option<usize>,
    /// Bytes (byte mode) or messages (object mode) waiting to be written.
    pub egress_queue_size_limit: Option<usize>,
}

impl MuxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ingress queue limit (byte transports only).
    pub fn with_ingress_limit(mut self, limit: usize) -> Self {
        self.ingress_queue_size_limit = Some(limit);
        self
    }

    /// Set the egress queue limit.
    pub fn with_egress_limit(mut self, limit: usize) -> Self {
        self.egress_queue_size_limit = Some(limit);
        self
    }

    /// Set both limits to the same value.
    pub fn with_limits(self, limit: usize) -> Self {
        self.with_ingress_limit(limit).with_egress_limit(limit)
    }
}

/// Options for the outbound call registry.
#[derive(Clone)]
pub struct ServiceApiOptions {
    /// Per-call deadline. `None` waits until a result or teardown.
    pub timeout: Option<Duration>,
    /// Source of correlation ids.
    pub identifier_generator: Arc<dyn IdentifierGenerator>,
}

impl Default for ServiceApiOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            identifier_generator: Arc::new(NumericIdentifierGenerator::new()),
        }
    }
}

impl fmt::Debug for ServiceApiOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceApiOptions")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ServiceApiOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use a custom identifier generator.
    pub fn with_identifier_generator(mut self, generator: impl IdentifierGenerator + 'static) -> Self {
        self.identifier_generator = Arc::new(generator);
        self
    }
}

/// Options for the inbound dispatch engine.
#[derive(Debug, Clone, Default)]
pub struct ServiceAppOptions {
    /// Dot-joined paths callable by the peer. `None` allows every path.
    pub paths: Option<HashSet<String>>,
}

impl ServiceAppOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict dispatch to the given dot-joined paths.
    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }
}

/// Options for a worker pool.
#[derive(Clone)]
pub struct ServicePoolOptions {
    /// Number of workers started up front.
    pub worker_count: usize,
    /// Entry point used to start each worker.
    pub worker: Arc<dyn WorkerSpawner>,
    /// Start a replacement whenever a worker exits.
    pub restart_worker_on_error: bool,
}

impl fmt::Debug for ServicePoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicePoolOptions")
            .field("worker_count", &self.worker_count)
            .field("worker", &self.worker.describe())
            .field("restart_worker_on_error", &self.restart_worker_on_error)
            .finish()
    }
}

impl ServicePoolOptions {
    pub fn new(worker_count: usize, worker: impl WorkerSpawner) -> Self {
        Self {
            worker_count,
            worker: Arc::new(worker),
            restart_worker_on_error: false,
        }
    }

    /// Restart workers when they exit.
    pub fn with_restart_on_error(mut self, enable: bool) -> Self {
        self.restart_worker_on_error = enable;
        self
    }
}
