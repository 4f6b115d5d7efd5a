//! Netservices - bidirectional RPC over duplex streams.
//!
//! Each end of a link can expose an object to its peer and call the peer's
//! exposed object at the same time. Calls name a (possibly nested) method by
//! path, travel as `Call` messages, and are answered by exactly one `Result`
//! matched by correlation id. A `ServicePool` fans one endpoint out across
//! several isolated workers.
//!
//! # Example
//!
//! ```rust,no_run
//! use netservices::{
//!     Args, ExposedObject, MuxOptions, RemoteError, Service, ServiceApiOptions,
//!     ServiceAppOptions,
//! };
//!
//! #[tokio::main]
//! async fn main() -> netservices::Result<()> {
//!     let (left, right) = tokio::io::duplex(64 * 1024);
//!
//!     let server = Service::new(left, MuxOptions::default());
//!     let greeter = ExposedObject::builder().method_sync("greet", |args: Args| {
//!         let kind: String = args.get(0)?;
//!         Ok::<_, RemoteError>(format!("Hello, {} world!", kind))
//!     });
//!     server.create_service_app(greeter, ServiceAppOptions::default())?;
//!
//!     let client = Service::new(right, MuxOptions::default());
//!     let api = client.create_service_api(ServiceApiOptions::default())?;
//!     let greeting = api.call("greet", ("happy",)).await?;
//!     println!("{}", greeting);
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod identifier;
pub mod message;
pub mod mux;
pub mod pool;
pub mod service;
pub mod transport;

// Re-export commonly used types
pub use api::{IntoPath, Proxy, ServiceApi};
pub use app::{Args, Expose, ExposedObject, MethodResult, ServiceApp};
pub use config::{
    MuxConfig, MuxOptions, PoolConfig, ServiceApiOptions, ServiceAppOptions, ServicePoolOptions,
};
pub use error::{QueueKind, RemoteError, Result, ServiceError};
pub use identifier::{IdentifierGenerator, NumericIdentifierGenerator, UuidIdentifierGenerator};
pub use message::{CallMessage, Message, ResultKind, ResultMessage};
pub use mux::{FlushState, LinkState, Mux, MuxListener};
pub use pool::{
    create_service_pool, serve_stdio, ProcessWorker, ServicePool, ThreadWorker, WorkerEntry,
    WorkerSpawner,
};
pub use service::{create_service, Service};
pub use transport::{ObjectStream, Transport};
