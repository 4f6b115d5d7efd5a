//! Inbound dispatch engine.
//!
//! `ServiceApp` answers every `Call` arriving on its link. Calls start in
//! arrival order: the allow-list check, path resolution and the method itself
//! run inline up to the method's first suspension point, and only the rest is
//! left to its own task. A slow method therefore never holds up the calls
//! behind it, and results may be sent in any order.

mod exposed;

pub use exposed::{Args, Expose, ExposedObject, MethodResult};

use crate::config::ServiceAppOptions;
use crate::error::{RemoteError, ServiceError};
use crate::message::{CallMessage, ResultMessage};
use crate::mux::{LinkState, Mux, MuxListener};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::task::Context;
use tracing::{debug, error, warn};

struct AppInner {
    mux: Mux,
    object: RwLock<Option<Arc<ExposedObject>>>,
    paths: RwLock<Option<HashSet<String>>>,
}

impl AppInner {
    async fn try_call(self: Arc<Self>, call: CallMessage) {
        let CallMessage { id, path, args } = call;
        let joined = path.join(".");

        let reply = match self.evaluate(&path, &joined, args).await {
            Ok(value) => ResultMessage::success(id, value),
            Err(err) => {
                debug!("Call {} ({}) failed: {}", id, joined, err);
                ResultMessage::failure(id, &err)
            }
        };

        if let Err(err) = self.mux.mux(reply) {
            if err.is_queue_size_limit() {
                debug!("Dropped reply for {}: {}", joined, err);
            } else {
                warn!("Failed to reply to {}: {}", joined, err);
            }
        }
    }

    async fn evaluate(
        &self,
        path: &[String],
        joined: &str,
        args: Vec<Value>,
    ) -> std::result::Result<Value, RemoteError> {
        if let Some(paths) = &*self.paths.read().expect("paths lock poisoned") {
            if !paths.contains(joined) {
                return Err(ServiceError::PropertyPath {
                    path: joined.to_string(),
                }
                .into());
            }
        }

        let object = self
            .object
            .read()
            .expect("exposed object lock poisoned")
            .clone()
            .ok_or_else(ServiceError::stream_closed)?;

        let handler = object
            .resolve(path)
            .ok_or_else(|| ServiceError::type_error(format!("{} is not a function", joined)))?;

        match AssertUnwindSafe(async move { handler(Args::new(args)).await })
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!("Method {} panicked", joined);
                Err(RemoteError::from_panic(panic))
            }
        }
    }
}

/// Inbound half of a service.
#[derive(Clone)]
pub struct ServiceApp {
    inner: Arc<AppInner>,
}

impl std::fmt::Debug for ServiceApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceApp")
            .field("bound", &self.is_bound())
            .field("paths", &self.paths())
            .finish()
    }
}

impl ServiceApp {
    /// Serve `object` to the peer on `mux`.
    ///
    /// Prefer `Service::create_service_app`, which enforces one engine per
    /// link. The exposed object is released when the link ends.
    pub fn new(mux: Mux, object: impl Into<ExposedObject>, options: ServiceAppOptions) -> Self {
        let inner = Arc::new(AppInner {
            mux: mux.clone(),
            object: RwLock::new(Some(Arc::new(object.into()))),
            paths: RwLock::new(options.paths),
        });
        mux.listen(Arc::new(AppListener {
            inner: inner.clone(),
        }));
        Self { inner }
    }

    /// Replace the allow-list. `None` allows every path.
    pub fn set_paths(&self, paths: Option<HashSet<String>>) {
        *self.inner.paths.write().expect("paths lock poisoned") = paths;
    }

    pub fn paths(&self) -> Option<HashSet<String>> {
        self.inner.paths.read().expect("paths lock poisoned").clone()
    }

    /// Whether the exposed object is still held (the link has not ended).
    pub fn is_bound(&self) -> bool {
        self.inner
            .object
            .read()
            .expect("exposed object lock poisoned")
            .is_some()
    }

    pub fn mux(&self) -> &Mux {
        &self.inner.mux
    }
}

struct AppListener {
    inner: Arc<AppInner>,
}

impl MuxListener for AppListener {
    fn on_call(&self, _mux: &Mux, call: &CallMessage) {
        let mut invocation = Box::pin(self.inner.clone().try_call(call.clone()));
        // The first poll runs on the reader task, before the next message is
        // demultiplexed. The spawned task polls again with a real waker.
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        if invocation.poll_unpin(&mut cx).is_pending() {
            tokio::spawn(invocation);
        }
    }

    fn on_close(&self, _mux: &Mux, _state: &LinkState) {
        debug!("Releasing exposed object");
        self.inner
            .object
            .write()
            .expect("exposed object lock poisoned")
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MuxOptions, ServiceApiOptions};
    use crate::transport::ObjectStream;
    use crate::ServiceApi;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn object() -> ExposedObject {
        ExposedObject::builder()
            .method_sync("add", |args: Args| {
                Ok::<_, RemoteError>(args.get::<i64>(0)? + args.get::<i64>(1)?)
            })
            .method("sleepy", |args: Args| async move {
                let ms: u64 = args.get(0)?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, RemoteError>(ms)
            })
            .method_sync("fail", |_| {
                Err::<(), _>(RemoteError::new("RangeError", "out of range").with_field("code", 3))
            })
            .method_sync("explode", |_| -> std::result::Result<(), RemoteError> {
                panic!("kaboom")
            })
            .field("data", 1)
    }

    fn bind(options: ServiceAppOptions) -> (ServiceApp, ServiceApi) {
        let (a, b) = ObjectStream::default_pair();
        let app = ServiceApp::new(Mux::new(a, MuxOptions::default()), object(), options);
        let api = ServiceApi::new(Mux::new(b, MuxOptions::default()), ServiceApiOptions::default());
        (app, api)
    }

    #[tokio::test]
    async fn test_sync_and_async_methods() {
        let (_app, api) = bind(ServiceAppOptions::default());
        assert_eq!(api.call("add", (2, 3)).await.unwrap(), json!(5));
        assert_eq!(api.call("sleepy", (5,)).await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_slow_call_does_not_block_later_calls() {
        let (_app, api) = bind(ServiceAppOptions::default());
        let slow = tokio::spawn({
            let api = api.clone();
            async move { api.call("sleepy", (200,)).await }
        });
        let fast = api.call("sleepy", (1,)).await.unwrap();
        assert_eq!(fast, json!(1));
        assert!(!slow.is_finished());
        assert_eq!(slow.await.unwrap().unwrap(), json!(200));
    }

    #[tokio::test]
    async fn test_failures_carry_name_message_and_fields() {
        let (_app, api) = bind(ServiceAppOptions::default());
        let err = api.call("fail", ()).await.unwrap_err();
        let remote = err.as_remote().unwrap();
        assert_eq!(remote.name, "RangeError");
        assert_eq!(remote.message, "out of range");
        assert_eq!(remote.field("code"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_unresolved_paths_are_type_errors() {
        let (_app, api) = bind(ServiceAppOptions::default());
        for path in ["undefinedMethod", "data", "missing.add"] {
            let err = api.call(path, ()).await.unwrap_err();
            assert_eq!(err.name(), "TypeError", "path {}", path);
            assert!(err.to_string().contains(path));
        }
    }

    #[tokio::test]
    async fn test_walk_stops_at_first_method() {
        let (_app, api) = bind(ServiceAppOptions::default());
        assert_eq!(api.call("add.extra", (1, 2)).await.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let (app, api) = bind(ServiceAppOptions::default());
        let err = api.call("explode", ()).await.unwrap_err();
        assert_eq!(err.name(), "Error");
        assert!(err.to_string().contains("kaboom"));
        assert!(app.mux().is_open());
    }

    #[tokio::test]
    async fn test_allow_list_can_be_lifted() {
        let (app, api) = bind(ServiceAppOptions::new().with_paths(["add"]));

        let err = api.call("sleepy", (1,)).await.unwrap_err();
        assert_eq!(err.name(), "PropertyPathError");
        assert!(err.to_string().contains("sleepy"));
        assert_eq!(api.call("add", (1, 1)).await.unwrap(), json!(2));

        app.set_paths(None);
        assert_eq!(api.call("sleepy", (1,)).await.unwrap(), json!(1));
    }

    fn recorder(log: Arc<Mutex<Vec<u64>>>) -> ExposedObject {
        let sync_log = log.clone();
        ExposedObject::builder()
            .method_sync("record", move |args: Args| {
                let i: u64 = args.get(0)?;
                sync_log.lock().unwrap().push(i);
                Ok::<_, RemoteError>(i)
            })
            .method("recordLater", move |args: Args| {
                let log = log.clone();
                async move {
                    let i: u64 = args.get(0)?;
                    log.lock().unwrap().push(i);
                    tokio::task::yield_now().await;
                    Ok::<_, RemoteError>(i)
                }
            })
    }

    struct CountResults(mpsc::UnboundedSender<ResultMessage>);

    impl MuxListener for CountResults {
        fn on_result(&self, _mux: &Mux, result: &ResultMessage) {
            let _ = self.0.send(result.clone());
        }
    }

    async fn assert_invoked_in_arrival_order(method: &str) {
        const CALLS: u64 = 2000;
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = ObjectStream::pair(4096);
        let _app = ServiceApp::new(
            Mux::new(a, MuxOptions::default()),
            recorder(log.clone()),
            ServiceAppOptions::default(),
        );

        let peer = Mux::new(b, MuxOptions::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        peer.listen(Arc::new(CountResults(tx)));
        for i in 0..CALLS {
            peer.mux(CallMessage::new(
                i.to_string(),
                vec![method.to_string()],
                vec![json!(i)],
            ))
            .unwrap();
        }
        for _ in 0..CALLS {
            assert!(rx.recv().await.unwrap().is_success());
        }

        let log = log.lock().unwrap().clone();
        assert_eq!(log, (0..CALLS).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sync_methods_run_in_arrival_order() {
        assert_invoked_in_arrival_order("record").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_methods_start_in_arrival_order() {
        assert_invoked_in_arrival_order("recordLater").await;
    }

    #[tokio::test]
    async fn test_object_released_on_close() {
        let (app, api) = bind(ServiceAppOptions::default());
        assert!(app.is_bound());
        api.mux().close();
        app.mux().closed().await;
        assert!(!app.is_bound());
    }
}
