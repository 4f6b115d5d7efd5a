//! Outbound call registry.
//!
//! `ServiceApi` issues calls over a `Mux`, tracks each pending call by its
//! correlation id, and settles it exactly once: on the matching result, on
//! timeout, or when the link ends.

mod proxy;

pub use proxy::Proxy;

use crate::config::ServiceApiOptions;
use crate::error::{RemoteError, Result, ServiceError};
use crate::identifier::IdentifierGenerator;
use crate::message::{CallMessage, ResultMessage};
use crate::mux::{LinkState, Mux, MuxListener};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// A method path, either dot-joined (`"hasA.hasA_echoString"`) or as segments.
pub trait IntoPath {
    fn into_path(self) -> Vec<String>;
}

impl IntoPath for &str {
    fn into_path(self) -> Vec<String> {
        self.split('.').map(str::to_string).collect()
    }
}

impl IntoPath for String {
    fn into_path(self) -> Vec<String> {
        self.as_str().into_path()
    }
}

impl IntoPath for Vec<String> {
    fn into_path(self) -> Vec<String> {
        self
    }
}

impl IntoPath for &[&str] {
    fn into_path(self) -> Vec<String> {
        self.iter().map(|segment| segment.to_string()).collect()
    }
}

impl<const N: usize> IntoPath for [&str; N] {
    fn into_path(self) -> Vec<String> {
        self.iter().map(|segment| segment.to_string()).collect()
    }
}

/// Turn a serializable value into a positional argument list.
///
/// Tuples and sequences spread into arguments, `()` is no arguments and any
/// other value is a single argument. Wrap a sequence in a 1-tuple to pass it
/// as one argument.
pub fn into_args(args: impl Serialize) -> Result<Vec<Value>> {
    Ok(match serde_json::to_value(args)? {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    })
}

struct PendingCall {
    sender: oneshot::Sender<Result<Value>>,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    fn settle(self, outcome: Result<Value>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        let _ = self.sender.send(outcome);
    }
}

struct ApiInner {
    mux: Mux,
    pending: Mutex<HashMap<String, PendingCall>>,
    timeout: Option<Duration>,
    ids: Arc<dyn IdentifierGenerator>,
}

impl ApiInner {
    fn take(&self, id: &str) -> Option<PendingCall> {
        self.pending.lock().expect("pending lock poisoned").remove(id)
    }

    fn take_all(&self) -> Vec<PendingCall> {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .drain()
            .map(|(_, call)| call)
            .collect()
    }
}

/// Removes a call's entry if the caller stops waiting for it.
struct PendingGuard<'a> {
    inner: &'a ApiInner,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(call) = self.inner.take(self.id) {
            if let Some(timer) = call.timer {
                timer.abort();
            }
        }
    }
}

/// Outbound half of a service.
#[derive(Clone)]
pub struct ServiceApi {
    inner: Arc<ApiInner>,
}

impl std::fmt::Debug for ServiceApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceApi")
            .field("timeout", &self.inner.timeout)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl ServiceApi {
    /// Attach a registry to `mux`.
    ///
    /// Prefer `Service::create_service_api`, which enforces one registry per
    /// link.
    pub fn new(mux: Mux, options: ServiceApiOptions) -> Self {
        let inner = Arc::new(ApiInner {
            mux: mux.clone(),
            pending: Mutex::new(HashMap::new()),
            timeout: options.timeout,
            ids: options.identifier_generator,
        });
        mux.listen(Arc::new(ApiListener {
            inner: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    /// Call the remote method at `path` and wait for its result.
    ///
    /// Fails with the reconstructed remote error on a Failure result,
    /// `CallTimeout` if the configured deadline passes first, and the link's
    /// teardown reason if the link ends while waiting.
    pub async fn call(&self, path: impl IntoPath, args: impl Serialize) -> Result<Value> {
        let path = path.into_path();
        let args = into_args(args)?;
        let id = self.inner.ids.next_id();
        let (sender, receiver) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
            if pending.contains_key(&id) {
                return Err(ServiceError::protocol(format!(
                    "the call id {} is already pending",
                    id
                )));
            }
            let timer = self.inner.timeout.map(|timeout| self.arm_timeout(&id, timeout));
            pending.insert(id.clone(), PendingCall { sender, timer });
        }
        let _guard = PendingGuard {
            inner: &self.inner,
            id: &id,
        };

        debug!("Calling {} (id {})", path.join("."), id);
        self.inner.mux.mux(CallMessage::new(id.clone(), path, args))?;

        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ServiceError::stream_closed()),
        }
    }

    /// Like [`call`](Self::call), deserializing the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        path: impl IntoPath,
        args: impl Serialize,
    ) -> Result<T> {
        let value = self.call(path, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Root of a proxy chain.
    pub fn proxy(&self) -> Proxy {
        Proxy::new(self.clone())
    }

    pub fn mux(&self) -> &Mux {
        &self.inner.mux
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    /// Calls still waiting for a result.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("pending lock poisoned").len()
    }

    fn arm_timeout(&self, id: &str, timeout: Duration) -> AbortHandle {
        let inner = Arc::downgrade(&self.inner);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                if let Some(call) = inner.take(&id) {
                    debug!("Call {} timed out after {:?}", id, timeout);
                    let _ = call.sender.send(Err(ServiceError::CallTimeout(timeout)));
                }
            }
        })
        .abort_handle()
    }
}

struct ApiListener {
    inner: Weak<ApiInner>,
}

impl MuxListener for ApiListener {
    fn on_result(&self, _mux: &Mux, result: &ResultMessage) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let Some(call) = inner.take(&result.id) else {
            warn!("Result has an unregistered identifier: {}", result.id);
            return;
        };

        let outcome = if result.is_success() {
            Ok(result.payload.clone())
        } else {
            Err(ServiceError::Remote(RemoteError::from_payload(
                result.payload.clone(),
            )))
        };
        call.settle(outcome);
    }

    fn on_close(&self, _mux: &Mux, state: &LinkState) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let calls = inner.take_all();
        if !calls.is_empty() {
            debug!("Rejecting {} pending calls: link ended", calls.len());
        }
        for call in calls {
            call.settle(Err(state.to_error()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MuxOptions;
    use crate::message::Message;
    use crate::transport::ObjectStream;
    use serde_json::json;

    /// Answers every call on the far end with `answer(call)`.
    struct Responder<F>(F);

    impl<F> MuxListener for Responder<F>
    where
        F: Fn(&CallMessage) -> Option<ResultMessage> + Send + Sync,
    {
        fn on_call(&self, mux: &Mux, call: &CallMessage) {
            if let Some(result) = (self.0)(call) {
                let _ = mux.mux(result);
            }
        }
    }

    fn pair(options: ServiceApiOptions) -> (ServiceApi, Mux) {
        let (a, b) = ObjectStream::default_pair();
        let api = ServiceApi::new(Mux::new(a, MuxOptions::default()), options);
        (api, Mux::new(b, MuxOptions::default()))
    }

    #[test]
    fn test_path_forms() {
        assert_eq!("a.b".into_path(), vec!["a", "b"]);
        assert_eq!(["a", "b"].into_path(), vec!["a", "b"]);
        assert_eq!(vec!["x".to_string()].into_path(), vec!["x"]);
    }

    #[test]
    fn test_argument_spreading() {
        assert_eq!(into_args(()).unwrap(), Vec::<Value>::new());
        assert_eq!(into_args(("a", 1)).unwrap(), vec![json!("a"), json!(1)]);
        assert_eq!(into_args(7).unwrap(), vec![json!(7)]);
        assert_eq!(into_args((vec![1, 2],)).unwrap(), vec![json!([1, 2])]);
    }

    #[tokio::test]
    async fn test_success_and_failure_results() {
        let (api, peer) = pair(ServiceApiOptions::default());
        peer.listen(Arc::new(Responder(|call: &CallMessage| {
            Some(match call.joined_path().as_str() {
                "ok" => ResultMessage::success(call.id.clone(), call.args[0].clone()),
                _ => ResultMessage::failure(
                    call.id.clone(),
                    &RemoteError::new("RangeError", "bad").with_field("code", 7),
                ),
            })
        })));

        assert_eq!(api.call("ok", ("hi",)).await.unwrap(), json!("hi"));

        let err = api.call("nope", ()).await.unwrap_err();
        let remote = err.as_remote().unwrap();
        assert_eq!(remote.name, "RangeError");
        assert_eq!(remote.message, "bad");
        assert_eq!(remote.field("code"), Some(&json!(7)));
        assert_eq!(api.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_rejects_and_ignores_late_result() {
        let (api, peer) = pair(ServiceApiOptions::new().with_timeout(Duration::from_millis(50)));
        let (late_tx, mut late_rx) = tokio::sync::mpsc::unbounded_channel();
        peer.listen(Arc::new(Responder(move |call: &CallMessage| {
            let _ = late_tx.send(call.id.clone());
            None
        })));

        let err = api.call("slow", ()).await.unwrap_err();
        assert!(matches!(err, ServiceError::CallTimeout(d) if d == Duration::from_millis(50)));
        assert_eq!(api.pending_count(), 0);

        let id = late_rx.recv().await.unwrap();
        peer.mux(ResultMessage::success(id, json!(1))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(api.mux().is_open());
    }

    #[tokio::test]
    async fn test_close_rejects_every_pending_call_once() {
        let (api, peer) = pair(ServiceApiOptions::default());

        let calls: Vec<_> = (0..5)
            .map(|i| {
                let api = api.clone();
                tokio::spawn(async move { api.call("never", (i,)).await })
            })
            .collect();
        while api.pending_count() < 5 {
            tokio::task::yield_now().await;
        }

        peer.close();
        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert_eq!(err.name(), "StreamClosedError");
        }
        assert_eq!(api.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_aborts_timeout_timers() {
        let metrics = tokio::runtime::Handle::current().metrics();
        let baseline = metrics.num_alive_tasks();
        {
            let options = ServiceApiOptions::new().with_timeout(Duration::from_secs(1));
            let (api, _peer) = pair(options);
            let calls: Vec<_> = (0..5)
                .map(|i| {
                    let api = api.clone();
                    tokio::spawn(async move { api.call("never", (i,)).await })
                })
                .collect();
            while api.pending_count() < 5 {
                tokio::task::yield_now().await;
            }

            api.mux().close();
            for call in calls {
                let err = call.await.unwrap().unwrap_err();
                assert_eq!(err.name(), "StreamClosedError");
            }
            assert_eq!(api.pending_count(), 0);
        }

        // Past every deadline: only aborted timers may remain, and they go away.
        tokio::time::advance(Duration::from_secs(5)).await;
        for _ in 0..100 {
            if metrics.num_alive_tasks() == baseline {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(metrics.num_alive_tasks(), baseline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_aborts_timeout_timer() {
        let (api, peer) = pair(ServiceApiOptions::new().with_timeout(Duration::from_secs(1)));
        peer.listen(Arc::new(Responder(|call: &CallMessage| {
            Some(ResultMessage::success(call.id.clone(), json!("done")))
        })));
        let metrics = tokio::runtime::Handle::current().metrics();
        let with_links = metrics.num_alive_tasks();

        assert_eq!(api.call("quick", ()).await.unwrap(), json!("done"));
        for _ in 0..100 {
            if metrics.num_alive_tasks() == with_links {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(metrics.num_alive_tasks(), with_links);
    }

    #[tokio::test]
    async fn test_call_on_ended_link_fails_fast() {
        let (api, _peer) = pair(ServiceApiOptions::default());
        api.mux().destroy(ServiceError::protocol("gone"));
        let err = api.call("x", ()).await.unwrap_err();
        assert_eq!(err.name(), "ProtocolError");
    }

    #[tokio::test]
    async fn test_dropped_call_is_deregistered() {
        let (api, _peer) = pair(ServiceApiOptions::default());
        let call = api.call("never", ());
        let _ = tokio::time::timeout(Duration::from_millis(10), call).await;
        assert_eq!(api.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_custom_identifier_generator() {
        let (api, peer) = pair(
            ServiceApiOptions::new()
                .with_identifier_generator(crate::identifier::UuidIdentifierGenerator),
        );
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        peer.listen(Arc::new(Responder(move |call: &CallMessage| {
            let _ = seen_tx.send(Message::Call(call.clone()));
            Some(ResultMessage::success(call.id.clone(), Value::Null))
        })));

        api.call("x", ()).await.unwrap();
        let seen = seen_rx.recv().await.unwrap();
        assert_eq!(seen.id().len(), 36);
    }
}
