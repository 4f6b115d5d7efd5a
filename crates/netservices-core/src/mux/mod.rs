//! Multiplexer: the framing and backpressure layer between a transport and
//! typed `Call`/`Result` messages.
//!
//! A `Mux` owns one transport. Two background tasks drive it: a reader that
//! demultiplexes arriving traffic and notifies listeners, and a writer that
//! drains the egress queue whenever it is signalled. Byte transports carry
//! length-prefixed frames (see [`frame`]); object transports carry whole
//! messages.
//!
//! # Teardown
//!
//! A link ends exactly once, either `Closed` (EOF, local `close()`) or
//! `Failed` (queue limit, codec error, write error). Every listener receives
//! `on_close` exactly once and the listener list is dropped afterwards.

mod byte_stream;
pub mod frame;
mod object_stream;

use crate::config::MuxOptions;
use crate::error::{QueueKind, Result, ServiceError};
use crate::message::{CallMessage, Message, ResultMessage};
use crate::transport::Transport;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

/// Lifecycle of the underlying link.
#[derive(Debug, Clone)]
pub enum LinkState {
    Open,
    /// Ended without error.
    Closed,
    /// Destroyed with an error.
    Failed(ServiceError),
}

impl LinkState {
    pub fn is_open(&self) -> bool {
        matches!(self, LinkState::Open)
    }

    /// The teardown error, if the link failed.
    pub fn error(&self) -> Option<&ServiceError> {
        match self {
            LinkState::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// The error handed to anything still waiting on this link.
    pub fn to_error(&self) -> ServiceError {
        match self {
            LinkState::Failed(err) => err.clone(),
            _ => ServiceError::stream_closed(),
        }
    }
}

/// Egress flush progress.
///
/// `Idle -> Flushing -> (WaitingDrain -> Flushing)* -> Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Idle,
    Flushing,
    WaitingDrain,
}

/// Receives demultiplexed traffic for one link.
///
/// Callbacks run on the mux's reader task and must not block. Anything that
/// needs to await spawns its own task.
pub trait MuxListener: Send + Sync {
    fn on_call(&self, _mux: &Mux, _call: &CallMessage) {}

    fn on_result(&self, _mux: &Mux, _result: &ResultMessage) {}

    fn on_close(&self, _mux: &Mux, _state: &LinkState) {}
}

enum Egress {
    Bytes(BytesMut),
    Objects(VecDeque<Message>),
}

impl Egress {
    fn push(&mut self, message: Message) -> Result<()> {
        match self {
            Egress::Bytes(buffer) => {
                let frame = frame::encode_frame(&message)?;
                buffer.extend_from_slice(&frame);
            }
            Egress::Objects(queue) => queue.push_back(message),
        }
        Ok(())
    }

    /// Queue size in the unit the limit is expressed in.
    fn len(&self) -> usize {
        match self {
            Egress::Bytes(buffer) => buffer.len(),
            Egress::Objects(queue) => queue.len(),
        }
    }
}

struct MuxInner {
    options: MuxOptions,
    object_mode: bool,
    egress: Mutex<Egress>,
    flush: Notify,
    flush_state: Mutex<FlushState>,
    state: watch::Sender<LinkState>,
    listeners: Mutex<Vec<Arc<dyn MuxListener>>>,
}

/// Handle to a multiplexed link. Cloning shares the link.
#[derive(Clone)]
pub struct Mux {
    inner: Arc<MuxInner>,
}

impl fmt::Debug for Mux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mux")
            .field("object_mode", &self.inner.object_mode)
            .field("state", &*self.inner.state.borrow())
            .field("flush_state", &self.flush_state())
            .finish()
    }
}

impl Mux {
    /// Take ownership of `transport` and start its reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(transport: impl Into<Transport>, options: MuxOptions) -> Self {
        let transport = transport.into();
        let object_mode = transport.is_object_mode();
        let egress = if object_mode {
            Egress::Objects(VecDeque::new())
        } else {
            Egress::Bytes(BytesMut::new())
        };
        let (state, _) = watch::channel(LinkState::Open);

        let mux = Mux {
            inner: Arc::new(MuxInner {
                options,
                object_mode,
                egress: Mutex::new(egress),
                flush: Notify::new(),
                flush_state: Mutex::new(FlushState::Idle),
                state,
                listeners: Mutex::new(Vec::new()),
            }),
        };

        match transport {
            Transport::Bytes { reader, writer } => {
                tokio::spawn(byte_stream::read_loop(mux.clone(), reader));
                tokio::spawn(byte_stream::write_loop(mux.clone(), writer));
            }
            Transport::Objects(stream) => {
                let (sender, receiver) = stream.into_parts();
                tokio::spawn(object_stream::read_loop(mux.clone(), receiver));
                tokio::spawn(object_stream::write_loop(mux.clone(), sender));
            }
        }

        mux
    }

    /// Enqueue a message for egress.
    ///
    /// If the egress queue exceeds its limit after the enqueue, the link is
    /// destroyed and the `QueueSizeLimit` error is returned. A link that has
    /// already ended rejects the message with its teardown reason.
    pub fn mux(&self, message: impl Into<Message>) -> Result<()> {
        let state = self.state();
        if !state.is_open() {
            return Err(state.to_error());
        }

        let queued = {
            let mut egress = self.inner.egress.lock().expect("egress lock poisoned");
            match egress.push(message.into()) {
                Ok(()) => egress.len(),
                Err(err) => {
                    drop(egress);
                    self.destroy(err.clone());
                    return Err(err);
                }
            }
        };

        if let Some(limit) = self.inner.options.egress_queue_size_limit {
            if queued > limit {
                let err = ServiceError::QueueSizeLimit {
                    queue: QueueKind::Egress,
                    limit,
                };
                self.destroy(err.clone());
                return Err(err);
            }
        }

        self.inner.flush.notify_one();
        Ok(())
    }

    /// Register a listener. A listener added to an ended link is told so
    /// immediately.
    pub fn listen(&self, listener: Arc<dyn MuxListener>) {
        {
            let mut listeners = self.inner.listeners.lock().expect("listener lock poisoned");
            if self.inner.state.borrow().is_open() {
                listeners.push(listener);
                return;
            }
        }
        let state = self.state();
        listener.on_close(self, &state);
    }

    /// Detach every listener without ending the link.
    pub fn clear_listeners(&self) {
        self.inner
            .listeners
            .lock()
            .expect("listener lock poisoned")
            .clear();
    }

    /// End the link gracefully. Already queued egress is still flushed.
    pub fn close(&self) {
        self.finish(LinkState::Closed);
    }

    /// Tear the link down with `err`. Queued egress is discarded.
    pub fn destroy(&self, err: ServiceError) {
        self.finish(LinkState::Failed(err));
    }

    pub fn state(&self) -> LinkState {
        self.inner.state.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.borrow().is_open()
    }

    pub fn flush_state(&self) -> FlushState {
        *self.inner.flush_state.lock().expect("flush state lock poisoned")
    }

    /// Current egress queue size: bytes in byte mode, messages in object mode.
    pub fn queued(&self) -> usize {
        self.inner.egress.lock().expect("egress lock poisoned").len()
    }

    pub fn is_object_mode(&self) -> bool {
        self.inner.object_mode
    }

    pub fn options(&self) -> MuxOptions {
        self.inner.options
    }

    /// Wait until the link ends and return how it ended.
    #[allow(clippy::let_and_return)]
    pub async fn closed(&self) -> LinkState {
        let mut receiver = self.inner.state.subscribe();
        // The `watch::Ref` must drop before `receiver` does.
        let state = match receiver.wait_for(|state| !state.is_open()).await {
            Ok(state) => state.clone(),
            Err(_) => LinkState::Closed,
        };
        state
    }

    /// Whether both handles refer to the same link.
    pub fn same_link(&self, other: &Mux) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn finish(&self, next: LinkState) -> bool {
        let mut next = Some(next);
        let changed = self.inner.state.send_if_modified(|state| {
            if !state.is_open() {
                return false;
            }
            if let Some(next) = next.take() {
                *state = next;
            }
            true
        });
        if !changed {
            return false;
        }

        let state = self.state();
        match &state {
            LinkState::Failed(err) => warn!("Link destroyed: {}", err),
            _ => debug!("Link closed"),
        }

        let listeners =
            std::mem::take(&mut *self.inner.listeners.lock().expect("listener lock poisoned"));
        for listener in listeners {
            listener.on_close(self, &state);
        }
        true
    }

    fn listeners(&self) -> Vec<Arc<dyn MuxListener>> {
        self.inner
            .listeners
            .lock()
            .expect("listener lock poisoned")
            .clone()
    }

    /// Hand a demultiplexed message to every listener.
    fn demux(&self, message: Message) {
        let listeners = self.listeners();
        match message {
            Message::Call(call) => {
                for listener in &listeners {
                    listener.on_call(self, &call);
                }
            }
            Message::Result(result) => {
                for listener in &listeners {
                    listener.on_result(self, &result);
                }
            }
        }
    }

    fn set_flush_state(&self, next: FlushState) {
        *self.inner.flush_state.lock().expect("flush state lock poisoned") = next;
    }

    /// Take everything queued for a byte transport.
    fn take_bytes(&self) -> BytesMut {
        match &mut *self.inner.egress.lock().expect("egress lock poisoned") {
            Egress::Bytes(buffer) => buffer.split(),
            Egress::Objects(_) => BytesMut::new(),
        }
    }

    /// Take the oldest queued message for an object transport.
    fn pop_object(&self) -> Option<Message> {
        match &mut *self.inner.egress.lock().expect("egress lock poisoned") {
            Egress::Objects(queue) => queue.pop_front(),
            Egress::Bytes(_) => None,
        }
    }

    fn discard_egress(&self) {
        match &mut *self.inner.egress.lock().expect("egress lock poisoned") {
            Egress::Bytes(buffer) => buffer.clear(),
            Egress::Objects(queue) => queue.clear(),
        }
    }

    async fn flush_requested(&self) {
        self.inner.flush.notified().await
    }

    /// Resolves once the link has ended.
    async fn ended(&self) {
        let mut receiver = self.inner.state.subscribe();
        let _ = receiver.wait_for(|state| !state.is_open()).await;
    }
}
