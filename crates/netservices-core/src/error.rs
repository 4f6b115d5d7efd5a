//! Error types for netservices.
//!
//! `ServiceError` covers every failure the runtime reports locally. Errors that
//! travel across a link are carried as a `RemoteError`, the flat
//! `{name, message, ...}` mapping that Failure results use as their payload.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The two queues owned by a `Mux`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Ingress,
    Egress,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Ingress => write!(f, "ingress"),
            QueueKind::Egress => write!(f, "egress"),
        }
    }
}

/// Main error type for netservices.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    // Outbound call errors
    #[error("The call timed out after {}ms.", .0.as_millis())]
    CallTimeout(Duration),

    #[error("{message}")]
    StreamClosed { message: String },

    #[error("{0}")]
    Remote(RemoteError),

    // Dispatch errors
    #[error("The property path, {path}, is not an allowed property path.")]
    PropertyPath { path: String },

    #[error("{message}")]
    TypeError { message: String },

    // Usage errors
    #[error("{message}")]
    NotImplemented { message: String },

    #[error("{message}")]
    Instantiation { message: String },

    // Link errors
    #[error("The {queue} queue exceeded its limit of {limit}.")]
    QueueSizeLimit { queue: QueueKind, limit: usize },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<Arc<serde_json::Error>>,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

/// Result type alias for netservices operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Transport {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Json {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl From<RemoteError> for ServiceError {
    fn from(err: RemoteError) -> Self {
        ServiceError::Remote(err)
    }
}

impl ServiceError {
    /// The transport closed while the operation was outstanding.
    pub fn stream_closed() -> Self {
        ServiceError::StreamClosed {
            message: "The transport closed.".to_string(),
        }
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        ServiceError::NotImplemented {
            message: message.into(),
        }
    }

    pub fn instantiation(message: impl Into<String>) -> Self {
        ServiceError::Instantiation {
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        ServiceError::TypeError {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        ServiceError::Protocol {
            message: message.into(),
        }
    }

    /// The error name as it appears in a Failure payload.
    pub fn name(&self) -> &str {
        match self {
            ServiceError::CallTimeout(_) => "CallTimeoutError",
            ServiceError::StreamClosed { .. } => "StreamClosedError",
            ServiceError::Remote(err) => &err.name,
            ServiceError::PropertyPath { .. } => "PropertyPathError",
            ServiceError::TypeError { .. } => "TypeError",
            ServiceError::NotImplemented { .. } => "NotImplementedError",
            ServiceError::Instantiation { .. } => "InstantiationError",
            ServiceError::QueueSizeLimit { .. } => "QueueSizeLimitError",
            ServiceError::Transport { .. } => "TransportError",
            ServiceError::Json { .. } => "SerializationError",
            ServiceError::Protocol { .. } => "ProtocolError",
        }
    }

    pub fn is_queue_size_limit(&self) -> bool {
        matches!(self, ServiceError::QueueSizeLimit { .. })
    }

    /// The reconstructed remote error, if this failure came from the peer.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            ServiceError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

/// An error description exchanged in Failure results.
///
/// Serializes to a flat JSON object: `name`, `message` and every extra field
/// side by side.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    pub fields: Map<String, Value>,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            fields: Map::new(),
        }
    }

    /// A plain `Error` with the given message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    /// Attach an extra field, carried next to `name` and `message`.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Rebuild an error from a Failure payload.
    ///
    /// Objects keep all of their entries; any other value becomes the message.
    pub fn from_payload(payload: Value) -> Self {
        match payload {
            Value::Object(mut map) => {
                let name = match map.remove("name") {
                    Some(Value::String(name)) => name,
                    Some(other) => other.to_string(),
                    None => "Error".to_string(),
                };
                let message = match map.remove("message") {
                    Some(Value::String(message)) => message,
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                };
                Self {
                    name,
                    message,
                    fields: map,
                }
            }
            Value::String(message) => Self::message(message),
            other => Self::message(other.to_string()),
        }
    }

    /// The flat mapping sent as a Failure payload.
    pub fn to_payload(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len() + 2);
        for (key, value) in &self.fields {
            map.insert(key.clone(), value.clone());
        }
        map.insert("name".to_string(), Value::String(self.name.clone()));
        map.insert("message".to_string(), Value::String(self.message.clone()));
        Value::Object(map)
    }

    /// Wrap a panic payload caught while invoking an exposed method.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "panic with a non-string payload".to_string()
        };
        Self::message(message)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for RemoteError {}

impl Serialize for RemoteError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_payload().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RemoteError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_payload)
    }
}

impl From<ServiceError> for RemoteError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Remote(err) => err,
            ServiceError::CallTimeout(timeout) => {
                RemoteError::new("CallTimeoutError", ServiceError::CallTimeout(timeout).to_string())
                    .with_field("timeoutMs", timeout.as_millis() as u64)
            }
            ServiceError::QueueSizeLimit { queue, limit } => RemoteError::new(
                "QueueSizeLimitError",
                ServiceError::QueueSizeLimit { queue, limit }.to_string(),
            )
            .with_field("limit", limit as u64),
            other => RemoteError::new(other.name(), other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::new("TypeError", err.to_string())
    }
}

impl From<anyhow::Error> for RemoteError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ServiceError>() {
            Ok(err) => err.into(),
            Err(err) => RemoteError::message(format!("{:#}", err)),
        }
    }
}
