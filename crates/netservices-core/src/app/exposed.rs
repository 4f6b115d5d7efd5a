//! Declarative registry of what a service exposes.
//!
//! An `ExposedObject` maps member names to bound methods, nested objects or
//! plain data fields. Nested objects are reached by dot-joined paths
//! (`"hasA.hasA_echoString"`); `extend` merges another object's members in
//! place, which is how a type reuses the methods of a type it builds on.

use crate::error::RemoteError;
use futures::future::{self, BoxFuture};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Outcome of an exposed method.
pub type MethodResult = std::result::Result<Value, RemoteError>;

pub(crate) type Handler = Arc<dyn Fn(Args) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// Positional arguments of an inbound call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deserialize the argument at `index`. A missing argument reads as `null`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, RemoteError> {
        let value = self.0.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|err| {
            RemoteError::new("TypeError", format!("argument {}: {}", index, err))
        })
    }

    pub fn raw(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

#[derive(Clone)]
pub(crate) enum Member {
    Method(Handler),
    Object(ExposedObject),
    /// Data only; calling it is a type error.
    Field(Value),
}

/// A tree of callable members.
#[derive(Clone, Default)]
pub struct ExposedObject {
    members: BTreeMap<String, Member>,
}

impl fmt::Debug for ExposedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, member) in &self.members {
            match member {
                Member::Method(_) => map.entry(name, &"<method>"),
                Member::Object(object) => map.entry(name, object),
                Member::Field(value) => map.entry(name, value),
            };
        }
        map.finish()
    }
}

impl ExposedObject {
    pub fn builder() -> Self {
        Self::default()
    }

    /// Expose an async method.
    pub fn method<F, Fut, R>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, RemoteError>> + Send + 'static,
        R: Serialize + 'static,
    {
        let handler: Handler = Arc::new(move |args: Args| -> BoxFuture<'static, MethodResult> {
            let call = method(args);
            Box::pin(async move {
                let value = call.await?;
                serde_json::to_value(value).map_err(RemoteError::from)
            })
        });
        self.members.insert(name.into(), Member::Method(handler));
        self
    }

    /// Expose a synchronous method.
    pub fn method_sync<F, R>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Args) -> std::result::Result<R, RemoteError> + Send + Sync + 'static,
        R: Serialize + 'static,
    {
        let handler: Handler = Arc::new(move |args: Args| -> BoxFuture<'static, MethodResult> {
            let outcome = method(args)
                .and_then(|value| serde_json::to_value(value).map_err(RemoteError::from));
            Box::pin(future::ready(outcome))
        });
        self.members.insert(name.into(), Member::Method(handler));
        self
    }

    /// Nest `object` under `name`.
    pub fn object(mut self, name: impl Into<String>, object: impl Into<ExposedObject>) -> Self {
        self.members.insert(name.into(), Member::Object(object.into()));
        self
    }

    /// Attach plain data. Fields are never callable.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.members.insert(name.into(), Member::Field(value.into()));
        self
    }

    /// Merge in the members of `base`. Members already defined here win.
    pub fn extend(mut self, base: impl Into<ExposedObject>) -> Self {
        for (name, member) in base.into().members {
            self.members.entry(name).or_insert(member);
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    /// Every callable path, dot-joined, in sorted order.
    pub fn method_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_paths("", &mut paths);
        paths
    }

    fn collect_paths(&self, prefix: &str, paths: &mut Vec<String>) {
        for (name, member) in &self.members {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}.{}", prefix, name)
            };
            match member {
                Member::Method(_) => paths.push(path),
                Member::Object(object) => object.collect_paths(&path, paths),
                Member::Field(_) => {}
            }
        }
    }

    /// Walk `path` and return the first method it reaches.
    ///
    /// Objects are descended into; anything else ends the walk unresolved.
    pub(crate) fn resolve(&self, path: &[String]) -> Option<Handler> {
        let mut current = self;
        for segment in path {
            match current.members.get(segment) {
                Some(Member::Method(handler)) => return Some(handler.clone()),
                Some(Member::Object(object)) => current = object,
                Some(Member::Field(_)) | None => return None,
            }
        }
        None
    }
}

/// Types that can describe themselves as an exposed object.
///
/// ```
/// use netservices::{Args, Expose, ExposedObject, RemoteError};
/// use std::sync::Arc;
///
/// struct Greeter;
///
/// impl Expose for Greeter {
///     fn expose(self: Arc<Self>) -> ExposedObject {
///         ExposedObject::builder().method_sync("greet", |args: Args| {
///             let kind: String = args.get(0)?;
///             Ok::<_, RemoteError>(format!("Hello, {} world!", kind))
///         })
///     }
/// }
///
/// let object = ExposedObject::from(Arc::new(Greeter));
/// assert_eq!(object.method_paths(), vec!["greet"]);
/// ```
pub trait Expose: Send + Sync + 'static {
    fn expose(self: Arc<Self>) -> ExposedObject;
}

impl<T: Expose> From<Arc<T>> for ExposedObject {
    fn from(value: Arc<T>) -> Self {
        value.expose()
    }
}
