use super::ServiceApi;
use crate::error::{Result, ServiceError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// A property chain on the remote object, built with [`get`](Proxy::get) and
/// called with [`invoke`](Proxy::invoke).
///
/// Chains are immutable values: `get` returns a new chain, so invoking one
/// chain never affects another.
///
/// ```no_run
/// # async fn demo(api: netservices::ServiceApi) -> netservices::Result<()> {
/// let greeting = api.proxy().get("greeter").get("greet").invoke(("happy",)).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Proxy {
    api: ServiceApi,
    path: Vec<String>,
}

impl Proxy {
    pub(super) fn new(api: ServiceApi) -> Self {
        Self {
            api,
            path: Vec::new(),
        }
    }

    /// Extend the chain by one property.
    pub fn get(&self, name: &str) -> Proxy {
        let mut path = self.path.clone();
        path.push(name.to_string());
        Proxy {
            api: self.api.clone(),
            path,
        }
    }

    /// The dot-joined path of this chain.
    pub fn path(&self) -> String {
        self.path.join(".")
    }

    pub async fn invoke(&self, args: impl Serialize) -> Result<Value> {
        self.api.call(self.path.clone(), args).await
    }

    pub async fn invoke_as<T: DeserializeOwned>(&self, args: impl Serialize) -> Result<T> {
        self.api.call_as(self.path.clone(), args).await
    }

    /// Remote properties cannot be assigned.
    pub fn set(&self, name: &str, _value: impl Serialize) -> Result<()> {
        let mut path = self.path.clone();
        path.push(name.to_string());
        Err(ServiceError::not_implemented(format!(
            "The `set` property is not implemented for the property named `{}`.",
            path.join(".")
        )))
    }
}
