//! The object served by `netservices-rpc`.

use netservices::{Args, Expose, ExposedObject, PoolConfig, RemoteError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Greets callers and reports where it runs, so clients can tell workers apart.
#[derive(Debug, Clone)]
pub struct Greeter {
    greeting: String,
}

impl Default for Greeter {
    fn default() -> Self {
        Self {
            greeting: "Hello".to_string(),
        }
    }
}

impl Greeter {
    fn greet(&self, kind: &str) -> String {
        format!("{}, {} world!", self.greeting, kind)
    }
}

/// Where the current call is running.
fn location() -> Value {
    json!({
        "pid": std::process::id(),
        "thread": std::thread::current().name(),
        "worker": std::env::var(PoolConfig::WORKER_INDEX_ENV).ok(),
    })
}

impl Expose for Greeter {
    fn expose(self: Arc<Self>) -> ExposedObject {
        let greeter = self.clone();
        let nested = ExposedObject::builder().method_sync("greet", move |args: Args| {
            let kind: String = args.get(0)?;
            Ok::<_, RemoteError>(greeter.greet(&kind))
        });

        let math = ExposedObject::builder().method_sync("add", |args: Args| {
            Ok::<_, RemoteError>(args.get::<f64>(0)? + args.get::<f64>(1)?)
        });

        ExposedObject::builder()
            .object("greeter", nested)
            .object("math", math)
            .method_sync("echo", |args: Args| args.get::<Value>(0))
            .method("sleep", |args: Args| async move {
                let millis: u64 = args.get(0)?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok::<_, RemoteError>(millis)
            })
            .method_sync("location", |_: Args| Ok::<_, RemoteError>(location()))
            .method_sync("fail", |args: Args| -> Result<(), RemoteError> {
                let message: String = args.get(0)?;
                Err(RemoteError::message(message))
            })
            .field("greeting", self.greeting.clone())
    }
}

pub fn demo_object() -> ExposedObject {
    Arc::new(Greeter::default()).into()
}
