//! Integration tests for the netservices-rpc binary.
//!
//! Each test launches the compiled binary, reads the `RPC_PORT=` line it
//! prints and talks to it over TCP.

use netservices::{MuxOptions, Service, ServiceApi, ServiceApiOptions};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_netservices-rpc"))
}

struct RpcServerHandle {
    child: tokio::process::Child,
    port: u16,
}

impl RpcServerHandle {
    fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    async fn stop(mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Start `netservices-rpc serve` with `extra` arguments and wait for its port.
async fn start_rpc_server(extra: &[&str]) -> Result<RpcServerHandle, String> {
    let mut child = tokio::process::Command::new(binary())
        .arg("serve")
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .args(extra)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn netservices-rpc: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("RPC_PORT=") {
                    let port = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid RPC_PORT value '{value}': {e}"))?;
                    return Ok(RpcServerHandle { child, port });
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read netservices-rpc stdout: {err}")),
            Err(_) => continue,
        }
    }
    Err("RPC_PORT line not emitted by netservices-rpc".to_string())
}

async fn connect(server: &RpcServerHandle) -> (Service, ServiceApi) {
    let stream = tokio::net::TcpStream::connect(server.addr()).await.unwrap();
    let service = Service::new(stream, MuxOptions::default());
    let api = service
        .create_service_api(ServiceApiOptions::new().with_timeout(Duration::from_secs(10)))
        .unwrap();
    (service, api)
}

#[tokio::test]
async fn test_serve_direct() {
    let server = start_rpc_server(&[]).await.unwrap();
    let (_service, api) = connect(&server).await;

    let greeting = api.call("greeter.greet", ("happy",)).await.unwrap();
    assert_eq!(greeting, json!("Hello, happy world!"));

    let sum: f64 = api.call_as("math.add", (2, 3)).await.unwrap();
    assert_eq!(sum, 5.0);

    let err = api.call("fail", ("broken",)).await.unwrap_err();
    assert_eq!(err.name(), "Error");
    assert_eq!(err.as_remote().unwrap().message, "broken");

    let err = api.call("greeting", ()).await.unwrap_err();
    assert_eq!(err.name(), "TypeError");

    server.stop().await;
}

#[tokio::test]
async fn test_serve_with_thread_workers() {
    let server = start_rpc_server(&["--workers", "3"]).await.unwrap();
    let (_a, api_a) = connect(&server).await;
    let (_b, api_b) = connect(&server).await;

    let (ra, rb) = tokio::join!(
        api_a.call("echo", ("from a",)),
        api_b.call("echo", ("from b",))
    );
    assert_eq!(ra.unwrap(), json!("from a"));
    assert_eq!(rb.unwrap(), json!("from b"));

    let mut threads = HashSet::new();
    for _ in 0..3 {
        let location = api_a.call("location", ()).await.unwrap();
        threads.insert(location["thread"].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(threads.len(), 3);

    server.stop().await;
}

#[tokio::test]
async fn test_serve_with_process_workers() {
    let server = start_rpc_server(&["--workers", "2", "--process-workers"])
        .await
        .unwrap();
    let (_service, api) = connect(&server).await;

    let mut pids = HashSet::new();
    let mut indices = HashSet::new();
    for _ in 0..2 {
        let location: Value = api.call("location", ()).await.unwrap();
        pids.insert(location["pid"].as_u64().unwrap());
        indices.insert(location["worker"].as_str().unwrap().to_string());
    }
    assert_eq!(pids.len(), 2);
    assert_eq!(indices, HashSet::from(["0".to_string(), "1".to_string()]));
    assert!(!pids.contains(&server.child.id().map(u64::from).unwrap()));

    let greeting = api.call("greeter.greet", ("process",)).await.unwrap();
    assert_eq!(greeting, json!("Hello, process world!"));

    server.stop().await;
}

#[tokio::test]
async fn test_call_subcommand() {
    let server = start_rpc_server(&[]).await.unwrap();

    let output = tokio::process::Command::new(binary())
        .args(["call", "--addr", &server.addr(), "--timeout", "5000", "math.add", "40", "2"])
        .stderr(Stdio::null())
        .output()
        .await
        .unwrap();
    assert!(output.status.success());
    let printed: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(printed, json!(42.0));

    let output = tokio::process::Command::new(binary())
        .args(["call", "--addr", &server.addr(), "fail", "nope"])
        .stderr(Stdio::null())
        .output()
        .await
        .unwrap();
    assert!(!output.status.success());

    server.stop().await;
}
