//! Peer control over plain HTTP/1.1 with JSON bodies.
//!
//! Every operation is a `POST /v1/peer/<op>` to the peer agent listening
//! on the configured peer port. Binary payloads travel base64-encoded.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use super::{RemoteConnector, RemoteControl};
use crate::{EngineConfig, EngineError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const INCOMING_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
struct ManifestBody {
    manifest: String,
    extra_files: BTreeMap<String, String>,
}

impl ManifestBody {
    fn encode(manifest: &[u8], extra_files: &BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            manifest: BASE64.encode(manifest),
            extra_files: extra_files.iter().map(|(k, v)| (k.clone(), BASE64.encode(v))).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct VmBody<'a> {
    vm_name: &'a str,
}

#[derive(Debug, Serialize)]
struct ExportBody<'a> {
    vm_name: &'a str,
    addr: IpAddr,
    disks: &'a [String],
}

#[derive(Debug, Serialize)]
struct CapacityBody<'a> {
    disks: &'a BTreeMap<String, u64>,
}

#[derive(Debug, Deserialize)]
struct PresentReply {
    present: bool,
}

#[derive(Debug, Deserialize)]
struct PortReply {
    port: u16,
}

#[derive(Debug, Default, Deserialize)]
struct CapacityReply {
    /// Destination paths that do not fit.
    #[serde(default)]
    insufficient: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Empty {}

/// [`RemoteControl`] speaking to the peer agent of one destination host.
#[derive(Debug, Clone)]
pub struct HttpRemoteControl {
    dst_server: String,
    addr: SocketAddr,
    request_timeout: Duration,
    incoming_timeout: Duration,
}

impl HttpRemoteControl {
    #[must_use]
    pub fn new(dst_server: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            dst_server: dst_server.into(),
            addr,
            request_timeout: REQUEST_TIMEOUT,
            incoming_timeout: INCOMING_TIMEOUT,
        }
    }

    /// Bounds every exchange by `request`, and `start-incoming` by `incoming`.
    #[must_use]
    pub fn with_timeouts(mut self, request: Duration, incoming: Duration) -> Self {
        self.request_timeout = request;
        self.incoming_timeout = incoming;
        self
    }

    async fn call<B: Serialize + Sync, R: DeserializeOwned + Default>(
        &self,
        op: &str,
        body: &B,
    ) -> Result<R, EngineError> {
        self.call_within(self.request_timeout, op, body).await
    }

    async fn call_within<B: Serialize + Sync, R: DeserializeOwned + Default>(
        &self,
        limit: Duration,
        op: &str,
        body: &B,
    ) -> Result<R, EngineError> {
        let payload = serde_json::to_vec(body).map_err(|e| EngineError::Remote(format!("encode {op}: {e}")))?;
        let reply = tokio::time::timeout(limit, peer_request(self.addr, op, payload))
            .await
            .map_err(|_| EngineError::DeadlineExceeded(format!("{op} on {}: no reply within {limit:?}", self.dst_server)))??;
        if reply.is_empty() {
            return Ok(R::default());
        }
        serde_json::from_slice(&reply).map_err(|e| EngineError::Remote(format!("decode {op} reply: {e}")))
    }
}

#[async_trait]
impl RemoteControl for HttpRemoteControl {
    async fn is_config_present(&self, vm_name: &str) -> Result<bool, EngineError> {
        let reply: PresentReplyOrDefault = self.call("config-present", &VmBody { vm_name }).await?;
        Ok(reply.0.is_some_and(|r| r.present))
    }

    async fn create_config_from_manifest(
        &self,
        manifest: &[u8],
        extra_files: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), EngineError> {
        let _: Empty = self.call("create-config", &ManifestBody::encode(manifest, extra_files)).await?;
        Ok(())
    }

    async fn check_disk_capacity(&self, disks: &BTreeMap<String, u64>) -> Result<(), EngineError> {
        let reply: CapacityReply = self.call("check-capacity", &CapacityBody { disks }).await?;
        if reply.insufficient.is_empty() {
            return Ok(());
        }
        Err(EngineError::Precondition(format!(
            "Insufficient space on {} for {}",
            self.dst_server,
            reply.insufficient.join(", ")
        )))
    }

    async fn start_incoming_instance(
        &self,
        manifest: &[u8],
        extra_files: &BTreeMap<String, Vec<u8>>,
    ) -> Result<u16, EngineError> {
        let body = ManifestBody::encode(manifest, extra_files);
        let reply: PortReplyOrDefault = self.call_within(self.incoming_timeout, "start-incoming", &body).await?;
        reply.port("start-incoming")
    }

    async fn start_export_server(&self, vm_name: &str, addr: IpAddr, disks: &[String]) -> Result<u16, EngineError> {
        let reply: PortReplyOrDefault = self.call("start-export", &ExportBody { vm_name, addr, disks }).await?;
        reply.port("start-export")
    }

    async fn stop_export_server(&self, vm_name: &str) -> Result<(), EngineError> {
        let _: Empty = self.call("stop-export", &VmBody { vm_name }).await?;
        Ok(())
    }

    async fn send_continue(&self, vm_name: &str) -> Result<(), EngineError> {
        let _: Empty = self.call("continue", &VmBody { vm_name }).await?;
        Ok(())
    }

    async fn remove_config(&self, vm_name: &str) -> Result<(), EngineError> {
        let _: Empty = self.call("remove-config", &VmBody { vm_name }).await?;
        Ok(())
    }
}

/// Replies that must carry a body; an empty body decodes to `None`.
#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
struct PresentReplyOrDefault(Option<PresentReply>);

#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
struct PortReplyOrDefault(Option<PortReply>);

impl PortReplyOrDefault {
    fn port(self, op: &str) -> Result<u16, EngineError> {
        self.0
            .map(|r| r.port)
            .ok_or_else(|| EngineError::Remote(format!("{op} reply carries no port")))
    }
}

/// Connects to the peer agent on the first resolved address.
#[derive(Debug, Clone)]
pub struct HttpRemoteConnector {
    peer_port: u16,
    request_timeout: Duration,
    incoming_timeout: Duration,
}

impl HttpRemoteConnector {
    #[must_use]
    pub fn new(peer_port: u16) -> Self {
        Self {
            peer_port,
            request_timeout: REQUEST_TIMEOUT,
            incoming_timeout: INCOMING_TIMEOUT,
        }
    }

    /// Peer port and request bounds taken from `config`.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            peer_port: config.peer_port,
            request_timeout: config.remote_timeout,
            incoming_timeout: config.incoming_timeout,
        }
    }
}

#[async_trait]
impl RemoteConnector for HttpRemoteConnector {
    async fn connect(&self, dst_server: &str, addrs: &[IpAddr]) -> Result<Arc<dyn RemoteControl>, EngineError> {
        let ip = addrs
            .first()
            .ok_or_else(|| EngineError::Remote(format!("no address for {dst_server}")))?;
        let remote = HttpRemoteControl::new(dst_server, SocketAddr::new(*ip, self.peer_port))
            .with_timeouts(self.request_timeout, self.incoming_timeout);
        Ok(Arc::new(remote))
    }
}

/// Sends one JSON request to the peer agent and returns the reply body.
///
/// Unbounded apart from the connect; callers wrap it in a timeout.
///
/// # Errors
/// Returns [`EngineError::Remote`] on connection, HTTP or status errors.
async fn peer_request(addr: SocketAddr, op: &str, body: Vec<u8>) -> Result<Vec<u8>, EngineError> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| EngineError::Remote(format!("connect to {addr}: timed out")))?
        .map_err(|e| EngineError::Remote(format!("connect to {addr}: {e}")))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| EngineError::Remote(format!("HTTP handshake: {e}")))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("peer connection closed: {e}");
        }
    });

    let path = format!("/v1/peer/{op}");
    let content_len = body.len();
    let req = Request::builder()
        .method(Method::POST)
        .uri(path.as_str())
        .header("Host", addr.to_string())
        .header("Content-Type", "application/json")
        .header("Content-Length", content_len.to_string())
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| EngineError::Remote(format!("build request: {e}")))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| EngineError::Remote(format!("send {path}: {e}")))?;

    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| EngineError::Remote(format!("read {path} reply: {e}")))?
        .to_bytes();

    if !status.is_success() {
        return Err(EngineError::Remote(format!(
            "HTTP {status} from {path}: {}",
            String::from_utf8_lossy(&bytes)
        )));
    }
    Ok(bytes.to_vec())
}
