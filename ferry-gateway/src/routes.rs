//! Axum route handlers for the Ferry gateway API.

use std::{collections::BTreeMap, net::IpAddr, path::PathBuf, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ferry_core::{Chroot, DiskCopyingOptions, DiskCopyingStat, MigrationOptions, MigrationStat, Overrides, TaskId};
use ferry_engine::{disks, TaskPool};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::GatewayError;

// ── Shared state ─────────────────────────────────────────────────────────────

type Pool = Arc<TaskPool>;

// ── Request / response types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StartMigrationBody {
    pub dst_server: String,
    /// Resolved from `dst_server` when empty.
    #[serde(default)]
    pub dst_addrs: Vec<IpAddr>,
    /// VM configuration, forwarded verbatim to the destination.
    pub manifest: serde_json::Value,
    #[serde(default)]
    pub extra_files: BTreeMap<String, String>,
    /// Paths of the disks to mirror. Every local disk when absent.
    #[serde(default)]
    pub disks: Option<Vec<String>>,
    #[serde(default)]
    pub overrides: Overrides,
}

#[derive(Debug, Deserialize)]
pub struct StartCopyingBody {
    pub target: PathBuf,
    #[serde(default)]
    pub reset_bitmap: bool,
    #[serde(default = "default_bitmap_name")]
    pub bitmap_name: String,
    #[serde(default)]
    pub chroot: Option<Chroot>,
}

fn default_bitmap_name() -> String {
    "ferry".to_owned()
}

#[derive(Debug, Serialize)]
pub struct TaskStarted {
    pub task: String,
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Build the application router around the given task pool.
pub fn create_router(pool: Pool) -> Router {
    Router::new()
        .route(
            "/v1/vms/{vm}/migration",
            get(migration_stat).post(start_migration).delete(cancel_migration),
        )
        .route(
            "/v1/vms/{vm}/disks/{disk}/copying",
            get(copying_stat).post(start_copying).delete(cancel_copying),
        )
        .route("/v1/tasks", get(list_tasks))
        .route("/health", get(health))
        .with_state(pool)
        .layer(TraceLayer::new_for_http())
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// `GET /health`: liveness probe.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// `POST /v1/vms/{vm}/migration`: start moving a running VM to another host.
///
/// # Errors
/// Returns [`GatewayError::InvalidRequest`] if a requested disk is not
/// attached to the VM or the destination cannot be resolved, and any
/// admission or preflight error raised by the pool.
pub async fn start_migration(
    State(pool): State<Pool>,
    Path(vm): Path<String>,
    Json(body): Json<StartMigrationBody>,
) -> Result<impl IntoResponse, GatewayError> {
    let vm = checked_vm(vm)?;
    let attached = disks::query_disks(pool.qmp(), &vm).await?;
    let disks = match body.disks {
        None => attached.into_iter().filter(ferry_core::DiskDescriptor::is_local).collect(),
        Some(paths) => select_disks(attached, &paths)?,
    };

    let dst_addrs = if body.dst_addrs.is_empty() {
        resolve(&body.dst_server).await?
    } else {
        body.dst_addrs
    };

    let manifest = serde_json::to_vec(&body.manifest)
        .map_err(|e| GatewayError::InvalidRequest(format!("manifest: {e}")))?;

    let opts = MigrationOptions {
        vm_name: vm.clone(),
        dst_server: body.dst_server,
        dst_addrs,
        manifest,
        extra_files: body.extra_files.into_iter().map(|(k, v)| (k, v.into_bytes())).collect(),
        disks,
        overrides: body.overrides,
    };
    pool.start_migration(opts).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskStarted {
            task: TaskId::migration(vm).to_string(),
        }),
    ))
}

/// `DELETE /v1/vms/{vm}/migration`: cancel and wait for the migration to wind down.
///
/// # Errors
/// Returns an engine error if no migration of `vm` is running.
pub async fn cancel_migration(State(pool): State<Pool>, Path(vm): Path<String>) -> Result<StatusCode, GatewayError> {
    let vm = checked_vm(vm)?;
    pool.cancel(&TaskId::migration(vm)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /v1/vms/{vm}/migration`: live or last persisted migration statistics.
///
/// # Errors
/// Returns [`GatewayError::InvalidRequest`] for a VM name that is not a
/// plain name, or an engine error if persisted statistics cannot be read.
pub async fn migration_stat(
    State(pool): State<Pool>,
    Path(vm): Path<String>,
) -> Result<Json<MigrationStat>, GatewayError> {
    let vm = checked_vm(vm)?;
    Ok(Json(pool.migration_stat(&vm).await?))
}

/// `POST /v1/vms/{vm}/disks/{disk}/copying`: copy one disk to a local target.
///
/// `{disk}` is the percent-encoded host path of the disk.
///
/// # Errors
/// Returns [`GatewayError::InvalidRequest`] if the disk is not attached to
/// the VM, and any admission error raised by the pool.
pub async fn start_copying(
    State(pool): State<Pool>,
    Path((vm, disk)): Path<(String, String)>,
    Json(body): Json<StartCopyingBody>,
) -> Result<impl IntoResponse, GatewayError> {
    let vm = checked_vm(vm)?;
    let descriptor = disks::query_disks(pool.qmp(), &vm)
        .await?
        .into_iter()
        .find(|d| d.path == disk)
        .ok_or_else(|| GatewayError::InvalidRequest(format!("disk {disk} is not attached to {vm}")))?;

    let id = TaskId::disk_copying(&descriptor.path, &vm);
    pool.start_disk_copying(DiskCopyingOptions {
        vm_name: vm,
        disk: descriptor,
        target: body.target,
        reset_bitmap: body.reset_bitmap,
        bitmap_name: body.bitmap_name,
        chroot: body.chroot,
    })?;

    Ok((StatusCode::ACCEPTED, Json(TaskStarted { task: id.to_string() })))
}

/// `DELETE /v1/vms/{vm}/disks/{disk}/copying`: cancel a running disk copy.
///
/// # Errors
/// Returns an engine error if no copy of that disk is running.
pub async fn cancel_copying(
    State(pool): State<Pool>,
    Path((vm, disk)): Path<(String, String)>,
) -> Result<StatusCode, GatewayError> {
    let vm = checked_vm(vm)?;
    pool.cancel(&TaskId::disk_copying(disk, vm)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /v1/vms/{vm}/disks/{disk}/copying`: live or last persisted copy statistics.
///
/// # Errors
/// Returns [`GatewayError::InvalidRequest`] for a VM name that is not a
/// plain name, or an engine error if persisted statistics cannot be read.
pub async fn copying_stat(
    State(pool): State<Pool>,
    Path((vm, disk)): Path<(String, String)>,
) -> Result<Json<DiskCopyingStat>, GatewayError> {
    let vm = checked_vm(vm)?;
    Ok(Json(pool.disk_copying_stat(&vm, &disk).await?))
}

/// `GET /v1/tasks`: every registered task id and whether it is still running.
pub async fn list_tasks(State(pool): State<Pool>) -> Json<BTreeMap<String, bool>> {
    Json(pool.stat())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Path segments arrive percent-decoded, so `{vm}` may carry separators.
fn checked_vm(vm: String) -> Result<String, GatewayError> {
    ferry_core::check_vm_name(&vm).map_err(|e| GatewayError::InvalidRequest(format!("{vm:?}: {e}")))?;
    Ok(vm)
}

fn select_disks(
    attached: Vec<ferry_core::DiskDescriptor>,
    paths: &[String],
) -> Result<Vec<ferry_core::DiskDescriptor>, GatewayError> {
    let mut by_path: BTreeMap<String, _> = attached.into_iter().map(|d| (d.path.clone(), d)).collect();
    paths
        .iter()
        .map(|p| {
            by_path
                .remove(p)
                .ok_or_else(|| GatewayError::InvalidRequest(format!("disk {p} is not attached or listed twice")))
        })
        .collect()
}

async fn resolve(host: &str) -> Result<Vec<IpAddr>, GatewayError> {
    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| GatewayError::InvalidRequest(format!("cannot resolve {host}: {e}")))?;
    let mut ips: Vec<IpAddr> = Vec::new();
    for addr in addrs {
        if !ips.contains(&addr.ip()) {
            ips.push(addr.ip());
        }
    }
    if ips.is_empty() {
        return Err(GatewayError::InvalidRequest(format!("no address for {host}")));
    }
    Ok(ips)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Method, Request},
    };
    use ferry_engine::{
        qmp::{EventLog, Monitor},
        EngineConfig, EngineError, QmpPool, RemoteConnector, RemoteControl,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    const DISK: &str = "/dev/vg/alice-disk0";
    const DISK_ENCODED: &str = "%2Fdev%2Fvg%2Falice-disk0";

    /// Answers `query-block` with one local disk and accepts everything else.
    /// Block jobs never report progress, so started tasks stay in flight.
    #[derive(Default)]
    struct StubMonitor {
        events: EventLog,
    }

    #[async_trait]
    impl Monitor for StubMonitor {
        async fn execute(&self, command: &str, _arguments: Option<Value>) -> Result<Value, EngineError> {
            Ok(match command {
                "query-block" => json!([{
                    "device": "drive-virtio-disk0",
                    "inserted": {"file": DISK, "drv": "raw", "image": {"virtual-size": 1_u64 << 30}}
                }]),
                "query-block-jobs" => json!([]),
                _ => json!({}),
            })
        }

        fn events(&self) -> &EventLog {
            &self.events
        }

        async fn close(&self) {
            self.events.close();
        }
    }

    struct UnreachableConnector;

    #[async_trait]
    impl RemoteConnector for UnreachableConnector {
        async fn connect(&self, dst_server: &str, _addrs: &[IpAddr]) -> Result<Arc<dyn RemoteControl>, EngineError> {
            Err(EngineError::Remote(format!("{dst_server} unreachable")))
        }
    }

    fn test_app(state_dir: &std::path::Path) -> (Router, Pool) {
        let mut config = EngineConfig::default();
        config.state_dir = state_dir.to_path_buf();
        config.poll_interval = std::time::Duration::from_millis(5);

        let qmp = Arc::new(QmpPool::new(&config));
        qmp.insert("alice", Arc::new(StubMonitor::default()));
        let pool = Arc::new(TaskPool::new(config, qmp, Arc::new(UnreachableConnector)));
        (create_router(Arc::clone(&pool)), pool)
    }

    fn json_request(method: Method, uri: &str, body: &Value) -> Request<Body> {
        match Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
        {
            Ok(r) => r,
            Err(e) => panic!("failed to build request: {e}"),
        }
    }

    fn empty_request(method: Method, uri: &str) -> Request<Body> {
        match Request::builder().method(method).uri(uri).body(Body::empty()) {
            Ok(r) => r,
            Err(e) => panic!("failed to build request: {e}"),
        }
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = match axum::body::to_bytes(resp.into_body(), 64 * 1024).await {
            Ok(b) => b,
            Err(e) => panic!("failed to read body: {e}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => panic!("body is not JSON: {e}"),
        }
    }

    fn tempdir() -> tempfile::TempDir {
        match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        }
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let dir = tempdir();
        let (app, _) = test_app(dir.path());
        let resp = match app.oneshot(empty_request(Method::GET, "/health")).await {
            Ok(r) => r,
            Err(e) => panic!("request failed: {e}"),
        };
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn unknown_migration_reports_none() {
        let dir = tempdir();
        let (app, _) = test_app(dir.path());
        let resp = match app.oneshot(empty_request(Method::GET, "/v1/vms/bob/migration")).await {
            Ok(r) => r,
            Err(e) => panic!("request failed: {e}"),
        };
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "none");
    }

    #[tokio::test]
    async fn migration_of_stopped_vm_is_not_found() {
        let dir = tempdir();
        let (app, _) = test_app(dir.path());
        let body = json!({"dst_server": "host2", "dst_addrs": ["10.0.0.2"], "manifest": {}});
        let resp = match app.oneshot(json_request(Method::POST, "/v1/vms/bob/migration", &body)).await {
            Ok(r) => r,
            Err(e) => panic!("request failed: {e}"),
        };
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn migration_with_unknown_disk_is_bad_request() {
        let dir = tempdir();
        let (app, _) = test_app(dir.path());
        let body = json!({
            "dst_server": "host2",
            "dst_addrs": ["10.0.0.2"],
            "manifest": {"name": "alice"},
            "disks": ["/dev/vg/nope"]
        });
        let resp = match app.oneshot(json_request(Method::POST, "/v1/vms/alice/migration", &body)).await {
            Ok(r) => r,
            Err(e) => panic!("request failed: {e}"),
        };
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let err = body_json(resp).await;
        assert!(err["error"].as_str().is_some_and(|m| m.contains("/dev/vg/nope")));
    }

    #[tokio::test]
    async fn unreachable_destination_is_server_error() {
        let dir = tempdir();
        let (app, pool) = test_app(dir.path());
        let body = json!({"dst_server": "host2", "dst_addrs": [IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))], "manifest": {}});
        let resp = match app.oneshot(json_request(Method::POST, "/v1/vms/alice/migration", &body)).await {
            Ok(r) => r,
            Err(e) => panic!("request failed: {e}"),
        };
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(pool.stat().is_empty(), "no task is registered when the destination is unreachable");
    }

    #[tokio::test]
    async fn cancel_without_task_is_not_found() {
        let dir = tempdir();
        let (app, _) = test_app(dir.path());
        let resp = match app.oneshot(empty_request(Method::DELETE, "/v1/vms/alice/migration")).await {
            Ok(r) => r,
            Err(e) => panic!("request failed: {e}"),
        };
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn copying_lifecycle_over_http() {
        let dir = tempdir();
        let (app, pool) = test_app(dir.path());
        let uri = format!("/v1/vms/alice/disks/{DISK_ENCODED}/copying");
        let body = json!({"target": dir.path().join("alice-disk0.raw")});

        let resp = match app.clone().oneshot(json_request(Method::POST, &uri, &body)).await {
            Ok(r) => r,
            Err(e) => panic!("request failed: {e}"),
        };
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["task"], TaskId::disk_copying(DISK, "alice").to_string());

        let resp = match app.clone().oneshot(json_request(Method::POST, &uri, &body)).await {
            Ok(r) => r,
            Err(e) => panic!("request failed: {e}"),
        };
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = match app.clone().oneshot(empty_request(Method::GET, "/v1/tasks")).await {
            Ok(r) => r,
            Err(e) => panic!("request failed: {e}"),
        };
        let tasks = body_json(resp).await;
        assert_eq!(tasks.as_object().map(serde_json::Map::len), Some(1));

        let resp = match app.clone().oneshot(empty_request(Method::DELETE, &uri)).await {
            Ok(r) => r,
            Err(e) => panic!("request failed: {e}"),
        };
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(pool.stat().is_empty());

        let resp = match app.oneshot(empty_request(Method::GET, &uri)).await {
            Ok(r) => r,
            Err(e) => panic!("request failed: {e}"),
        };
        assert_eq!(resp.status(), StatusCode::OK);
        let stat = body_json(resp).await;
        assert_eq!(stat["status"], "interrupted");
        assert_eq!(stat["disk"], DISK);
    }

    #[tokio::test]
    async fn vm_names_with_separators_are_bad_requests() {
        let dir = tempdir();
        let (app, _) = test_app(&dir.path().join("stat"));
        let planted = serde_json::to_vec(&MigrationStat::none()).unwrap_or_default();
        assert!(std::fs::write(dir.path().join("x.migration.json"), planted).is_ok());

        for uri in [
            "/v1/vms/..%2Fx/migration",
            "/v1/vms/..%2F..%2Fx/migration",
            "/v1/vms/..%2Fx/disks/%2Fdev%2Fvg%2Falice-disk0/copying",
        ] {
            let resp = match app.clone().oneshot(empty_request(Method::GET, uri)).await {
                Ok(r) => r,
                Err(e) => panic!("request failed: {e}"),
            };
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn copying_unattached_disk_is_bad_request() {
        let dir = tempdir();
        let (app, _) = test_app(dir.path());
        let body = json!({"target": dir.path().join("x.raw")});
        let resp = match app
            .oneshot(json_request(Method::POST, "/v1/vms/alice/disks/%2Fdev%2Fvg%2Fother/copying", &body))
            .await
        {
            Ok(r) => r,
            Err(e) => panic!("request failed: {e}"),
        };
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
