//! Scripted in-memory monitor and peer used by the scenario tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ferry_core::{DiskDescriptor, MigrationOptions, Overrides};
use ferry_engine::qmp::protocol::{
    EVENT_BLOCK_JOB_CANCELLED, EVENT_BLOCK_JOB_COMPLETED, EVENT_BLOCK_JOB_ERROR, EVENT_JOB_STATUS_CHANGE,
};
use ferry_engine::qmp::{Event, EventLog};
use ferry_engine::{EngineConfig, EngineError, Monitor, QmpPool, RemoteConnector, RemoteControl, TaskPool};
use serde_json::{json, Value};

pub const VM: &str = "alice";
pub const DISK: &str = "/dev/vg/alice-disk0";
pub const DISK_SIZE: u64 = 10 << 30;

/// One command received by the monitor.
#[derive(Debug, Clone)]
pub struct Call {
    pub command: String,
    pub args: Option<Value>,
}

#[derive(Debug)]
struct Job {
    kind: &'static str,
    polls: u32,
    ready: bool,
}

#[derive(Debug, Default)]
struct Script {
    jobs: HashMap<String, Job>,
    migrate_started: bool,
    migrate_polls: u32,
}

/// A QEMU stand-in: block jobs become ready after a number of polls, the
/// state transfer completes after a number of polls.
pub struct ScriptedMonitor {
    events: EventLog,
    calls: Mutex<Vec<Call>>,
    /// Ordered markers: `ready:<job>` when a job first reports ready, and
    /// `migrate` when the state transfer is requested.
    timeline: Mutex<Vec<String>>,
    script: Mutex<Script>,
    ready_after: Mutex<HashMap<String, u32>>,
    default_ready_after: u32,
    migrate_after: u32,
    /// Keeps the state transfer `active` until cleared.
    pub hold_migration: AtomicBool,
    /// Makes `drive-mirror` fail.
    pub fail_mirror: AtomicBool,
    /// Drops mirror jobs from `query-block-jobs` before they become ready.
    pub vanish_jobs: AtomicBool,
    /// QEMU concludes a job on its own just before `block-job-complete`
    /// reaches it.
    pub reap_before_complete: AtomicBool,
    /// With `reap_before_complete`, the job ends with an I/O error.
    pub reap_with_error: AtomicBool,
    /// `query-migrate` reports `failed` once the transfer is underway.
    pub fail_migration: AtomicBool,
}

impl Default for ScriptedMonitor {
    fn default() -> Self {
        Self::new(3, 3)
    }
}

impl ScriptedMonitor {
    pub fn new(ready_after: u32, migrate_after: u32) -> Self {
        Self {
            events: EventLog::new(),
            calls: Mutex::new(Vec::new()),
            timeline: Mutex::new(Vec::new()),
            script: Mutex::new(Script::default()),
            ready_after: Mutex::new(HashMap::new()),
            default_ready_after: ready_after,
            migrate_after,
            hold_migration: AtomicBool::new(false),
            fail_mirror: AtomicBool::new(false),
            vanish_jobs: AtomicBool::new(false),
            reap_before_complete: AtomicBool::new(false),
            reap_with_error: AtomicBool::new(false),
            fail_migration: AtomicBool::new(false),
        }
    }

    /// Overrides the readiness delay of one job.
    pub fn set_ready_after(&self, job: &str, polls: u32) {
        self.ready_after.lock().expect("lock").insert(job.to_owned(), polls);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls().iter().filter(|c| c.command == command).count()
    }

    pub fn timeline(&self) -> Vec<String> {
        self.timeline.lock().expect("lock").clone()
    }

    fn mark(&self, entry: String) {
        self.timeline.lock().expect("lock").push(entry);
    }

    fn start_job(&self, kind: &'static str, args: &Value) {
        let id = args["job-id"].as_str().unwrap_or_default().to_owned();
        self.script
            .lock()
            .expect("lock")
            .jobs
            .insert(id.clone(), Job { kind, polls: 0, ready: false });
        self.events.push(Event::now(EVENT_JOB_STATUS_CHANGE, json!({"id": id, "status": "running"})));
    }

    fn query_block_jobs(&self) -> Value {
        let mut script = self.script.lock().expect("lock");
        let ready_after = self.ready_after.lock().expect("lock").clone();
        let mut listed = Vec::new();
        let mut concluded = Vec::new();

        if self.vanish_jobs.load(Ordering::SeqCst) {
            script.jobs.retain(|_, job| job.kind != "mirror");
        }

        for (id, job) in &mut script.jobs {
            job.polls += 1;
            let needed = ready_after.get(id).copied().unwrap_or(self.default_ready_after).max(1);
            let offset = DISK_SIZE.min(DISK_SIZE / u64::from(needed) * u64::from(job.polls));
            let done = job.polls >= needed;

            if job.kind == "backup" && done {
                concluded.push(id.clone());
                continue;
            }
            if done && !job.ready {
                job.ready = true;
                self.mark(format!("ready:{id}"));
            }
            listed.push(json!({
                "device": id,
                "type": job.kind,
                "len": DISK_SIZE,
                "offset": if done { DISK_SIZE } else { offset },
                "ready": job.ready,
                "status": if job.ready { "ready" } else { "running" },
            }));
        }

        for id in concluded {
            script.jobs.remove(&id);
            self.events.push(Event::now(
                EVENT_BLOCK_JOB_COMPLETED,
                json!({"device": id, "len": DISK_SIZE, "offset": DISK_SIZE}),
            ));
        }
        Value::Array(listed)
    }

    fn query_migrate(&self) -> Value {
        let mut script = self.script.lock().expect("lock");
        if !script.migrate_started {
            return json!({});
        }
        script.migrate_polls += 1;
        let total = 4u64 << 30;
        if self.fail_migration.load(Ordering::SeqCst) {
            return json!({
                "status": "failed",
                "error-desc": "Unable to write to socket: Connection reset by peer",
            });
        }
        if self.hold_migration.load(Ordering::SeqCst) || script.migrate_polls < self.migrate_after {
            let transferred = (total / 4).min(total);
            return json!({
                "status": "active",
                "ram": {"total": total, "remaining": total - transferred, "transferred": transferred},
            });
        }
        json!({
            "status": "completed",
            "ram": {"total": total, "remaining": 0, "transferred": total},
        })
    }

    fn job_not_found(job: &str) -> EngineError {
        EngineError::Qmp {
            class: "DeviceNotActive".to_owned(),
            desc: format!("Block job '{job}' not found"),
        }
    }
}

#[async_trait]
impl Monitor for ScriptedMonitor {
    async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value, EngineError> {
        self.calls.lock().expect("lock").push(Call {
            command: command.to_owned(),
            args: arguments.clone(),
        });
        let args = arguments.unwrap_or(Value::Null);

        match command {
            "drive-mirror" => {
                if self.fail_mirror.load(Ordering::SeqCst) {
                    return Err(EngineError::Qmp {
                        class: "GenericError".to_owned(),
                        desc: "Could not open NBD target".to_owned(),
                    });
                }
                self.start_job("mirror", &args);
            }
            "drive-backup" => self.start_job("backup", &args),
            "transaction" => {
                for action in args["actions"].as_array().cloned().unwrap_or_default() {
                    if action["type"] == "drive-backup" {
                        self.start_job("backup", &action["data"]);
                    }
                }
            }
            "query-block-jobs" => return Ok(self.query_block_jobs()),
            "block-job-complete" | "block-job-cancel" => {
                let job = args["device"].as_str().unwrap_or_default().to_owned();
                let known = self.script.lock().expect("lock").jobs.remove(&job).is_some();
                if known && command == "block-job-complete" && self.reap_before_complete.load(Ordering::SeqCst) {
                    if self.reap_with_error.load(Ordering::SeqCst) {
                        self.events.push(Event::now(
                            EVENT_BLOCK_JOB_ERROR,
                            json!({"device": job, "operation": "write", "action": "report"}),
                        ));
                    } else {
                        self.events.push(Event::now(
                            EVENT_BLOCK_JOB_COMPLETED,
                            json!({"device": job, "len": DISK_SIZE, "offset": DISK_SIZE}),
                        ));
                    }
                    return Err(Self::job_not_found(&job));
                }
                if !known {
                    return Err(Self::job_not_found(&job));
                }
                let event = if command == "block-job-complete" {
                    EVENT_BLOCK_JOB_COMPLETED
                } else {
                    EVENT_BLOCK_JOB_CANCELLED
                };
                self.events.push(Event::now(event, json!({"device": job, "len": DISK_SIZE})));
            }
            "migrate" => {
                self.mark("migrate".to_owned());
                self.script.lock().expect("lock").migrate_started = true;
            }
            "query-migrate" => return Ok(self.query_migrate()),
            _ => {}
        }
        Ok(json!({}))
    }

    fn events(&self) -> &EventLog {
        &self.events
    }

    async fn close(&self) {
        self.events.close();
    }
}

/// Destination stand-in recording every request.
#[derive(Default)]
pub struct MockRemote {
    calls: Mutex<Vec<String>>,
    pub insufficient_space: AtomicBool,
    pub config_present: AtomicBool,
    /// The destination never answers the incoming-instance request.
    pub hang_incoming: AtomicBool,
}

impl MockRemote {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().expect("lock").push(call.into());
    }
}

#[async_trait]
impl RemoteControl for MockRemote {
    async fn is_config_present(&self, vm_name: &str) -> Result<bool, EngineError> {
        self.record(format!("is_config_present:{vm_name}"));
        Ok(self.config_present.load(Ordering::SeqCst))
    }

    async fn create_config_from_manifest(
        &self,
        _manifest: &[u8],
        _extra_files: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), EngineError> {
        self.record("create_config_from_manifest");
        Ok(())
    }

    async fn check_disk_capacity(&self, disks: &BTreeMap<String, u64>) -> Result<(), EngineError> {
        self.record("check_disk_capacity");
        if self.insufficient_space.load(Ordering::SeqCst) {
            let names: Vec<&str> = disks.keys().map(String::as_str).collect();
            return Err(EngineError::Precondition(format!(
                "Insufficient space on host2 for {}",
                names.join(", ")
            )));
        }
        Ok(())
    }

    async fn start_incoming_instance(
        &self,
        _manifest: &[u8],
        _extra_files: &BTreeMap<String, Vec<u8>>,
    ) -> Result<u16, EngineError> {
        self.record("start_incoming_instance");
        if self.hang_incoming.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(4444)
    }

    async fn start_export_server(&self, vm_name: &str, _addr: IpAddr, _disks: &[String]) -> Result<u16, EngineError> {
        self.record(format!("start_export_server:{vm_name}"));
        Ok(10809)
    }

    async fn stop_export_server(&self, vm_name: &str) -> Result<(), EngineError> {
        self.record(format!("stop_export_server:{vm_name}"));
        Ok(())
    }

    async fn send_continue(&self, vm_name: &str) -> Result<(), EngineError> {
        self.record(format!("send_continue:{vm_name}"));
        Ok(())
    }

    async fn remove_config(&self, vm_name: &str) -> Result<(), EngineError> {
        self.record(format!("remove_config:{vm_name}"));
        Ok(())
    }
}

pub struct MockConnector(pub Arc<MockRemote>);

#[async_trait]
impl RemoteConnector for MockConnector {
    async fn connect(&self, _dst_server: &str, _addrs: &[IpAddr]) -> Result<Arc<dyn RemoteControl>, EngineError> {
        Ok(Arc::clone(&self.0) as Arc<dyn RemoteControl>)
    }
}

pub fn test_config(state_dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.state_dir = state_dir.to_path_buf();
    config.poll_interval = Duration::from_millis(5);
    config.job_start_timeout = Duration::from_secs(2);
    config.job_finish_timeout = Duration::from_secs(2);
    config.remote_timeout = Duration::from_millis(300);
    config.incoming_timeout = Duration::from_millis(300);
    config
}

/// A pool with `monitor` registered for [`VM`].
pub struct Harness {
    pub pool: TaskPool,
    pub monitor: Arc<ScriptedMonitor>,
    pub remote: Arc<MockRemote>,
    pub state_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(monitor: ScriptedMonitor) -> Self {
        let state_dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(state_dir.path());
        let qmp = Arc::new(QmpPool::new(&config));
        let monitor = Arc::new(monitor);
        qmp.insert(VM, Arc::clone(&monitor) as Arc<dyn Monitor>);

        let remote = Arc::new(MockRemote::default());
        let pool = TaskPool::new(config, qmp, Arc::new(MockConnector(Arc::clone(&remote))));
        Self { pool, monitor, remote, state_dir }
    }

    pub async fn wait_migration(&self) {
        let task = self.pool.migration(VM).expect("migration registered");
        tokio::time::timeout(Duration::from_secs(10), task.wait())
            .await
            .expect("migration finished in time");
    }
}

pub fn disk(path: &str, device: &str) -> DiskDescriptor {
    DiskDescriptor::local(path, device, DISK_SIZE)
}

pub fn migration_options(disks: Vec<DiskDescriptor>) -> MigrationOptions {
    MigrationOptions {
        vm_name: VM.to_owned(),
        dst_server: "host2".to_owned(),
        dst_addrs: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))],
        manifest: br#"{"name": "alice"}"#.to_vec(),
        extra_files: BTreeMap::new(),
        disks,
        overrides: Overrides::default(),
    }
}

/// Polls `cond` until it holds or five seconds pass.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
