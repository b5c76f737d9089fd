//! QMP client over a Unix domain socket.
//!
//! A background reader task owns the read half of the socket: replies are
//! routed to the waiting caller by request id, events go to the
//! [`EventLog`]. A request lock held for the whole round trip keeps
//! commands on one monitor from interleaving; the write half has its own
//! lock, taken only while a line is written, so `close` never waits on a
//! reply.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::protocol::{Command, Inbound};
use super::{EventLog, Monitor};
use crate::EngineError;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, EngineError>>>>>;

/// Monitor connection to a QEMU process.
pub struct QmpMonitor {
    vm_name: String,
    request: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Pending,
    next_id: AtomicU64,
    events: Arc<EventLog>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for QmpMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QmpMonitor").field("vm_name", &self.vm_name).finish_non_exhaustive()
    }
}

impl QmpMonitor {
    /// Connects to a monitor socket and negotiates command mode.
    ///
    /// # Errors
    /// Returns [`EngineError::DeadlineExceeded`] if the greeting and
    /// capabilities negotiation do not finish within `timeout`, and
    /// [`EngineError::Io`] or [`EngineError::Protocol`] on failure.
    pub async fn connect(vm_name: &str, socket_path: &Path, timeout: Duration) -> Result<Self, EngineError> {
        let handshake = async {
            let stream = UnixStream::connect(socket_path).await?;
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            match next_message(&mut lines).await? {
                Inbound::Greeting => {}
                other => return Err(EngineError::protocol(format!("expected greeting, got {other:?}"))),
            }

            let cmd = Command { execute: "qmp_capabilities", arguments: None, id: None };
            write_line(&mut write_half, &cmd).await?;

            loop {
                match next_message(&mut lines).await? {
                    Inbound::Reply { result, .. } => {
                        result?;
                        break;
                    }
                    // Events may precede the reply; nothing is waiting on them yet.
                    Inbound::Event(_) | Inbound::Greeting => {}
                }
            }
            Ok::<_, EngineError>((lines, write_half))
        };

        let (lines, write_half) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| {
                EngineError::DeadlineExceeded(format!(
                    "QMP handshake with {} did not finish within {}s",
                    socket_path.display(),
                    timeout.as_secs()
                ))
            })??;

        let pending: Pending = Arc::default();
        let events = Arc::new(EventLog::new());
        let reader = tokio::spawn(read_loop(
            vm_name.to_owned(),
            lines,
            Arc::clone(&pending),
            Arc::clone(&events),
        ));

        tracing::debug!(vm = vm_name, socket = %socket_path.display(), "QMP monitor connected");

        Ok(Self {
            vm_name: vm_name.to_owned(),
            request: tokio::sync::Mutex::new(()),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            pending,
            next_id: AtomicU64::new(1),
            events,
            reader,
        })
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value, EngineError>>>> {
        lock_pending(&self.pending)
    }
}

#[async_trait]
impl Monitor for QmpMonitor {
    async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value, EngineError> {
        let _request = self.request.lock().await;

        let rx = {
            let mut writer = self.writer.lock().await;
            let stream = writer
                .as_mut()
                .ok_or_else(|| EngineError::protocol(format!("monitor of {} is closed", self.vm_name)))?;

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            self.pending().insert(id, tx);

            let cmd = Command { execute: command, arguments: arguments.as_ref(), id: Some(id) };
            if let Err(e) = write_line(stream, &cmd).await {
                self.pending().remove(&id);
                return Err(e);
            }
            rx
        };

        rx.await.map_err(|_| {
            EngineError::protocol(format!("monitor of {} closed before replying to {command}", self.vm_name))
        })?
    }

    fn events(&self) -> &EventLog {
        &self.events
    }

    async fn close(&self) {
        self.reader.abort();
        fail_pending(&self.pending, &self.vm_name);
        self.events.close();

        let stream = self.writer.lock().await.take();
        // A request registered before the writer was taken has no reader left.
        fail_pending(&self.pending, &self.vm_name);
        if let Some(mut stream) = stream {
            let _ = stream.shutdown().await;
        }
        tracing::debug!(vm = %self.vm_name, "QMP monitor closed");
    }
}

impl Drop for QmpMonitor {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn next_message(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Result<Inbound, EngineError> {
    loop {
        let line = lines
            .next_line()
            .await?
            .ok_or_else(|| EngineError::protocol("connection closed"))?;
        if !line.trim().is_empty() {
            return Inbound::parse(&line);
        }
    }
}

async fn write_line(stream: &mut OwnedWriteHalf, cmd: &Command<'_>) -> Result<(), EngineError> {
    let mut buf = serde_json::to_vec(cmd).map_err(|e| EngineError::protocol(format!("encode command: {e}")))?;
    buf.push(b'\n');
    stream.write_all(&buf).await?;
    Ok(())
}

async fn read_loop(
    vm_name: String,
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    pending: Pending,
    events: Arc<EventLog>,
) {
    loop {
        let msg = match next_message(&mut lines).await {
            Ok(msg) => msg,
            Err(EngineError::Protocol(reason)) if reason.starts_with("malformed") => {
                tracing::warn!(vm = %vm_name, %reason, "skipping malformed QMP message");
                continue;
            }
            Err(e) => {
                tracing::debug!(vm = %vm_name, error = %e, "QMP reader stopped");
                break;
            }
        };

        match msg {
            Inbound::Event(event) => {
                tracing::trace!(vm = %vm_name, event = %event.event, "QMP event");
                events.push(event);
            }
            Inbound::Reply { id: Some(id), result } => {
                if let Some(tx) = lock_pending(&pending).remove(&id) {
                    let _ = tx.send(result);
                }
            }
            Inbound::Reply { id: None, .. } | Inbound::Greeting => {
                tracing::debug!(vm = %vm_name, "ignoring unsolicited QMP message");
            }
        }
    }

    fail_pending(&pending, &vm_name);
    events.close();
}

fn fail_pending(pending: &Pending, vm_name: &str) {
    for (_, tx) in lock_pending(pending).drain() {
        let _ = tx.send(Err(EngineError::protocol(format!("monitor of {vm_name} closed"))));
    }
}

fn lock_pending(
    pending: &Pending,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value, EngineError>>>> {
    #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
    pending.lock().expect("pending replies lock poisoned")
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::{json, Map};
    use tokio::net::UnixListener;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::qmp::protocol::EVENT_JOB_STATUS_CHANGE;

    /// Accepts one client and plays a minimal QEMU: greeting, capabilities,
    /// then echoes every command name back and emits one event per command.
    async fn fake_qemu(listener: UnixListener) {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let greeting = json!({"QMP": {"version": {}, "capabilities": []}});
        let _ = write_half.write_all(format!("{greeting}\n").as_bytes()).await;

        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(req) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let reply = match req["execute"].as_str() {
                Some("qmp_capabilities") => json!({"return": {}}),
                Some("fail") => json!({"error": {"class": "GenericError", "desc": "nope"}, "id": req["id"]}),
                Some("hang") => continue,
                Some(name) => {
                    let event = json!({
                        "event": EVENT_JOB_STATUS_CHANGE,
                        "data": {"id": name, "status": "running"},
                        "timestamp": {"seconds": Utc::now().timestamp(), "microseconds": 0}
                    });
                    let _ = write_half.write_all(format!("{event}\n").as_bytes()).await;
                    json!({"return": {"echo": name}, "id": req["id"]})
                }
                None => continue,
            };
            let _ = write_half.write_all(format!("{reply}\n").as_bytes()).await;
        }
    }

    async fn connected() -> (tempfile::TempDir, QmpMonitor) {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let path = dir.path().join("alice.qmp");
        let listener = match UnixListener::bind(&path) {
            Ok(l) => l,
            Err(e) => panic!("bind: {e}"),
        };
        tokio::spawn(fake_qemu(listener));
        let monitor = match QmpMonitor::connect("alice", &path, Duration::from_secs(5)).await {
            Ok(m) => m,
            Err(e) => panic!("connect: {e}"),
        };
        (dir, monitor)
    }

    #[tokio::test]
    async fn execute_returns_reply_for_request() {
        let (_dir, monitor) = connected().await;
        let reply = monitor.execute("query-status", None).await;
        match reply {
            Ok(v) => assert_eq!(v["echo"], "query-status"),
            Err(e) => panic!("execute failed: {e}"),
        }
    }

    #[tokio::test]
    async fn execute_surfaces_error_class() {
        let (_dir, monitor) = connected().await;
        let reply = monitor.execute("fail", None).await;
        assert!(
            matches!(reply, Err(EngineError::Qmp { ref class, .. }) if class == "GenericError"),
            "unexpected reply {reply:?}"
        );
    }

    #[tokio::test]
    async fn events_are_buffered_by_reader() {
        let (_dir, monitor) = connected().await;
        let start = Utc::now() - chrono::Duration::seconds(1);
        if let Err(e) = monitor.execute("drive-mirror", None).await {
            panic!("execute failed: {e}");
        }
        let ev = monitor
            .events()
            .wait(
                EVENT_JOB_STATUS_CHANGE,
                &Map::new(),
                start,
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;
        match ev {
            Ok(ev) => assert_eq!(ev.data["id"], "drive-mirror"),
            Err(e) => panic!("no event: {e}"),
        }
    }

    #[tokio::test]
    async fn concurrent_commands_get_their_own_replies() {
        let (_dir, monitor) = connected().await;
        let (a, b) = tokio::join!(monitor.execute("cmd-a", None), monitor.execute("cmd-b", None));
        assert_eq!(a.ok().map(|v| v["echo"].clone()), Some(json!("cmd-a")));
        assert_eq!(b.ok().map(|v| v["echo"].clone()), Some(json!("cmd-b")));
    }

    #[tokio::test]
    async fn close_fails_further_commands() {
        let (_dir, monitor) = connected().await;
        monitor.close().await;
        assert!(monitor.execute("query-status", None).await.is_err());
        assert!(monitor.events().is_closed());
    }

    #[tokio::test]
    async fn close_does_not_wait_for_an_unanswered_command() {
        let (_dir, monitor) = connected().await;
        let hung = monitor.execute("hang", None);
        let closer = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            monitor.close().await;
        };

        let (reply, ()) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(hung, closer) })
            .await
            .unwrap_or_else(|_| panic!("close deadlocked behind an in-flight command"));
        assert!(matches!(reply, Err(EngineError::Protocol(_))), "unexpected reply {reply:?}");
        assert!(monitor.events().is_closed());
    }

    #[tokio::test]
    async fn connect_to_missing_socket_fails() {
        let res = QmpMonitor::connect("ghost", Path::new("/nonexistent/ghost.qmp"), Duration::from_secs(1)).await;
        assert!(res.is_err());
    }
}
