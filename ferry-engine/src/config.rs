//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by the monitor pool and all background tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct EngineConfig {
    /// Directory holding one `<vm>.qmp` monitor socket per running VM.
    pub qmp_socket_dir: PathBuf,

    /// Directory where final task statistics are persisted.
    pub state_dir: PathBuf,

    /// Interval between progress polls.
    #[serde(with = "millis")]
    pub poll_interval: Duration,

    /// Bound on waiting for a block job to report `running`.
    #[serde(with = "millis")]
    pub job_start_timeout: Duration,

    /// Bound on waiting for a block job to conclude after completion is requested.
    #[serde(with = "millis")]
    pub job_finish_timeout: Duration,

    /// Bound on connecting and handshaking with a monitor socket.
    #[serde(with = "millis")]
    pub monitor_connect_timeout: Duration,

    /// Bound on one request to the peer host.
    #[serde(with = "millis")]
    pub remote_timeout: Duration,

    /// Bound on the peer starting the incoming QEMU instance.
    #[serde(with = "millis")]
    pub incoming_timeout: Duration,

    /// Migration bandwidth limit in bytes per second.
    pub max_bandwidth: u64,

    /// XBZRLE page cache size in bytes.
    pub xbzrle_cache_size: u64,

    /// TCP port of the control service on peer hosts.
    pub peer_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            qmp_socket_dir: PathBuf::from("/run/ferry/qmp"),
            state_dir: PathBuf::from("/var/lib/ferry/stat"),
            poll_interval: Duration::from_secs(1),
            job_start_timeout: Duration::from_secs(60),
            job_finish_timeout: Duration::from_secs(60),
            monitor_connect_timeout: Duration::from_secs(10),
            remote_timeout: Duration::from_secs(30),
            incoming_timeout: Duration::from_secs(120),
            max_bandwidth: 1 << 30,
            xbzrle_cache_size: 256 << 20,
            peer_port: 9393,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `FERRY_*` environment variables.
    ///
    /// Unparsable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(dir) = lookup("FERRY_QMP_DIR") {
            cfg.qmp_socket_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("FERRY_STATE_DIR") {
            cfg.state_dir = PathBuf::from(dir);
        }
        if let Some(port) = parse_var(&lookup, "FERRY_PEER_PORT") {
            cfg.peer_port = port;
        }
        if let Some(bw) = parse_var(&lookup, "FERRY_MAX_BANDWIDTH") {
            cfg.max_bandwidth = bw;
        }
        if let Some(ms) = parse_var(&lookup, "FERRY_POLL_INTERVAL_MS") {
            cfg.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "FERRY_REMOTE_TIMEOUT_MS") {
            cfg.remote_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "FERRY_INCOMING_TIMEOUT_MS") {
            cfg.incoming_timeout = Duration::from_millis(ms);
        }
        cfg
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment variable");
            None
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_bounds() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.job_start_timeout, Duration::from_secs(60));
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let cfg = EngineConfig::from_lookup(|key| match key {
            "FERRY_STATE_DIR" => Some("/tmp/stat".to_owned()),
            "FERRY_POLL_INTERVAL_MS" => Some("250".to_owned()),
            "FERRY_PEER_PORT" => Some("not-a-port".to_owned()),
            "FERRY_INCOMING_TIMEOUT_MS" => Some("5000".to_owned()),
            _ => None,
        });
        assert_eq!(cfg.state_dir, PathBuf::from("/tmp/stat"));
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.peer_port, EngineConfig::default().peer_port);
        assert_eq!(cfg.incoming_timeout, Duration::from_secs(5));
    }

    #[test]
    fn durations_deserialize_from_millis() {
        let cfg: EngineConfig = match serde_json::from_str(r#"{"poll_interval": 50}"#) {
            Ok(c) => c,
            Err(e) => panic!("deserialize failed: {e}"),
        };
        assert_eq!(cfg.poll_interval, Duration::from_millis(50));
        assert_eq!(cfg.peer_port, 9393, "missing fields fall back to defaults");
    }
}
