//! QMP wire types.
//!
//! QMP is line-delimited JSON over a Unix socket. Commands carry an `id`
//! that the reply echoes back; asynchronous events carry none.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::EngineError;

pub const EVENT_JOB_STATUS_CHANGE: &str = "JOB_STATUS_CHANGE";
pub const EVENT_BLOCK_JOB_COMPLETED: &str = "BLOCK_JOB_COMPLETED";
pub const EVENT_BLOCK_JOB_CANCELLED: &str = "BLOCK_JOB_CANCELLED";
pub const EVENT_BLOCK_JOB_ERROR: &str = "BLOCK_JOB_ERROR";

/// A command sent to the monitor.
#[derive(Debug, Serialize)]
pub(crate) struct Command<'a> {
    pub execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

/// The `error` member of a failed reply.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorBody {
    pub class: String,
    pub desc: String,
}

impl From<ErrorBody> for EngineError {
    fn from(e: ErrorBody) -> Self {
        EngineError::Qmp { class: e.class, desc: e.desc }
    }
}

#[derive(Debug, Deserialize)]
struct RawTimestamp {
    seconds: i64,
    microseconds: i64,
}

/// One inbound line, classified.
#[derive(Debug)]
pub(crate) enum Inbound {
    Greeting,
    Reply { id: Option<u64>, result: Result<Value, EngineError> },
    Event(Event),
}

impl Inbound {
    /// Parses a single line received from the monitor.
    ///
    /// # Errors
    /// Returns [`EngineError::Protocol`] for lines that are not QMP messages.
    pub(crate) fn parse(line: &str) -> Result<Self, EngineError> {
        let mut obj: Map<String, Value> = serde_json::from_str(line)
            .map_err(|e| EngineError::protocol(format!("malformed message: {e}")))?;

        if obj.contains_key("QMP") {
            return Ok(Self::Greeting);
        }

        if let Some(name) = obj.remove("event") {
            let event = name
                .as_str()
                .ok_or_else(|| EngineError::protocol("event name is not a string"))?
                .to_owned();
            let timestamp = match obj.remove("timestamp") {
                Some(ts) => {
                    let ts: RawTimestamp = serde_json::from_value(ts)
                        .map_err(|e| EngineError::protocol(format!("bad event timestamp: {e}")))?;
                    let nanos = u32::try_from(ts.microseconds.clamp(0, 999_999) * 1000).unwrap_or(0);
                    DateTime::from_timestamp(ts.seconds, nanos).unwrap_or_else(Utc::now)
                }
                None => Utc::now(),
            };
            let data = obj.remove("data").unwrap_or(Value::Null);
            return Ok(Self::Event(Event { event, data, timestamp }));
        }

        let id = obj.get("id").and_then(Value::as_u64);
        if let Some(ret) = obj.remove("return") {
            return Ok(Self::Reply { id, result: Ok(ret) });
        }
        if let Some(err) = obj.remove("error") {
            let body: ErrorBody = serde_json::from_value(err)
                .map_err(|e| EngineError::protocol(format!("bad error reply: {e}")))?;
            return Ok(Self::Reply { id, result: Err(body.into()) });
        }

        Err(EngineError::protocol(format!("unrecognized message: {line}")))
    }
}

/// An asynchronous monitor event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an event stamped with the current time.
    pub fn now(event: impl Into<String>, data: Value) -> Self {
        Self { event: event.into(), data, timestamp: Utc::now() }
    }

    /// Returns `true` if this is a `kind` event whose data contains every
    /// key/value pair of `fields`.
    #[must_use]
    pub fn matches(&self, kind: &str, fields: &Map<String, Value>) -> bool {
        self.event == kind && fields.iter().all(|(k, v)| self.data.get(k) == Some(v))
    }
}

/// One action of a `transaction` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl TransactionAction {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self { kind: kind.into(), data }
    }
}

/// An entry of `query-block-jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockJobInfo {
    /// Job identifier (named `device` for historical reasons).
    pub device: String,
    #[serde(rename = "type", default)]
    pub job_type: String,
    pub len: u64,
    pub offset: u64,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub status: String,
}

/// RAM section of `query-migrate`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RamInfo {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub remaining: u64,
    #[serde(default)]
    pub transferred: u64,
    #[serde(default)]
    pub mbps: f64,
}

/// Reply of `query-migrate`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MigrationInfo {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ram: Option<RamInfo>,
    #[serde(default)]
    pub error_desc: Option<String>,
}

/// Builds the field filter used by [`Event::matches`].
#[must_use]
pub fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
}
