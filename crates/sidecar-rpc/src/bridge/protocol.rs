//! Wire protocol types for host-worker communication.
//!
//! One JSON object per line in each direction:
//! - **Host → worker**: [`Request`]
//! - **Worker → host**: [`Response`] (terminal, correlated by id) or a
//!   [`Notification`] (out-of-band, tagged by `event`)

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Correlation id for one request.
///
/// Opaque on the wire. Ids minted by the host are UUID v4 strings; ids coming
/// back from a worker are taken verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Host → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// Terminal outcome carried by a [`Response`]. Exactly one per response.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(String),
}

/// Worker → host, terminal reply to one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Outcome,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn failure(id: RequestId, error: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Error(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Result(_))
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum ResponseRef<'a> {
    Result { id: &'a RequestId, result: &'a Value },
    Error { id: &'a RequestId, error: &'a str },
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match &self.outcome {
            Outcome::Result(result) => ResponseRef::Result {
                id: &self.id,
                result,
            },
            Outcome::Error(error) => ResponseRef::Error {
                id: &self.id,
                error,
            },
        };
        wire.serialize(serializer)
    }
}

/// `Some(Value::Null)` for an explicit `null`, `None` when the key is absent.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
struct RawResponse {
    id: RequestId,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    error: Option<Value>,
}

impl<'de> Deserialize<'de> for Response {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawResponse::deserialize(deserializer)?;
        let outcome = match (raw.result, raw.error) {
            (Some(result), None) => Outcome::Result(result),
            (None, Some(Value::String(error))) => Outcome::Error(error),
            (None, Some(other)) => {
                return Err(D::Error::custom(format!(
                    "response `error` must be a string, got {other}"
                )));
            }
            (Some(_), Some(_)) => {
                return Err(D::Error::custom(
                    "response carries both `result` and `error`",
                ));
            }
            (None, None) => {
                return Err(D::Error::custom(
                    "response carries neither `result` nor `error`",
                ));
            }
        };
        Ok(Self {
            id: raw.id,
            outcome,
        })
    }
}

/// Fractional completion report for a long-running request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub id: RequestId,
    pub status: String,
    pub progress: f64,
}

impl Progress {
    /// Completion in `0.0..=1.0`, whether the worker reports on a 0..1 or a
    /// 0..100 scale.
    pub fn fraction(&self) -> f64 {
        if !self.progress.is_finite() {
            return 0.0;
        }
        let value = if self.progress > 1.0 {
            self.progress / 100.0
        } else {
            self.progress
        };
        value.clamp(0.0, 1.0)
    }
}

/// Free-form diagnostic line emitted by the worker while handling a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub id: RequestId,
    pub message: String,
}

/// Worker → host, out-of-band and non-terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Notification {
    #[serde(alias = "progress")]
    Progress(Progress),
    #[serde(alias = "log")]
    Log(LogLine),
}

impl Notification {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Progress(p) => &p.id,
            Self::Log(l) => &l.id,
        }
    }
}

/// Anything a worker may write on one output line.
///
/// Lines carrying an `event` key are notifications; everything else must be a
/// response.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Response(Response),
    Notification(Notification),
}

impl Serialize for WorkerMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Response(r) => r.serialize(serializer),
            Self::Notification(n) => n.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for WorkerMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let is_event = match &value {
            Value::Object(map) => map.contains_key("event"),
            other => {
                return Err(D::Error::custom(format!(
                    "expected a JSON object, got {}",
                    json_kind(other)
                )));
            }
        };
        if is_event {
            serde_json::from_value(value)
                .map(Self::Notification)
                .map_err(D::Error::custom)
        } else {
            serde_json::from_value(value)
                .map(Self::Response)
                .map_err(D::Error::custom)
        }
    }
}

impl From<Response> for WorkerMessage {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Notification> for WorkerMessage {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
