use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KeaError;

/// Command names understood by the Control Agent / dhcp6 server.
pub mod commands {
    pub const CONFIG_GET: &str = "config-get";
    pub const CONFIG_RELOAD: &str = "config-reload";
    pub const CONFIG_WRITE: &str = "config-write";

    pub const REMOTE_SUBNET6_SET: &str = "remote-subnet6-set";
    pub const REMOTE_SUBNET6_DEL_BY_ID: &str = "remote-subnet6-del-by-id";
    pub const REMOTE_SUBNET6_LIST: &str = "remote-subnet6-list";
    pub const REMOTE_SUBNET6_GET_BY_ID: &str = "remote-subnet6-get-by-id";

    pub const LEASE6_GET_PAGE: &str = "lease6-get-page";
    pub const LEASE6_DEL: &str = "lease6-del";

    pub const RESERVATION_ADD: &str = "reservation-add";
    pub const RESERVATION_UPDATE: &str = "reservation-update";
    pub const RESERVATION_DEL: &str = "reservation-del";
    pub const RESERVATION_GET_ALL: &str = "reservation-get-all";

    pub const OPTION_DEF6_SET: &str = "option-def6-set";
}

const RESULT_SUCCESS: i64 = 0;
const RESULT_ERROR: i64 = 1;
const RESULT_UNSUPPORTED: i64 = 2;
const RESULT_EMPTY: i64 = 3;

static NO_ARGUMENTS: Value = Value::Null;

/// Request envelope. `arguments` is omitted when null.
#[derive(Debug, Serialize)]
pub struct KeaCommand<'a> {
    pub command: &'a str,
    pub service: [&'a str; 1],
    #[serde(skip_serializing_if = "Value::is_null")]
    pub arguments: &'a Value,
}

#[derive(Debug, Deserialize)]
struct RawAnswer {
    result: i64,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
}

/// First answer of a Kea response array, classified by result code.
#[derive(Debug, Clone, PartialEq)]
pub enum KeaResponse {
    /// result 0
    Success { text: Option<String>, arguments: Value },
    /// result 3: the command worked but found nothing.
    Empty { text: Option<String> },
    /// result 1, or any code this client does not know.
    Error { text: String },
    /// result 2
    Unsupported { text: String },
}

impl KeaResponse {
    pub fn decode(body: &[u8]) -> Result<Self, KeaError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| KeaError::Protocol(format!("response is not JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, KeaError> {
        let first = match value {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            Value::Array(_) => return Err(KeaError::Protocol("empty response array".into())),
            other => {
                return Err(KeaError::Protocol(format!(
                    "expected a response array, got {}",
                    json_kind(&other)
                )));
            }
        };

        let raw: RawAnswer = serde_json::from_value(first)
            .map_err(|e| KeaError::Protocol(format!("bad answer element: {e}")))?;

        Ok(match raw.result {
            RESULT_SUCCESS => Self::Success {
                text: raw.text,
                arguments: raw.arguments.unwrap_or(Value::Null),
            },
            RESULT_EMPTY => Self::Empty { text: raw.text },
            RESULT_UNSUPPORTED => Self::Unsupported {
                text: raw.text.unwrap_or_else(|| "command not supported".into()),
            },
            RESULT_ERROR => Self::Error {
                text: raw.text.unwrap_or_else(|| "unknown error".into()),
            },
            code => Self::Error {
                text: format!(
                    "result {code}: {}",
                    raw.text.unwrap_or_else(|| "unknown error".into())
                ),
            },
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Success { text, .. } | Self::Empty { text } => text.as_deref(),
            Self::Error { text } | Self::Unsupported { text } => Some(text),
        }
    }

    /// Arguments of a successful answer; `Null` for every other kind.
    pub fn arguments(&self) -> &Value {
        match self {
            Self::Success { arguments, .. } => arguments,
            _ => &NO_ARGUMENTS,
        }
    }

    /// `arguments.count` of a successful answer, 0 otherwise.
    pub fn count(&self) -> u64 {
        self.arguments()
            .get("count")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Turn error and unsupported answers into `KeaError`.
    /// Returns the arguments on success and `None` on an empty result.
    pub fn require(self, command: &str) -> Result<Option<Value>, KeaError> {
        match self {
            Self::Success { arguments, .. } => Ok(Some(arguments)),
            Self::Empty { .. } => Ok(None),
            Self::Error { text } => Err(KeaError::Command {
                command: command.to_string(),
                text,
            }),
            Self::Unsupported { text } => Err(KeaError::Unsupported {
                command: command.to_string(),
                text,
            }),
        }
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
