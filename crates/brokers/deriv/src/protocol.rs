use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tradesync_core::*;

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Requests sent TO the back-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Authorize the connection with the user's access token.
    Authorize { token: String },
    /// Fetch the balance and keep receiving updates.
    BalanceSubscribe,
    /// Start mirroring the trader identified by the token.
    CopyStart {
        trader_token: String,
        login_id: Option<String>,
    },
    /// Stop mirroring the trader identified by the token.
    CopyStop {
        trader_token: String,
        login_id: Option<String>,
    },
}

impl Request {
    pub fn authorize(token: impl Into<String>) -> Self {
        Request::Authorize {
            token: token.into(),
        }
    }

    /// `login_id` is dropped when unknown or the `---` placeholder.
    pub fn copy_start(trader_token: &TraderToken, login_id: Option<&str>) -> Self {
        Request::CopyStart {
            trader_token: trader_token.as_str().to_string(),
            login_id: known_login_id(login_id).map(str::to_string),
        }
    }

    pub fn copy_stop(trader_token: &TraderToken, login_id: Option<&str>) -> Self {
        Request::CopyStop {
            trader_token: trader_token.as_str().to_string(),
            login_id: known_login_id(login_id).map(str::to_string),
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Authorize { .. } => RequestKind::Authorize,
            Request::BalanceSubscribe => RequestKind::BalanceSubscribe,
            Request::CopyStart { .. } => RequestKind::CopyStart,
            Request::CopyStop { .. } => RequestKind::CopyStop,
        }
    }

    /// Build the JSON text frame. Optional fields that are absent are left out
    /// of the object entirely.
    pub fn encode(&self, req_id: RequestId) -> Result<String, TransportError> {
        let req_id = req_id.0;
        let wire = match self {
            Request::Authorize { token } => WireRequest::Authorize {
                authorize: token,
                req_id,
            },
            Request::BalanceSubscribe => WireRequest::Balance {
                balance: 1,
                subscribe: 1,
                req_id,
            },
            Request::CopyStart {
                trader_token,
                login_id,
            } => WireRequest::CopyStart {
                copy_start: trader_token,
                loginid: login_id.as_deref(),
                req_id,
            },
            Request::CopyStop {
                trader_token,
                login_id,
            } => WireRequest::CopyStop {
                copy_stop: trader_token,
                loginid: login_id.as_deref(),
                req_id,
            },
        };
        serde_json::to_string(&wire).map_err(|e| TransportError::Encode(e.to_string()))
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireRequest<'a> {
    Authorize {
        authorize: &'a str,
        req_id: u64,
    },
    Balance {
        balance: u8,
        subscribe: u8,
        req_id: u64,
    },
    CopyStart {
        copy_start: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        loginid: Option<&'a str>,
        req_id: u64,
    },
    CopyStop {
        copy_stop: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        loginid: Option<&'a str>,
        req_id: u64,
    },
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Frames that could not be understood at all.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Frame is not a JSON object")]
    NotAnObject,
    #[error("Malformed {msg_type} payload: {reason}")]
    MalformedPayload { msg_type: String, reason: String },
}

/// The `error` object the back-end sends instead of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

/// Body of an `authorize` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeInfo {
    pub loginid: String,
    #[serde(default)]
    pub fullname: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub is_virtual: Option<u8>,
}

/// Body of a `balance` response or push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub balance: Decimal,
    pub currency: String,
    #[serde(default)]
    pub loginid: Option<String>,
}

/// Typed payload selected by `msg_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Authorize(AuthorizeInfo),
    Balance(BalanceUpdate),
    /// `1` means the back-end accepted the command.
    CopyStart(i64),
    CopyStop(i64),
    /// Error frames carry no payload.
    Empty,
    /// A message type this client does not interpret.
    Other,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub msg_type: Option<String>,
    pub req_id: Option<RequestId>,
    /// Takes precedence over `payload` when present.
    pub error: Option<ApiError>,
    pub payload: Payload,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let mut object = match value {
            Value::Object(map) => map,
            _ => return Err(ProtocolError::NotAnObject),
        };

        // Untagged frames are typed by whichever known payload key they carry.
        let msg_type = object
            .get("msg_type")
            .and_then(Value::as_str)
            .or_else(|| PAYLOAD_KEYS.into_iter().find(|key| object.contains_key(*key)))
            .map(str::to_string);
        let req_id = object.get("req_id").and_then(Value::as_u64).map(RequestId);

        if let Some(raw) = object.remove("error") {
            let error = serde_json::from_value::<ApiError>(raw.clone()).unwrap_or_else(|_| {
                ApiError {
                    code: None,
                    message: raw
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| raw.to_string()),
                }
            });
            return Ok(Self {
                msg_type,
                req_id,
                error: Some(error),
                payload: Payload::Empty,
            });
        }

        let payload = match msg_type.as_deref() {
            Some(tag @ ("authorize" | "balance")) => {
                let body = object.remove(tag).unwrap_or(Value::Null);
                let malformed = |e: serde_json::Error| ProtocolError::MalformedPayload {
                    msg_type: tag.to_string(),
                    reason: e.to_string(),
                };
                if tag == "authorize" {
                    Payload::Authorize(serde_json::from_value(body).map_err(malformed)?)
                } else {
                    Payload::Balance(serde_json::from_value(body).map_err(malformed)?)
                }
            }
            Some("copy_start") => Payload::CopyStart(flag(object.get("copy_start"))),
            Some("copy_stop") => Payload::CopyStop(flag(object.get("copy_stop"))),
            _ => Payload::Other,
        };

        Ok(Self {
            msg_type,
            req_id,
            error: None,
            payload,
        })
    }

    /// The request kind this frame answers, if any.
    pub fn kind(&self) -> Option<RequestKind> {
        self.msg_type.as_deref().and_then(RequestKind::from_msg_type)
    }
}

const PAYLOAD_KEYS: [&str; 4] = ["authorize", "balance", "copy_start", "copy_stop"];

/// Copy command results are `1` on success; anything else counts as failure.
fn flag(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::Bool(true)) => 1,
        _ => 0,
    }
}
