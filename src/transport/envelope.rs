use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RpcError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeKind {
    Init,
    CallMethod,
    MethodResponse,
    MethodCallback,
    CancelProgress,
    Update,
    UnhandledError,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorSummary {
    pub message: String,
}

/// One discrete message on the link between the privileged context and a peer.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub with_callback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Value>,
    /// Binary payload moved alongside the envelope instead of being JSON-encoded.
    #[serde(skip)]
    pub transfer: Option<Bytes>,
}

impl MessageEnvelope {
    fn empty(kind: EnvelopeKind) -> Self {
        Self {
            channel: None,
            kind,
            message_id: None,
            name: None,
            args: None,
            with_callback: false,
            response: None,
            error: None,
            callback_args: None,
            update: None,
            transfer: None,
        }
    }

    pub fn init(args: Vec<Value>) -> Self {
        Self {
            name: Some("init".to_string()),
            args: Some(args),
            ..Self::empty(EnvelopeKind::Init)
        }
    }

    pub fn call_method(message_id: Option<String>, name: &str, args: Vec<Value>, with_callback: bool) -> Self {
        Self {
            message_id,
            name: Some(name.to_string()),
            args: Some(args),
            with_callback,
            ..Self::empty(EnvelopeKind::CallMethod)
        }
    }

    pub fn response(message_id: String, response: Value, transfer: Option<Bytes>) -> Self {
        Self {
            message_id: Some(message_id),
            response: Some(response),
            transfer,
            ..Self::empty(EnvelopeKind::MethodResponse)
        }
    }

    pub fn error_response(message_id: String, message: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id),
            error: Some(ErrorSummary { message: message.into() }),
            ..Self::empty(EnvelopeKind::MethodResponse)
        }
    }

    pub fn callback(message_id: String, callback_args: Vec<Value>, transfer: Option<Bytes>) -> Self {
        Self {
            message_id: Some(message_id),
            callback_args: Some(callback_args),
            transfer,
            ..Self::empty(EnvelopeKind::MethodCallback)
        }
    }

    pub fn cancel_progress(message_id: String) -> Self {
        Self {
            message_id: Some(message_id),
            ..Self::empty(EnvelopeKind::CancelProgress)
        }
    }

    pub fn update(update: Value) -> Self {
        Self {
            update: Some(update),
            ..Self::empty(EnvelopeKind::Update)
        }
    }

    pub fn unhandled_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(ErrorSummary { message: message.into() }),
            ..Self::empty(EnvelopeKind::UnhandledError)
        }
    }

    pub fn with_channel(mut self, channel: Option<&str>) -> Self {
        self.channel = channel.map(str::to_string);
        self
    }
}

/// A `callMethod` request as seen by an API surface: the method name and its
/// positional arguments, before conversion into a typed request.
#[derive(Debug, Clone)]
pub struct MethodCall {
    pub name: String,
    pub args: Vec<Value>,
}

impl MethodCall {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Decode a required positional argument.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, RpcError> {
        let value = self.args.get(index).cloned().ok_or_else(|| {
            RpcError::InvalidParams(format!("{}: missing argument #{}", self.name, index))
        })?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::InvalidParams(format!("{}: argument #{}: {}", self.name, index, e)))
    }

    /// Decode an optional positional argument; absent and `null` both yield `None`.
    pub fn opt_arg<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, RpcError> {
        match self.args.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.arg(index).map(Some),
        }
    }
}

/// Return value of a call plus an optional buffer moved with the response.
#[derive(Debug, Clone)]
pub struct Reply {
    pub value: Value,
    pub transfer: Option<Bytes>,
}

impl Reply {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, RpcError> {
        let value = serde_json::to_value(value)
            .map_err(|e| RpcError::Failed(format!("Serialization error: {}", e)))?;
        Ok(Self { value, transfer: None })
    }

    pub fn with_transfer(mut self, buffer: Bytes) -> Self {
        self.transfer = Some(buffer);
        self
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Self { value, transfer: None }
    }
}
