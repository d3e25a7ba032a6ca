use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ledger::LedgerError;
use super::manifest::ManifestError;
use crate::account::AccountError;
use crate::crypto::KeyError;
use crate::promise::PromiseError;

pub const UNKNOWN_ERROR: u16 = 0;
pub const BAD_REQUEST_ERROR: u16 = 1;
pub const MANIFEST_NOT_FOUND_ERROR: u16 = 2;
pub const MANIFEST_CONTENT_ERROR: u16 = 3;
pub const UNKNOWN_APP_ERROR: u16 = 100;
pub const USER_REJECTS_ERROR: u16 = 300;
pub const METHOD_NOT_SUPPORTED: u16 = 400;

/// Errors the wallet window knows how to render.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayError {
    Unexpected,
    PartialTransactionFailure,
    UnsupportedHardwarePayload,
    InsufficientBalance,
    InvalidToAddress,
    InvalidAmount,
    DomainNotResolved,
    WalletNotInitialized,
    InvalidStateInit,
}

/// Closed set of protocol failures; each maps to one public code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("{message}")]
    BadRequest {
        message: String,
        display_error: Option<DisplayError>,
    },
    #[error("Manifest not found")]
    ManifestNotFound,
    #[error("Manifest content error")]
    ManifestContent,
    #[error("Canceled by the user")]
    UserRejected,
    #[error("Method not supported")]
    MethodNotSupported,
    #[error("Unhandled error: {0}")]
    Unknown(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

impl SessionError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
            display_error: None,
        }
    }

    pub fn bad_request_with(message: impl Into<String>, display_error: DisplayError) -> Self {
        Self::BadRequest {
            message: message.into(),
            display_error: Some(display_error),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::BadRequest { .. } => BAD_REQUEST_ERROR,
            Self::ManifestNotFound => MANIFEST_NOT_FOUND_ERROR,
            Self::ManifestContent => MANIFEST_CONTENT_ERROR,
            Self::UserRejected => USER_REJECTS_ERROR,
            Self::MethodNotSupported => METHOD_NOT_SUPPORTED,
            Self::Unknown(_) => UNKNOWN_ERROR,
        }
    }

    /// Message safe to hand to a third party. Internal detail never leaves `Unknown`.
    pub fn public_message(&self) -> String {
        match self {
            Self::Unknown(_) => "Unhandled error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn display_error(&self) -> Option<DisplayError> {
        match self {
            Self::BadRequest { display_error, .. } => *display_error,
            Self::Unknown(_) => Some(DisplayError::Unexpected),
            _ => None,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.public_message(),
        }
    }
}

impl From<AccountError> for SessionError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::NotAuthorized | AccountError::InvalidId(_) => Self::bad_request(err.to_string()),
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<PromiseError> for SessionError {
    fn from(err: PromiseError) -> Self {
        match err {
            PromiseError::Rejected | PromiseError::Canceled => Self::UserRejected,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<LedgerError> for SessionError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Draft(display_error) => Self::BadRequest {
                message: format!("{:?}", display_error),
                display_error: Some(display_error),
            },
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<ManifestError> for SessionError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::Fetch(_) => Self::ManifestNotFound,
            ManifestError::Invalid(_) => Self::ManifestContent,
        }
    }
}

impl From<KeyError> for SessionError {
    fn from(err: KeyError) -> Self {
        Self::Unknown(err.to_string())
    }
}
