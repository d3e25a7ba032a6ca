//! API surfaces served over the transport
//!
//! - `dapp`: untrusted sites, one peer per page; the origin comes from the carrier
//! - `popup`: the privileged wallet window that settles pending approvals

pub mod dapp;
pub mod popup;

pub use dapp::DappApi;
pub use popup::PopupApi;

use crate::promise::PromiseError;
use crate::session::SessionError;
use crate::transport::RpcError;

pub const DAPP_CHANNEL: &str = "dapp";
pub const POPUP_CHANNEL: &str = "popup";

impl From<SessionError> for RpcError {
    fn from(err: SessionError) -> Self {
        RpcError::Failed(err.public_message())
    }
}

impl From<PromiseError> for RpcError {
    fn from(err: PromiseError) -> Self {
        RpcError::Failed(err.to_string())
    }
}
