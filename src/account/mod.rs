//! Account identity for the wallet core
//!
//! - Composite account ids (`{index}-{chain}-{network}`)
//! - Per-account values kept in flat storage maps
//! - The single "current account" pointer

pub mod id;
pub mod store;
pub mod types;

pub use id::{AccountId, Chain, Network};
pub use store::{AccountError, AccountStore};
pub use types::{AccountRecord, HardwareInfo};
