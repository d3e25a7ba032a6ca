pub mod account;
pub mod api;
pub mod cli;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod promise;
pub mod session;
pub mod storage;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
