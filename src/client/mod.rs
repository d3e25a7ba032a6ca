// Ledger client
pub mod address;
pub mod ledger_rpc;

pub use ledger_rpc::RpcLedger;
