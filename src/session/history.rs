//! Locally recorded outgoing transactions, shown until the ledger indexes them

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::ui::{UiSink, UiUpdate};
use crate::account::{AccountError, AccountId, AccountStore};

pub const LOCAL_TRANSACTIONS: &str = "localTransactions";
pub const NATIVE_TOKEN_SLUG: &str = "toncoin";
/// Newest entries kept per account; older ones are dropped on record.
pub const LOCAL_TRANSACTIONS_LIMIT: usize = 20;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalTransaction {
    pub id: String,
    pub timestamp: i64,
    pub amount: String,
    pub from_address: String,
    pub to_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub fee: String,
    pub slug: String,
    pub is_incoming: bool,
}

/// Fields the caller knows; id and timestamp are filled in on record.
#[derive(Debug, Clone)]
pub struct LocalTransactionDraft {
    pub amount: String,
    pub from_address: String,
    pub to_address: String,
    pub comment: Option<String>,
    pub fee: String,
}

pub struct LocalHistory {
    accounts: Arc<AccountStore>,
    ui: Arc<dyn UiSink>,
}

impl LocalHistory {
    pub fn new(accounts: Arc<AccountStore>, ui: Arc<dyn UiSink>) -> Self {
        Self { accounts, ui }
    }

    pub fn list(&self, account_id: &AccountId) -> Result<Vec<LocalTransaction>, AccountError> {
        Ok(self
            .accounts
            .get_account_value(account_id, LOCAL_TRANSACTIONS)?
            .unwrap_or_default())
    }

    pub fn record(&self, account_id: &AccountId, draft: LocalTransactionDraft) -> Result<LocalTransaction, AccountError> {
        let transaction = LocalTransaction {
            id: format!("{}:local", Uuid::new_v4()),
            timestamp: Utc::now().timestamp_millis(),
            amount: draft.amount,
            from_address: draft.from_address,
            to_address: draft.to_address,
            comment: draft.comment,
            fee: draft.fee,
            slug: NATIVE_TOKEN_SLUG.to_string(),
            is_incoming: false,
        };

        self.accounts.update_account_value(
            account_id,
            LOCAL_TRANSACTIONS,
            |transactions: &mut Option<Vec<LocalTransaction>>| {
                let transactions = transactions.get_or_insert_with(Vec::new);
                transactions.push(transaction.clone());
                let excess = transactions.len().saturating_sub(LOCAL_TRANSACTIONS_LIMIT);
                transactions.drain(..excess);
            },
        )?;

        self.ui.dispatch(UiUpdate::NewLocalTransaction {
            account_id: *account_id,
            transaction: transaction.clone(),
        });
        Ok(transaction)
    }
}
