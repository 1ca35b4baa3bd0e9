//! Process-wide map of live global transactions

use crate::transaction::GlobalTransaction;
use dashmap::DashMap;
use std::sync::Arc;
use wsat_common::GlobalId;

/// Concurrent registry keyed by global transaction id
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    transactions: DashMap<GlobalId, Arc<GlobalTransaction>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a transaction, replacing any previous record for the same id
    pub fn put(&self, transaction: GlobalTransaction) -> Arc<GlobalTransaction> {
        let transaction = Arc::new(transaction);
        self.transactions
            .insert(transaction.global_id.clone(), transaction.clone());
        transaction
    }

    pub fn get(&self, global_id: &GlobalId) -> Option<Arc<GlobalTransaction>> {
        self.transactions.get(global_id).map(|entry| entry.clone())
    }

    pub fn remove(&self, global_id: &GlobalId) -> Option<Arc<GlobalTransaction>> {
        let removed = self.transactions.remove(global_id).map(|(_, tx)| tx);
        if removed.is_some() {
            tracing::debug!("Forgot transaction {}", global_id);
        }
        removed
    }

    pub fn contains(&self, global_id: &GlobalId) -> bool {
        self.transactions.contains_key(global_id)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
