#![forbid(unsafe_code)]

use std::sync::Arc;

use expenses_contracts::auth::SubjectId;
use expenses_contracts::ingest::PersistenceStatus;
use expenses_contracts::receipt::{ExpenseRow, ExpenseRowId, ExtractedTransaction};
use expenses_contracts::ContractViolation;
use expenses_storage::{ExpensesStore, StorageError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PersistenceError {
    #[error("transaction not persistable: {0}")]
    NotPersistable(#[from] ContractViolation),
    #[error(transparent)]
    Store(#[from] StorageError),
}

/// Writes one `expense_data` row per successful ingestion.
#[derive(Clone)]
pub struct PersistenceWriter {
    store: Arc<dyn ExpensesStore>,
}

impl std::fmt::Debug for PersistenceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceWriter").finish_non_exhaustive()
    }
}

impl PersistenceWriter {
    pub fn new(store: Arc<dyn ExpensesStore>) -> Self {
        Self { store }
    }

    pub async fn write(
        &self,
        subject_id: SubjectId,
        tx: &ExtractedTransaction,
    ) -> Result<ExpenseRowId, PersistenceError> {
        let row = ExpenseRow::from_transaction(ExpenseRowId::generate(), subject_id, tx)?;
        let row_id = row.row_id;
        self.store.insert_expense_row(row).await?;
        Ok(row_id)
    }

    /// Like `write`, but a failure is logged and reported in the status instead of
    /// returned.
    pub async fn persist(&self, subject_id: SubjectId, tx: &ExtractedTransaction) -> PersistenceStatus {
        match self.write(subject_id, tx).await {
            Ok(row_id) => {
                tracing::info!(subject_id = %subject_id, row_id = %row_id, "expense row committed");
                PersistenceStatus::Committed(row_id)
            }
            Err(err) => {
                tracing::error!(subject_id = %subject_id, error = %err, "expense row not persisted");
                PersistenceStatus::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }
}
