#![forbid(unsafe_code)]

use async_trait::async_trait;
use expenses_contracts::auth::{ContextTag, CredentialRecord, SubjectId, TokenRecord, TokenValue};
use expenses_contracts::receipt::{ExpenseRow, ExpenseRowId};
use expenses_contracts::ContractViolation;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("duplicate key in {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("foreign key violation in {table}: {key}")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
    #[error("database error: {0}")]
    Database(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Typed repository interface for `user_data`.
#[async_trait]
pub trait CredentialRepo: Send + Sync {
    /// Fails with `DuplicateKey` when the username or subject id already exists.
    async fn insert_credential_row(&self, record: CredentialRecord) -> Result<(), StorageError>;

    async fn credential_row_by_username(
        &self,
        username: &str,
    ) -> Result<Option<CredentialRecord>, StorageError>;

    async fn credential_row_by_subject(
        &self,
        subject_id: &SubjectId,
    ) -> Result<Option<CredentialRecord>, StorageError>;
}

/// Typed repository interface for `token_data`.
#[async_trait]
pub trait TokenRepo: Send + Sync {
    /// Deletes every token for `(record.subject_id, record.context_tag)` and inserts
    /// `record` inside one transaction, serialized per pair. A concurrent reader never
    /// sees two tokens for the same pair.
    async fn replace_token_row(&self, record: TokenRecord) -> Result<(), StorageError>;

    async fn token_row_by_value(
        &self,
        token: &TokenValue,
    ) -> Result<Option<TokenRecord>, StorageError>;

    /// Returns whether a row was removed.
    async fn delete_token_row(&self, token: &TokenValue) -> Result<bool, StorageError>;

    async fn token_rows_for_subject(
        &self,
        subject_id: &SubjectId,
        context_tag: &ContextTag,
    ) -> Result<Vec<TokenRecord>, StorageError>;
}

/// Typed repository interface for `expense_data`. Rows are insert-only.
#[async_trait]
pub trait ExpenseRepo: Send + Sync {
    async fn insert_expense_row(&self, row: ExpenseRow) -> Result<(), StorageError>;

    async fn expense_row(&self, row_id: &ExpenseRowId) -> Result<Option<ExpenseRow>, StorageError>;

    async fn expense_rows_for_subject(
        &self,
        subject_id: &SubjectId,
    ) -> Result<Vec<ExpenseRow>, StorageError>;
}

/// Everything the service needs from one relational store.
pub trait ExpensesStore: CredentialRepo + TokenRepo + ExpenseRepo {}

impl<T> ExpensesStore for T where T: CredentialRepo + TokenRepo + ExpenseRepo {}
