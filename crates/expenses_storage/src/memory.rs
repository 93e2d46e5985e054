#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use expenses_contracts::auth::{ContextTag, CredentialRecord, SubjectId, TokenRecord, TokenValue};
use expenses_contracts::receipt::{ExpenseRow, ExpenseRowId};
use expenses_contracts::Validate;

use crate::repo::{CredentialRepo, ExpenseRepo, StorageError, TokenRepo};

#[derive(Debug, Default)]
struct Tables {
    credentials: BTreeMap<SubjectId, CredentialRecord>,
    username_index: BTreeMap<String, SubjectId>,
    tokens: BTreeMap<(SubjectId, ContextTag), TokenRecord>,
    token_index: BTreeMap<String, (SubjectId, ContextTag)>,
    expenses: BTreeMap<ExpenseRowId, ExpenseRow>,
}

/// In-memory store with the same table semantics as `PgStore`. Every operation
/// runs under one lock, which gives token replacement its atomicity.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_expense_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    /// Makes every `insert_expense_row` fail until reset.
    pub fn set_expense_writes_failing(&self, failing: bool) {
        self.fail_expense_writes.store(failing, Ordering::SeqCst);
    }

    pub fn expense_row_count(&self) -> usize {
        self.lock().map(|t| t.expenses.len()).unwrap_or(0)
    }

    pub fn token_row_count(&self) -> usize {
        self.lock().map(|t| t.tokens.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl CredentialRepo for MemoryStore {
    async fn insert_credential_row(&self, record: CredentialRecord) -> Result<(), StorageError> {
        record.validate()?;
        let mut t = self.lock()?;
        if t.username_index.contains_key(&record.username) {
            return Err(StorageError::DuplicateKey {
                table: "user_data",
                key: record.username,
            });
        }
        if t.credentials.contains_key(&record.subject_id) {
            return Err(StorageError::DuplicateKey {
                table: "user_data",
                key: record.subject_id.to_string(),
            });
        }
        t.username_index
            .insert(record.username.clone(), record.subject_id);
        t.credentials.insert(record.subject_id, record);
        Ok(())
    }

    async fn credential_row_by_username(
        &self,
        username: &str,
    ) -> Result<Option<CredentialRecord>, StorageError> {
        let t = self.lock()?;
        Ok(t.username_index
            .get(username)
            .and_then(|id| t.credentials.get(id))
            .cloned())
    }

    async fn credential_row_by_subject(
        &self,
        subject_id: &SubjectId,
    ) -> Result<Option<CredentialRecord>, StorageError> {
        Ok(self.lock()?.credentials.get(subject_id).cloned())
    }
}

#[async_trait]
impl TokenRepo for MemoryStore {
    async fn replace_token_row(&self, record: TokenRecord) -> Result<(), StorageError> {
        record.validate()?;
        let mut t = self.lock()?;
        if !t.credentials.contains_key(&record.subject_id) {
            return Err(StorageError::ForeignKeyViolation {
                table: "token_data",
                key: record.subject_id.to_string(),
            });
        }
        if t.token_index.contains_key(record.token_value.as_str()) {
            return Err(StorageError::DuplicateKey {
                table: "token_data",
                key: "token".to_string(),
            });
        }
        let key = (record.subject_id, record.context_tag.clone());
        if let Some(previous) = t.tokens.remove(&key) {
            t.token_index.remove(previous.token_value.as_str());
        }
        t.token_index
            .insert(record.token_value.as_str().to_string(), key.clone());
        t.tokens.insert(key, record);
        Ok(())
    }

    async fn token_row_by_value(
        &self,
        token: &TokenValue,
    ) -> Result<Option<TokenRecord>, StorageError> {
        let t = self.lock()?;
        Ok(t.token_index
            .get(token.as_str())
            .and_then(|key| t.tokens.get(key))
            .cloned())
    }

    async fn delete_token_row(&self, token: &TokenValue) -> Result<bool, StorageError> {
        let mut t = self.lock()?;
        match t.token_index.remove(token.as_str()) {
            Some(key) => Ok(t.tokens.remove(&key).is_some()),
            None => Ok(false),
        }
    }

    async fn token_rows_for_subject(
        &self,
        subject_id: &SubjectId,
        context_tag: &ContextTag,
    ) -> Result<Vec<TokenRecord>, StorageError> {
        let t = self.lock()?;
        Ok(t.tokens
            .get(&(*subject_id, context_tag.clone()))
            .cloned()
            .into_iter()
            .collect())
    }
}

#[async_trait]
impl ExpenseRepo for MemoryStore {
    async fn insert_expense_row(&self, row: ExpenseRow) -> Result<(), StorageError> {
        if self.fail_expense_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "expense writes disabled".to_string(),
            ));
        }
        row.validate()?;
        let mut t = self.lock()?;
        if !t.credentials.contains_key(&row.subject_id) {
            return Err(StorageError::ForeignKeyViolation {
                table: "expense_data",
                key: row.subject_id.to_string(),
            });
        }
        if t.expenses.contains_key(&row.row_id) {
            return Err(StorageError::DuplicateKey {
                table: "expense_data",
                key: row.row_id.to_string(),
            });
        }
        t.expenses.insert(row.row_id, row);
        Ok(())
    }

    async fn expense_row(&self, row_id: &ExpenseRowId) -> Result<Option<ExpenseRow>, StorageError> {
        Ok(self.lock()?.expenses.get(row_id).cloned())
    }

    async fn expense_rows_for_subject(
        &self,
        subject_id: &SubjectId,
    ) -> Result<Vec<ExpenseRow>, StorageError> {
        Ok(self
            .lock()?
            .expenses
            .values()
            .filter(|row| row.subject_id == *subject_id)
            .cloned()
            .collect())
    }
}
