#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use expenses_contracts::auth::{ContextTag, CredentialRecord, SubjectId, TokenRecord, TokenValue};
use expenses_contracts::receipt::{ExpenseRow, ExpenseRowId};
use expenses_contracts::Validate;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::repo::{CredentialRepo, ExpenseRepo, StorageError, TokenRepo};

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS user_data (
        uuid UUID PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL DEFAULT '',
        first_name TEXT NOT NULL DEFAULT '',
        last_name TEXT NOT NULL DEFAULT '',
        password_hash TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS token_data (
        uuid UUID NOT NULL REFERENCES user_data(uuid) ON DELETE CASCADE,
        token TEXT NOT NULL UNIQUE,
        expires_at TIMESTAMPTZ NOT NULL,
        context TEXT NOT NULL
    )",
    "ALTER TABLE token_data ADD COLUMN IF NOT EXISTS issued_at TIMESTAMPTZ NOT NULL DEFAULT now()",
    "CREATE UNIQUE INDEX IF NOT EXISTS token_data_subject_context_idx ON token_data (uuid, context)",
    "CREATE TABLE IF NOT EXISTS expense_data (
        uuid UUID PRIMARY KEY,
        date_and_time TIMESTAMPTZ NULL,
        place TEXT NOT NULL DEFAULT '',
        mode_of_payment TEXT NOT NULL DEFAULT '',
        amount NUMERIC NOT NULL,
        currency TEXT NOT NULL,
        category TEXT NOT NULL DEFAULT ''
    )",
    "ALTER TABLE expense_data ADD COLUMN IF NOT EXISTS subject_uuid UUID NULL REFERENCES user_data(uuid)",
    "CREATE INDEX IF NOT EXISTS expense_data_subject_idx ON expense_data (subject_uuid)",
];

type CredentialRow = (Uuid, String, String, String, String, String);
type TokenRow = (Uuid, String, String, DateTime<Utc>, DateTime<Utc>);
type ExpenseDataRow = (
    Uuid,
    Option<Uuid>,
    Option<DateTime<Utc>>,
    String,
    String,
    Decimal,
    String,
    String,
);

/// Postgres-backed store over a shared sqlx connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects, verifies the connection and applies the schema.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        tracing::info!(max_connections, "postgres store ready");
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotent. Also upgrades tables created without `issued_at`/`subject_uuid`.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error("schema"))?;
        }
        Ok(())
    }
}

fn map_sqlx_error(table: &'static str) -> impl Fn(sqlx::Error) -> StorageError {
    move |err| {
        if let Some(db_err) = err.as_database_error() {
            match db_err.code().as_deref() {
                Some("23505") => {
                    return StorageError::DuplicateKey {
                        table,
                        key: db_err.constraint().unwrap_or("unique").to_string(),
                    }
                }
                Some("23503") => {
                    return StorageError::ForeignKeyViolation {
                        table,
                        key: db_err.constraint().unwrap_or("foreign_key").to_string(),
                    }
                }
                _ => {}
            }
        }
        StorageError::Database(err.to_string())
    }
}

fn credential_from_row(row: CredentialRow) -> CredentialRecord {
    let (uuid, username, email, first_name, last_name, password_hash) = row;
    CredentialRecord {
        subject_id: SubjectId::from_uuid(uuid),
        username,
        email,
        first_name,
        last_name,
        password_hash,
    }
}

fn token_from_row(row: TokenRow) -> Result<TokenRecord, StorageError> {
    let (uuid, token, context, issued_at, expires_at) = row;
    Ok(TokenRecord {
        subject_id: SubjectId::from_uuid(uuid),
        token_value: TokenValue::new(token)?,
        context_tag: ContextTag::new(context)?,
        issued_at,
        expires_at,
    })
}

fn expense_from_row(row: ExpenseDataRow) -> Result<ExpenseRow, StorageError> {
    let (uuid, subject_uuid, date_and_time, place, mode_of_payment, amount, currency, category) =
        row;
    let subject_uuid = subject_uuid.ok_or_else(|| {
        StorageError::Database(format!("expense_data row {uuid} has no subject_uuid"))
    })?;
    Ok(ExpenseRow {
        row_id: ExpenseRowId::from_uuid(uuid),
        subject_id: SubjectId::from_uuid(subject_uuid),
        transaction_datetime: date_and_time,
        merchant_name: place,
        payment_method: mode_of_payment,
        total_amount: amount,
        currency,
        spending_category: category,
    })
}

#[async_trait]
impl CredentialRepo for PgStore {
    async fn insert_credential_row(&self, record: CredentialRecord) -> Result<(), StorageError> {
        record.validate()?;
        sqlx::query(
            "INSERT INTO user_data (uuid, username, email, first_name, last_name, password_hash)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.subject_id.as_uuid())
        .bind(&record.username)
        .bind(&record.email)
        .bind(&record.first_name)
        .bind(&record.last_name)
        .bind(&record.password_hash)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error("user_data"))?;
        Ok(())
    }

    async fn credential_row_by_username(
        &self,
        username: &str,
    ) -> Result<Option<CredentialRecord>, StorageError> {
        let row: Option<CredentialRow> = sqlx::query_as(
            "SELECT uuid, username, email, first_name, last_name, password_hash
             FROM user_data WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error("user_data"))?;
        Ok(row.map(credential_from_row))
    }

    async fn credential_row_by_subject(
        &self,
        subject_id: &SubjectId,
    ) -> Result<Option<CredentialRecord>, StorageError> {
        let row: Option<CredentialRow> = sqlx::query_as(
            "SELECT uuid, username, email, first_name, last_name, password_hash
             FROM user_data WHERE uuid = $1",
        )
        .bind(subject_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error("user_data"))?;
        Ok(row.map(credential_from_row))
    }
}

#[async_trait]
impl TokenRepo for PgStore {
    async fn replace_token_row(&self, record: TokenRecord) -> Result<(), StorageError> {
        record.validate()?;
        let map_err = map_sqlx_error("token_data");
        let mut tx = self.pool.begin().await.map_err(&map_err)?;
        // Serializes concurrent issuance for the same (subject, context) pair.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!(
                "token_data:{}:{}",
                record.subject_id,
                record.context_tag.as_str()
            ))
            .execute(&mut *tx)
            .await
            .map_err(&map_err)?;
        sqlx::query("DELETE FROM token_data WHERE uuid = $1 AND context = $2")
            .bind(record.subject_id.as_uuid())
            .bind(record.context_tag.as_str())
            .execute(&mut *tx)
            .await
            .map_err(&map_err)?;
        sqlx::query(
            "INSERT INTO token_data (uuid, token, issued_at, expires_at, context)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.subject_id.as_uuid())
        .bind(record.token_value.as_str())
        .bind(record.issued_at)
        .bind(record.expires_at)
        .bind(record.context_tag.as_str())
        .execute(&mut *tx)
        .await
        .map_err(&map_err)?;
        tx.commit().await.map_err(&map_err)?;
        Ok(())
    }

    async fn token_row_by_value(
        &self,
        token: &TokenValue,
    ) -> Result<Option<TokenRecord>, StorageError> {
        let row: Option<TokenRow> = sqlx::query_as(
            "SELECT uuid, token, context, issued_at, expires_at FROM token_data WHERE token = $1",
        )
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error("token_data"))?;
        row.map(token_from_row).transpose()
    }

    async fn delete_token_row(&self, token: &TokenValue) -> Result<bool, StorageError> {
        let done = sqlx::query("DELETE FROM token_data WHERE token = $1")
            .bind(token.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error("token_data"))?;
        Ok(done.rows_affected() > 0)
    }

    async fn token_rows_for_subject(
        &self,
        subject_id: &SubjectId,
        context_tag: &ContextTag,
    ) -> Result<Vec<TokenRecord>, StorageError> {
        let rows: Vec<TokenRow> = sqlx::query_as(
            "SELECT uuid, token, context, issued_at, expires_at
             FROM token_data WHERE uuid = $1 AND context = $2",
        )
        .bind(subject_id.as_uuid())
        .bind(context_tag.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error("token_data"))?;
        rows.into_iter().map(token_from_row).collect()
    }
}

#[async_trait]
impl ExpenseRepo for PgStore {
    async fn insert_expense_row(&self, row: ExpenseRow) -> Result<(), StorageError> {
        row.validate()?;
        sqlx::query(
            "INSERT INTO expense_data
                (uuid, subject_uuid, date_and_time, place, mode_of_payment, amount, currency, category)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(row.row_id.as_uuid())
        .bind(row.subject_id.as_uuid())
        .bind(row.transaction_datetime)
        .bind(&row.merchant_name)
        .bind(&row.payment_method)
        .bind(row.total_amount)
        .bind(&row.currency)
        .bind(&row.spending_category)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error("expense_data"))?;
        Ok(())
    }

    async fn expense_row(&self, row_id: &ExpenseRowId) -> Result<Option<ExpenseRow>, StorageError> {
        let row: Option<ExpenseDataRow> = sqlx::query_as(
            "SELECT uuid, subject_uuid, date_and_time, place, mode_of_payment, amount, currency, category
             FROM expense_data WHERE uuid = $1",
        )
        .bind(row_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error("expense_data"))?;
        row.map(expense_from_row).transpose()
    }

    async fn expense_rows_for_subject(
        &self,
        subject_id: &SubjectId,
    ) -> Result<Vec<ExpenseRow>, StorageError> {
        let rows: Vec<ExpenseDataRow> = sqlx::query_as(
            "SELECT uuid, subject_uuid, date_and_time, place, mode_of_payment, amount, currency, category
             FROM expense_data WHERE subject_uuid = $1 ORDER BY uuid",
        )
        .bind(subject_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error("expense_data"))?;
        rows.into_iter().map(expense_from_row).collect()
    }
}
