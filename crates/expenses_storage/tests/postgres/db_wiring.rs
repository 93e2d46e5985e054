#![forbid(unsafe_code)]

//! Runs against a live Postgres only when `EXPENSES_TEST_DATABASE_URL` is set.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use expenses_contracts::auth::{ContextTag, CredentialRecord, SubjectId, TokenRecord, TokenValue};
use expenses_contracts::receipt::{ExpenseRow, ExpenseRowId, ExtractedTransaction};
use expenses_storage::{CredentialRepo, ExpenseRepo, PgStore, StorageError, TokenRepo};
use rust_decimal::Decimal;

async fn store_or_skip() -> Option<PgStore> {
    let url = match std::env::var("EXPENSES_TEST_DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => url,
        _ => return None,
    };
    Some(PgStore::connect(&url, 8).await.unwrap())
}

fn credential() -> CredentialRecord {
    let subject_id = SubjectId::generate();
    CredentialRecord {
        subject_id,
        username: format!("pg_{}", subject_id.as_uuid().simple()),
        email: String::new(),
        first_name: "Pg".to_string(),
        last_name: "Wiring".to_string(),
        password_hash: "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA".to_string(),
    }
}

fn unique_token(tag: &str) -> TokenValue {
    TokenValue::new(format!("{tag}-{}", SubjectId::generate())).unwrap()
}

#[tokio::test]
async fn at_pg_db_01_migrate_is_idempotent() {
    let Some(s) = store_or_skip().await else {
        return;
    };
    s.migrate().await.unwrap();
    s.migrate().await.unwrap();
}

#[tokio::test]
async fn at_pg_db_02_duplicate_username_maps_to_duplicate_key() {
    let Some(s) = store_or_skip().await else {
        return;
    };
    let rec = credential();
    s.insert_credential_row(rec.clone()).await.unwrap();
    let mut again = rec.clone();
    again.subject_id = SubjectId::generate();
    let err = s.insert_credential_row(again).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey { .. }));
}

#[tokio::test]
async fn at_pg_db_03_concurrent_replace_keeps_one_token() {
    let Some(s) = store_or_skip().await else {
        return;
    };
    let s = Arc::new(s);
    let rec = credential();
    s.insert_credential_row(rec.clone()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let s = Arc::clone(&s);
        let subject_id = rec.subject_id;
        handles.push(tokio::spawn(async move {
            let record = TokenRecord::v1(
                subject_id,
                unique_token(&format!("race{i}")),
                ContextTag::user_auth(),
                Utc::now(),
            );
            s.replace_token_row(record).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let rows = s
        .token_rows_for_subject(&rec.subject_id, &ContextTag::user_auth())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn at_pg_db_04_expense_row_round_trip_and_fk() {
    let Some(s) = store_or_skip().await else {
        return;
    };
    let rec = credential();
    s.insert_credential_row(rec.clone()).await.unwrap();
    let tx = ExtractedTransaction {
        merchant_name: "Harbor Cafe".to_string(),
        total_amount: Some(Decimal::from_str("18.40").unwrap()),
        currency: "EUR".to_string(),
        ..Default::default()
    };
    let row = ExpenseRow::from_transaction(ExpenseRowId::generate(), rec.subject_id, &tx).unwrap();
    s.insert_expense_row(row.clone()).await.unwrap();
    assert_eq!(s.expense_row(&row.row_id).await.unwrap(), Some(row));

    let orphan =
        ExpenseRow::from_transaction(ExpenseRowId::generate(), SubjectId::generate(), &tx).unwrap();
    let err = s.insert_expense_row(orphan).await.unwrap_err();
    assert!(matches!(err, StorageError::ForeignKeyViolation { .. }));
}
