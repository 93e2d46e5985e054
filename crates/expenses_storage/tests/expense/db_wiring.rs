#![forbid(unsafe_code)]

use std::str::FromStr;

use chrono::{TimeZone, Utc};
use expenses_contracts::auth::{CredentialRecord, SubjectId};
use expenses_contracts::receipt::{ExpenseRow, ExpenseRowId, ExtractedTransaction};
use expenses_storage::{CredentialRepo, ExpenseRepo, MemoryStore, StorageError};
use rust_decimal::Decimal;

fn seeded_store() -> (MemoryStore, SubjectId) {
    let s = MemoryStore::new_in_memory();
    let subject_id = SubjectId::generate();
    let rec = CredentialRecord {
        subject_id,
        username: "margaret".to_string(),
        email: String::new(),
        first_name: String::new(),
        last_name: String::new(),
        password_hash: "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA".to_string(),
    };
    block_on(s.insert_credential_row(rec)).unwrap();
    (s, subject_id)
}

fn block_on<F: std::future::Future>(f: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(f)
}

fn row(subject_id: SubjectId, amount: &str) -> ExpenseRow {
    let tx = ExtractedTransaction {
        merchant_name: "Corner Market".to_string(),
        transaction_datetime: Some(Utc.with_ymd_and_hms(2026, 2, 14, 18, 30, 0).unwrap()),
        payment_method: "VISA".to_string(),
        total_amount: Some(Decimal::from_str(amount).unwrap()),
        currency: "USD".to_string(),
        spending_category: "Groceries".to_string(),
        ..Default::default()
    };
    ExpenseRow::from_transaction(ExpenseRowId::generate(), subject_id, &tx).unwrap()
}

#[test]
fn at_expense_db_01_insert_then_read_back() {
    let (s, subject_id) = seeded_store();
    let r = row(subject_id, "42.17");
    block_on(async {
        s.insert_expense_row(r.clone()).await.unwrap();
        let got = s.expense_row(&r.row_id).await.unwrap();
        assert_eq!(got, Some(r.clone()));
        let all = s.expense_rows_for_subject(&subject_id).await.unwrap();
        assert_eq!(all, vec![r]);
    });
}

#[test]
fn at_expense_db_02_write_failure_leaves_no_row() {
    let (s, subject_id) = seeded_store();
    s.set_expense_writes_failing(true);
    let err = block_on(s.insert_expense_row(row(subject_id, "9.99"))).unwrap_err();
    assert!(matches!(err, StorageError::Unavailable(_)));
    assert_eq!(s.expense_row_count(), 0);

    s.set_expense_writes_failing(false);
    block_on(s.insert_expense_row(row(subject_id, "9.99"))).unwrap();
    assert_eq!(s.expense_row_count(), 1);
}

#[test]
fn at_expense_db_03_row_requires_existing_subject() {
    let (s, _) = seeded_store();
    let err =
        block_on(s.insert_expense_row(row(SubjectId::generate(), "1.00"))).unwrap_err();
    assert!(matches!(
        err,
        StorageError::ForeignKeyViolation {
            table: "expense_data",
            ..
        }
    ));
}

#[test]
fn at_expense_db_04_rows_are_insert_only() {
    let (s, subject_id) = seeded_store();
    let r = row(subject_id, "3.50");
    block_on(s.insert_expense_row(r.clone())).unwrap();
    let err = block_on(s.insert_expense_row(r)).unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey { .. }));
    assert_eq!(s.expense_row_count(), 1);
}

#[test]
fn at_expense_db_05_missing_currency_rejected_before_write() {
    let (s, subject_id) = seeded_store();
    let mut r = row(subject_id, "3.50");
    r.currency.clear();
    let err = block_on(s.insert_expense_row(r)).unwrap_err();
    assert!(matches!(err, StorageError::ContractViolation(_)));
    assert_eq!(s.expense_row_count(), 0);
}
