#![forbid(unsafe_code)]

use chrono::{Duration, TimeZone, Utc};
use expenses_contracts::auth::{ContextTag, CredentialRecord, SubjectId, TokenRecord, TokenValue};
use expenses_storage::{CredentialRepo, MemoryStore, StorageError, TokenRepo};

fn credential(username: &str) -> CredentialRecord {
    CredentialRecord {
        subject_id: SubjectId::generate(),
        username: username.to_string(),
        email: format!("{username}@example.com"),
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        password_hash: "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA".to_string(),
    }
}

fn token(subject_id: SubjectId, value: &str, issued_minute: u32) -> TokenRecord {
    TokenRecord::v1(
        subject_id,
        TokenValue::new(value).unwrap(),
        ContextTag::user_auth(),
        Utc.with_ymd_and_hms(2026, 3, 1, 9, issued_minute, 0).unwrap(),
    )
}

#[tokio::test]
async fn at_auth_db_01_duplicate_username_rejected() {
    let s = MemoryStore::new_in_memory();
    s.insert_credential_row(credential("ada")).await.unwrap();

    let err = s.insert_credential_row(credential("ada")).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey { table: "user_data", .. }));
}

#[tokio::test]
async fn at_auth_db_02_lookup_by_username_and_subject() {
    let s = MemoryStore::new_in_memory();
    let rec = credential("grace");
    s.insert_credential_row(rec.clone()).await.unwrap();

    let by_name = s.credential_row_by_username("grace").await.unwrap();
    assert_eq!(by_name.as_ref(), Some(&rec));
    let by_id = s.credential_row_by_subject(&rec.subject_id).await.unwrap();
    assert_eq!(by_id, Some(rec));
    assert!(s.credential_row_by_username("nobody").await.unwrap().is_none());
}

#[tokio::test]
async fn at_auth_db_03_replace_leaves_single_token_per_pair() {
    let s = MemoryStore::new_in_memory();
    let rec = credential("linus");
    s.insert_credential_row(rec.clone()).await.unwrap();

    s.replace_token_row(token(rec.subject_id, "first-token", 0))
        .await
        .unwrap();
    s.replace_token_row(token(rec.subject_id, "second-token", 5))
        .await
        .unwrap();

    let rows = s
        .token_rows_for_subject(&rec.subject_id, &ContextTag::user_auth())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].token_value.as_str(), "second-token");
    assert_eq!(s.token_row_count(), 1);
    assert!(s
        .token_row_by_value(&TokenValue::new("first-token").unwrap())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn at_auth_db_04_token_requires_existing_subject() {
    let s = MemoryStore::new_in_memory();
    let err = s
        .replace_token_row(token(SubjectId::generate(), "orphan-token", 0))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::ForeignKeyViolation {
            table: "token_data",
            ..
        }
    ));
}

#[tokio::test]
async fn at_auth_db_05_delete_token_reports_removal() {
    let s = MemoryStore::new_in_memory();
    let rec = credential("barbara");
    s.insert_credential_row(rec.clone()).await.unwrap();
    s.replace_token_row(token(rec.subject_id, "short-lived", 0))
        .await
        .unwrap();

    let value = TokenValue::new("short-lived").unwrap();
    assert!(s.delete_token_row(&value).await.unwrap());
    assert!(!s.delete_token_row(&value).await.unwrap());
    assert_eq!(s.token_row_count(), 0);
}

#[tokio::test]
async fn at_auth_db_06_token_row_keeps_window() {
    let s = MemoryStore::new_in_memory();
    let rec = credential("ken");
    s.insert_credential_row(rec.clone()).await.unwrap();
    let issued = token(rec.subject_id, "windowed", 30);
    s.replace_token_row(issued.clone()).await.unwrap();

    let got = s
        .token_row_by_value(&issued.token_value)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.expires_at - got.issued_at, Duration::hours(24));
    assert_eq!(got, issued);
}

#[tokio::test]
async fn at_auth_db_07_contexts_are_independent() {
    let s = MemoryStore::new_in_memory();
    let rec = credential("dennis");
    s.insert_credential_row(rec.clone()).await.unwrap();

    s.replace_token_row(token(rec.subject_id, "auth-token", 0))
        .await
        .unwrap();
    let mut other = token(rec.subject_id, "device-token", 1);
    other.context_tag = ContextTag::new("device_link").unwrap();
    s.replace_token_row(other).await.unwrap();

    assert_eq!(s.token_row_count(), 2);
}
