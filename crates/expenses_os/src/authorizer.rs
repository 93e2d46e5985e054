#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use expenses_contracts::auth::{
    ContextTag, CredentialRecord, NewAccount, SubjectId, SubjectProfile, TokenCheck, TokenRecord,
    TokenValue,
};
use expenses_contracts::ingest::IngestionFailureKind;
use expenses_contracts::{ContractViolation, ReasonCodeId, Validate};
use expenses_engines::password::{hash_password, verify_against_decoy, verify_password};
use expenses_engines::token_mint::mint_token_value;
use expenses_storage::{ExpensesStore, StorageError};

pub mod reason_codes {
    use expenses_contracts::ReasonCodeId;

    pub const AUTH_OK: ReasonCodeId = ReasonCodeId(0x4155_0001);
    pub const AUTH_INVALID_CREDENTIALS: ReasonCodeId = ReasonCodeId(0x4155_0101);
    pub const AUTH_TOKEN_INVALID_OR_EXPIRED: ReasonCodeId = ReasonCodeId(0x4155_0102);
    pub const AUTH_USERNAME_TAKEN: ReasonCodeId = ReasonCodeId(0x4155_0103);
    pub const AUTH_INVALID_ARGUMENT: ReasonCodeId = ReasonCodeId(0x4155_0104);
    pub const AUTH_UNKNOWN_SUBJECT: ReasonCodeId = ReasonCodeId(0x4155_0105);
    pub const AUTH_INTERNAL: ReasonCodeId = ReasonCodeId(0x4155_01F1);
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("token invalid or expired")]
    TokenInvalidOrExpired,
    #[error("username already taken")]
    UsernameTaken,
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] ContractViolation),
    #[error("unknown subject")]
    UnknownSubject,
    #[error("store error: {0}")]
    Store(StorageError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            Self::InvalidCredentials => reason_codes::AUTH_INVALID_CREDENTIALS,
            Self::TokenInvalidOrExpired => reason_codes::AUTH_TOKEN_INVALID_OR_EXPIRED,
            Self::UsernameTaken => reason_codes::AUTH_USERNAME_TAKEN,
            Self::InvalidArgument(_) => reason_codes::AUTH_INVALID_ARGUMENT,
            Self::UnknownSubject => reason_codes::AUTH_UNKNOWN_SUBJECT,
            Self::Store(_) | Self::Internal(_) => reason_codes::AUTH_INTERNAL,
        }
    }

    /// Gate failures fail closed: anything other than bad credentials rejects the token.
    pub fn failure_kind(&self) -> IngestionFailureKind {
        match self {
            Self::InvalidCredentials => IngestionFailureKind::InvalidCredentials,
            _ => IngestionFailureKind::TokenInvalidOrExpired,
        }
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ContractViolation(v) => Self::InvalidArgument(v),
            other => Self::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileLookup {
    BySubject(SubjectId),
    ByUsername(String),
}

/// A freshly issued token together with the profile it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedSession {
    pub profile: SubjectProfile,
    pub token: TokenRecord,
}

/// Credential checks and token lifecycle over the shared store.
#[derive(Clone)]
pub struct Authorizer {
    store: Arc<dyn ExpensesStore>,
}

impl std::fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorizer").finish_non_exhaustive()
    }
}

impl Authorizer {
    pub fn new(store: Arc<dyn ExpensesStore>) -> Self {
        Self { store }
    }

    pub async fn create_account(&self, account: NewAccount) -> Result<IssuedSession, AuthError> {
        account.validate()?;
        if self
            .store
            .credential_row_by_username(&account.username)
            .await?
            .is_some()
        {
            return Err(AuthError::UsernameTaken);
        }

        let password = account.password.clone();
        let password_hash = blocking(move || hash_password(&password))
            .await?
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        let record = CredentialRecord {
            subject_id: SubjectId::generate(),
            username: account.username,
            email: account.email,
            first_name: account.first_name,
            last_name: account.last_name,
            password_hash,
        };
        match self.store.insert_credential_row(record.clone()).await {
            Ok(()) => {}
            Err(StorageError::DuplicateKey { .. }) => return Err(AuthError::UsernameTaken),
            Err(err) => return Err(err.into()),
        }
        tracing::info!(subject_id = %record.subject_id, "account created");

        let token = self
            .issue_token(record.subject_id, ContextTag::user_auth())
            .await?;
        Ok(IssuedSession {
            profile: SubjectProfile::from(&record),
            token,
        })
    }

    pub async fn issue_token(
        &self,
        subject_id: SubjectId,
        context_tag: ContextTag,
    ) -> Result<TokenRecord, AuthError> {
        self.issue_token_at(subject_id, context_tag, Utc::now()).await
    }

    /// Supersedes any token held for `(subject_id, context_tag)`.
    pub async fn issue_token_at(
        &self,
        subject_id: SubjectId,
        context_tag: ContextTag,
        now: DateTime<Utc>,
    ) -> Result<TokenRecord, AuthError> {
        let record = TokenRecord::v1(subject_id, mint_token_value()?, context_tag, now);
        self.store.replace_token_row(record.clone()).await?;
        tracing::debug!(
            subject_id = %subject_id,
            context = record.context_tag.as_str(),
            expires_at = %record.expires_at,
            "token issued"
        );
        Ok(record)
    }

    pub async fn validate(&self, token: &TokenValue) -> Result<TokenCheck, AuthError> {
        self.validate_at(token, Utc::now()).await
    }

    /// An expired token is reported invalid and deleted on the spot.
    pub async fn validate_at(
        &self,
        token: &TokenValue,
        now: DateTime<Utc>,
    ) -> Result<TokenCheck, AuthError> {
        let Some(record) = self.store.token_row_by_value(token).await? else {
            return Ok(TokenCheck::invalid());
        };
        if !record.is_live_at(now) {
            let removed = self.store.delete_token_row(token).await?;
            tracing::info!(
                subject_id = %record.subject_id,
                expired_at = %record.expires_at,
                removed,
                "expired token rejected"
            );
            return Ok(TokenCheck::invalid());
        }
        Ok(TokenCheck::valid(record.subject_id))
    }

    /// Unknown usernames and wrong passwords fail identically, and both pay for one
    /// hash verification.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<CredentialRecord, AuthError> {
        let found = self.store.credential_row_by_username(username).await?;
        let candidate = password.to_string();
        match found {
            Some(record) => {
                let stored = record.password_hash.clone();
                if blocking(move || verify_password(&stored, &candidate)).await? {
                    Ok(record)
                } else {
                    tracing::info!("authentication rejected");
                    Err(AuthError::InvalidCredentials)
                }
            }
            None => {
                blocking(move || verify_against_decoy(&candidate)).await?;
                tracing::info!("authentication rejected");
                Err(AuthError::InvalidCredentials)
            }
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<IssuedSession, AuthError> {
        let record = self.authenticate(username, password).await?;
        let token = self
            .issue_token(record.subject_id, ContextTag::user_auth())
            .await?;
        Ok(IssuedSession {
            profile: SubjectProfile::from(&record),
            token,
        })
    }

    /// Profile only. Never issues a token.
    pub async fn lookup_profile(&self, lookup: &ProfileLookup) -> Result<SubjectProfile, AuthError> {
        let found = match lookup {
            ProfileLookup::BySubject(id) => self.store.credential_row_by_subject(id).await?,
            ProfileLookup::ByUsername(name) => {
                self.store.credential_row_by_username(name).await?
            }
        };
        found
            .as_ref()
            .map(SubjectProfile::from)
            .ok_or(AuthError::UnknownSubject)
    }

    /// Gate for inbound requests. Accepts `Bearer <token>` or a bare token. A store
    /// error while checking rejects the request.
    pub async fn authorize_bearer(&self, header: Option<&str>) -> Result<SubjectId, AuthError> {
        let raw = header.ok_or(AuthError::TokenInvalidOrExpired)?;
        let token = TokenValue::from_authorization_header(raw)
            .map_err(|_| AuthError::TokenInvalidOrExpired)?;
        match self.validate(&token).await {
            Ok(TokenCheck {
                subject_id: Some(subject_id),
                valid: true,
            }) => Ok(subject_id),
            Ok(_) => Err(AuthError::TokenInvalidOrExpired),
            Err(err) => {
                tracing::error!(error = %err, "token check failed, rejecting request");
                Err(AuthError::TokenInvalidOrExpired)
            }
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, AuthError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))
}
