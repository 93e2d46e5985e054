#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::validate_len;
use crate::{ContractViolation, Validate};

/// Context tag for tokens minted by account creation and login.
pub const USER_AUTH_CONTEXT: &str = "user_auth";

/// Lifetime of every issued token.
pub const TOKEN_TTL_HOURS: i64 = 24;

pub const USERNAME_MAX_LEN: usize = 64;
pub const PASSWORD_MAX_LEN: usize = 1_024;
const NAME_MAX_LEN: usize = 128;
const EMAIL_MAX_LEN: usize = 254;
const CONTEXT_TAG_MAX_LEN: usize = 64;

/// Stable identifier of an authenticated principal. Time-ordered (UUIDv7) and
/// never reassigned once a credential row exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(Uuid);

impl SubjectId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|_| ContractViolation::InvalidValue {
                field: "subject_id",
                reason: "must be a UUID",
            })
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Partition label for tokens, e.g. `user_auth`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextTag(String);

impl ContextTag {
    pub fn new(tag: impl Into<String>) -> Result<Self, ContractViolation> {
        let tag = tag.into();
        validate_len("context_tag", &tag, 1, CONTEXT_TAG_MAX_LEN)?;
        if !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
        {
            return Err(ContractViolation::InvalidValue {
                field: "context_tag",
                reason: "must be ascii [A-Za-z0-9_.-]",
            });
        }
        Ok(Self(tag))
    }

    pub fn user_auth() -> Self {
        Self(USER_AUTH_CONTEXT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Opaque bearer value. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TokenValue(String);

impl TokenValue {
    pub fn new(value: impl Into<String>) -> Result<Self, ContractViolation> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(ContractViolation::Missing {
                field: "token_value",
            });
        }
        if value.chars().any(char::is_whitespace) {
            return Err(ContractViolation::InvalidValue {
                field: "token_value",
                reason: "must not contain whitespace",
            });
        }
        Ok(Self(value))
    }

    /// Accepts `Bearer <token>` or a bare token, as sent in an `Authorization` header.
    pub fn from_authorization_header(raw: &str) -> Result<Self, ContractViolation> {
        let trimmed = raw.trim();
        let value = match trimmed.split_once(' ') {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
            _ => trimmed,
        };
        Self::new(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TokenValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenValue(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub subject_id: SubjectId,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password_hash: String,
}

impl Validate for CredentialRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_username(&self.username)?;
        validate_len("email", &self.email, 0, EMAIL_MAX_LEN)?;
        validate_len("first_name", &self.first_name, 0, NAME_MAX_LEN)?;
        validate_len("last_name", &self.last_name, 0, NAME_MAX_LEN)?;
        if !self.password_hash.starts_with('$') {
            return Err(ContractViolation::InvalidValue {
                field: "password_hash",
                reason: "must be a PHC-format hash",
            });
        }
        Ok(())
    }
}

/// Account creation input. Carries the clear password only until it is hashed.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct NewAccount {
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub password: String,
}

impl fmt::Debug for NewAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewAccount")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .finish_non_exhaustive()
    }
}

impl Validate for NewAccount {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_username(&self.username)?;
        validate_len("password", &self.password, 1, PASSWORD_MAX_LEN)?;
        validate_len("email", &self.email, 0, EMAIL_MAX_LEN)?;
        if !self.email.is_empty() && !self.email.contains('@') {
            return Err(ContractViolation::InvalidValue {
                field: "email",
                reason: "must contain '@'",
            });
        }
        validate_len("first_name", &self.first_name, 0, NAME_MAX_LEN)?;
        validate_len("last_name", &self.last_name, 0, NAME_MAX_LEN)?;
        Ok(())
    }
}

pub fn validate_username(username: &str) -> Result<(), ContractViolation> {
    validate_len("username", username, 1, USERNAME_MAX_LEN)?;
    if username.chars().any(char::is_whitespace) {
        return Err(ContractViolation::InvalidValue {
            field: "username",
            reason: "must not contain whitespace",
        });
    }
    Ok(())
}

/// Public view of a credential row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectProfile {
    pub subject_id: SubjectId,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

impl From<&CredentialRecord> for SubjectProfile {
    fn from(record: &CredentialRecord) -> Self {
        Self {
            subject_id: record.subject_id,
            username: record.username.clone(),
            email: record.email.clone(),
            first_name: record.first_name.clone(),
            last_name: record.last_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub subject_id: SubjectId,
    pub token_value: TokenValue,
    pub context_tag: ContextTag,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn v1(
        subject_id: SubjectId,
        token_value: TokenValue,
        context_tag: ContextTag,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subject_id,
            token_value,
            context_tag,
            issued_at,
            expires_at: issued_at + Duration::hours(TOKEN_TTL_HOURS),
        }
    }

    /// Expired means invalid: a token is live strictly before `expires_at`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

impl Validate for TokenRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.expires_at <= self.issued_at {
            return Err(ContractViolation::InvalidValue {
                field: "token_record.expires_at",
                reason: "must be after issued_at",
            });
        }
        Ok(())
    }
}

/// Result of a token lookup. Absence and expiry are `valid == false`, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCheck {
    pub subject_id: Option<SubjectId>,
    pub valid: bool,
}

impl TokenCheck {
    pub fn valid(subject_id: SubjectId) -> Self {
        Self {
            subject_id: Some(subject_id),
            valid: true,
        }
    }

    pub fn invalid() -> Self {
        Self {
            subject_id: None,
            valid: false,
        }
    }
}
