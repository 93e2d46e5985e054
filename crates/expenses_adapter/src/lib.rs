#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use expenses_contracts::auth::{NewAccount, SubjectId, TokenValue};
use expenses_contracts::ingest::{IngestionFailureKind, PersistenceStatus};
use expenses_contracts::{ContractViolation, ReasonCodeId};
use expenses_engines::chunk::{ChunkSource, TransferError};
use expenses_engines::extraction::{
    ExtractionClient, GeminiConfig, GeminiExtractionClient, DEFAULT_GEMINI_ENDPOINT,
    DEFAULT_GEMINI_MODEL,
};
use expenses_os::{
    AuthError, Authorizer, IngestionConfig, IngestionFailure, IngestionOrchestrator,
    IngestionOutcome, IssuedSession, PersistenceWriter, ProfileLookup,
};
use expenses_storage::{ExpensesStore, MemoryStore, PgStore, StorageError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub mod grpc_api {
    tonic::include_proto!("expenses.v1");
}

pub mod reason_codes {
    use expenses_contracts::ReasonCodeId;

    pub const ADAPTER_CONFIGURATION_MISSING: ReasonCodeId = ReasonCodeId(0xAD70_0001);
    pub const ADAPTER_INVALID_REQUEST: ReasonCodeId = ReasonCodeId(0xAD70_0002);
}

/// Largest receipt either transport accepts.
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
/// Upload limit for `POST /create-expense`.
pub const HTTP_BODY_LIMIT_BYTES: usize = MAX_UPLOAD_BYTES;
/// Per-message limit for the gRPC transport; chunks are normally 64 KiB.
pub const GRPC_MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration missing: {0}")]
    ConfigurationMissing(&'static str),
    #[error("invalid configuration {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub fn failure_kind(&self) -> IngestionFailureKind {
        IngestionFailureKind::ConfigurationMissing
    }

    pub fn reason_code(&self) -> ReasonCodeId {
        reason_codes::ADAPTER_CONFIGURATION_MISSING
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub gemini_endpoint: String,
    pub grpc_bind: String,
    pub http_bind: String,
    pub request_timeout_ms: u64,
}

impl std::fmt::Debug for AdapterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterConfig")
            .field("store_backend", &self.store_backend)
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("db_max_connections", &self.db_max_connections)
            .field("gemini_model", &self.gemini_model)
            .field("gemini_endpoint", &self.gemini_endpoint)
            .field("grpc_bind", &self.grpc_bind)
            .field("http_bind", &self.http_bind)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish_non_exhaustive()
    }
}

impl AdapterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    pub fn from_env_var_map<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let store_backend = match non_empty("EXPENSES_STORE")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("postgres") | Some("pg") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "EXPENSES_STORE",
                    reason: format!("unknown backend '{other}'"),
                })
            }
        };
        let database_url = non_empty("EXPENSES_DATABASE_URL");
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::ConfigurationMissing("EXPENSES_DATABASE_URL"));
        }
        let gemini_api_key = non_empty("EXPENSES_GEMINI_API_KEY")
            .ok_or(ConfigError::ConfigurationMissing("EXPENSES_GEMINI_API_KEY"))?;

        Ok(Self {
            store_backend,
            database_url,
            db_max_connections: non_empty("EXPENSES_DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse::<u32>().ok())
                .map(|v| v.clamp(1, 100))
                .unwrap_or(10),
            gemini_api_key,
            gemini_model: non_empty("EXPENSES_GEMINI_MODEL")
                .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            gemini_endpoint: non_empty("EXPENSES_GEMINI_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_GEMINI_ENDPOINT.to_string()),
            grpc_bind: non_empty("EXPENSES_GRPC_BIND")
                .unwrap_or_else(|| "127.0.0.1:50051".to_string()),
            http_bind: non_empty("EXPENSES_HTTP_BIND")
                .unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            request_timeout_ms: non_empty("EXPENSES_REQUEST_TIMEOUT_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(|v| v.clamp(1_000, 600_000))
                .unwrap_or(60_000),
        })
    }

    pub fn gemini_config(&self) -> GeminiConfig {
        let mut config = GeminiConfig::mvp_v1(self.gemini_api_key.clone());
        config.endpoint = self.gemini_endpoint.clone();
        config.model = self.gemini_model.clone();
        config.timeout_ms = u32::try_from(self.request_timeout_ms).unwrap_or(u32::MAX);
        config
    }

    pub fn ingestion_config(&self) -> IngestionConfig {
        IngestionConfig::with_timeout(Duration::from_millis(self.request_timeout_ms))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterStartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("store startup failed: {0}")]
    Store(#[from] StorageError),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

/// Installs the global subscriber: `RUST_LOG` filter (default `info`) plus fmt output.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A second call (tests, embedded use) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Deserialize)]
pub struct GetUserAdapterRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CreateUserAdapterResponse {
    pub message: String,
    pub user_id: String,
    pub auth_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct UserAdapterResponse {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CheckAuthTokenAdapterResponse {
    pub is_valid: bool,
    pub user_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CreateExpenseAdapterResponse {
    pub status: String,
    /// Normalized extraction text.
    pub response: String,
    pub persisted: bool,
    pub expense_id: Option<String>,
    pub reason_code: u32,
}

impl From<IngestionOutcome> for CreateExpenseAdapterResponse {
    fn from(outcome: IngestionOutcome) -> Self {
        let reason_code = outcome.reason_code().0;
        let expense_id = match &outcome.persistence {
            PersistenceStatus::Committed(row_id) => Some(row_id.to_string()),
            _ => None,
        };
        Self {
            status: "ok".to_string(),
            response: outcome.response_text,
            persisted: expense_id.is_some(),
            expense_id,
            reason_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AdapterErrorResponse {
    pub status: String,
    pub outcome: String,
    pub reason: String,
    pub reason_code: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub store: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Ingestion(#[from] IngestionFailure),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl AdapterError {
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Auth(AuthError::InvalidCredentials) => "INVALID_CREDENTIALS",
            Self::Auth(AuthError::TokenInvalidOrExpired) => "TOKEN_INVALID_OR_EXPIRED",
            Self::Auth(AuthError::UsernameTaken) => "USERNAME_TAKEN",
            Self::Auth(AuthError::InvalidArgument(_)) | Self::InvalidRequest(_) => {
                "INVALID_ARGUMENT"
            }
            Self::Auth(AuthError::UnknownSubject) => "NOT_FOUND",
            Self::Auth(AuthError::Store(_) | AuthError::Internal(_)) => "INTERNAL",
            Self::Ingestion(failure) => failure.kind.as_str(),
        }
    }

    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            Self::Auth(err) => err.reason_code(),
            Self::Ingestion(failure) => failure.reason_code(),
            Self::InvalidRequest(_) => reason_codes::ADAPTER_INVALID_REQUEST,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Auth(AuthError::InvalidCredentials | AuthError::TokenInvalidOrExpired) => {
                StatusCode::UNAUTHORIZED
            }
            Self::Auth(AuthError::UsernameTaken) => StatusCode::CONFLICT,
            Self::Auth(AuthError::InvalidArgument(_)) | Self::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Auth(AuthError::UnknownSubject) => StatusCode::NOT_FOUND,
            Self::Auth(AuthError::Store(_) | AuthError::Internal(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Ingestion(failure) => match failure.kind {
                IngestionFailureKind::InvalidCredentials
                | IngestionFailureKind::TokenInvalidOrExpired => StatusCode::UNAUTHORIZED,
                IngestionFailureKind::TransferInterrupted | IngestionFailureKind::EmptyPayload => {
                    StatusCode::BAD_REQUEST
                }
                IngestionFailureKind::ExtractionUnavailable
                | IngestionFailureKind::ExtractionEmpty => StatusCode::BAD_GATEWAY,
                IngestionFailureKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn grpc_status(&self) -> tonic::Status {
        let message = self.to_string();
        match self {
            Self::Auth(AuthError::InvalidCredentials | AuthError::TokenInvalidOrExpired) => {
                tonic::Status::unauthenticated(message)
            }
            Self::Auth(AuthError::UsernameTaken) => tonic::Status::already_exists(message),
            Self::Auth(AuthError::InvalidArgument(_)) | Self::InvalidRequest(_) => {
                tonic::Status::invalid_argument(message)
            }
            Self::Auth(AuthError::UnknownSubject) => tonic::Status::not_found(message),
            Self::Auth(AuthError::Store(_) | AuthError::Internal(_)) => {
                tonic::Status::internal(message)
            }
            Self::Ingestion(failure) => match failure.kind {
                IngestionFailureKind::InvalidCredentials
                | IngestionFailureKind::TokenInvalidOrExpired => {
                    tonic::Status::unauthenticated(message)
                }
                IngestionFailureKind::TransferInterrupted | IngestionFailureKind::EmptyPayload => {
                    tonic::Status::invalid_argument(message)
                }
                IngestionFailureKind::ExtractionUnavailable
                | IngestionFailureKind::ExtractionEmpty => tonic::Status::unavailable(message),
                IngestionFailureKind::DeadlineExceeded => {
                    tonic::Status::deadline_exceeded(message)
                }
                _ => tonic::Status::internal(message),
            },
        }
    }

    pub fn to_response(&self) -> AdapterErrorResponse {
        AdapterErrorResponse {
            status: "error".to_string(),
            outcome: self.outcome().to_string(),
            reason: self.to_string(),
            reason_code: self.reason_code().0,
        }
    }
}

/// Pulls `CreateExpenseRequest.chunks` off a client stream. The message size limit only
/// bounds each chunk, so the running total is capped here.
pub struct GrpcChunkSource<S> {
    inner: S,
    received: usize,
    limit: usize,
}

impl<S> GrpcChunkSource<S> {
    pub fn new(inner: S) -> Self {
        Self::with_limit(inner, MAX_UPLOAD_BYTES)
    }

    pub fn with_limit(inner: S, limit: usize) -> Self {
        Self {
            inner,
            received: 0,
            limit,
        }
    }
}

#[async_trait]
impl<S> ChunkSource for GrpcChunkSource<S>
where
    S: tokio_stream::Stream<Item = Result<grpc_api::CreateExpenseRequest, tonic::Status>>
        + Unpin
        + Send,
{
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        use tokio_stream::StreamExt;
        match self.inner.next().await {
            Some(Ok(msg)) => {
                self.received = self.received.saturating_add(msg.chunks.len());
                if self.received > self.limit {
                    return Err(TransferError::Interrupted(format!(
                        "upload exceeds {} bytes",
                        self.limit
                    )));
                }
                Ok(Some(msg.chunks))
            }
            Some(Err(status)) => Err(TransferError::Interrupted(status.message().to_string())),
            None => Ok(None),
        }
    }
}

/// Pulls body chunks of one multipart field.
pub struct MultipartFieldSource<'a> {
    field: axum::extract::multipart::Field<'a>,
}

impl<'a> MultipartFieldSource<'a> {
    pub fn new(field: axum::extract::multipart::Field<'a>) -> Self {
        Self { field }
    }
}

#[async_trait]
impl ChunkSource for MultipartFieldSource<'_> {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        match self.field.chunk().await {
            Ok(Some(bytes)) => Ok(Some(bytes.to_vec())),
            Ok(None) => Ok(None),
            Err(err) => Err(TransferError::Interrupted(err.body_text())),
        }
    }
}

/// Everything the transports share: the authorizer and the ingestion pipeline over
/// one store.
#[derive(Debug, Clone)]
pub struct AdapterRuntime {
    authorizer: Authorizer,
    orchestrator: IngestionOrchestrator,
    store_label: &'static str,
}

impl AdapterRuntime {
    pub fn new(
        store: Arc<dyn ExpensesStore>,
        extractor: Arc<dyn ExtractionClient>,
        ingestion: IngestionConfig,
        store_label: &'static str,
    ) -> Result<Self, ContractViolation> {
        let authorizer = Authorizer::new(store.clone());
        let orchestrator = IngestionOrchestrator::new(
            ingestion,
            authorizer.clone(),
            extractor,
            PersistenceWriter::new(store),
        )?;
        Ok(Self {
            authorizer,
            orchestrator,
            store_label,
        })
    }

    pub async fn from_config(config: &AdapterConfig) -> Result<Self, AdapterStartupError> {
        let (store, label): (Arc<dyn ExpensesStore>, &'static str) = match config.store_backend {
            StoreBackend::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .ok_or(ConfigError::ConfigurationMissing("EXPENSES_DATABASE_URL"))?;
                let pg: Arc<dyn ExpensesStore> =
                    Arc::new(PgStore::connect(url, config.db_max_connections).await?);
                (pg, "postgres")
            }
            StoreBackend::Memory => {
                tracing::warn!("running with the in-memory store; data is lost on exit");
                let memory: Arc<dyn ExpensesStore> = Arc::new(MemoryStore::new_in_memory());
                (memory, "memory")
            }
        };
        let extractor = Arc::new(GeminiExtractionClient::new(config.gemini_config()));
        Ok(Self::new(store, extractor, config.ingestion_config(), label)?)
    }

    pub async fn default_from_env() -> Result<Self, AdapterStartupError> {
        let config = AdapterConfig::from_env()?;
        tracing::info!(config = ?config, "adapter configuration loaded");
        Self::from_config(&config).await
    }

    pub fn authorizer(&self) -> &Authorizer {
        &self.authorizer
    }

    pub fn orchestrator(&self) -> &IngestionOrchestrator {
        &self.orchestrator
    }

    pub fn health_report(&self) -> AdapterHealthResponse {
        AdapterHealthResponse {
            status: "ok".to_string(),
            store: self.store_label.to_string(),
        }
    }

    pub async fn create_user(
        &self,
        account: NewAccount,
    ) -> Result<CreateUserAdapterResponse, AdapterError> {
        let IssuedSession { profile, token } = self.authorizer.create_account(account).await?;
        Ok(CreateUserAdapterResponse {
            message: "User created successfully".to_string(),
            user_id: profile.subject_id.to_string(),
            auth_token: token.token_value.as_str().to_string(),
        })
    }

    /// With a password: checks it and issues a fresh token. Without: profile only.
    pub async fn get_user(
        &self,
        req: GetUserAdapterRequest,
    ) -> Result<UserAdapterResponse, AdapterError> {
        let lookup = profile_lookup(req.user_id.as_deref(), req.username.as_deref())?;
        let password = req.password.filter(|p| !p.is_empty());

        let Some(password) = password else {
            let profile = self.authorizer.lookup_profile(&lookup).await?;
            return Ok(UserAdapterResponse {
                user_id: profile.subject_id.to_string(),
                username: profile.username,
                email: profile.email,
                first_name: profile.first_name,
                last_name: profile.last_name,
                auth_token: None,
            });
        };

        let username = match lookup {
            ProfileLookup::ByUsername(username) => username,
            ProfileLookup::BySubject(_) => match self.authorizer.lookup_profile(&lookup).await {
                Ok(profile) => profile.username,
                // Falls through to the decoy path so the failure matches a bad password.
                Err(AuthError::UnknownSubject) => String::new(),
                Err(err) => return Err(err.into()),
            },
        };
        let IssuedSession { profile, token } = self.authorizer.login(&username, &password).await?;
        Ok(UserAdapterResponse {
            user_id: profile.subject_id.to_string(),
            username: profile.username,
            email: profile.email,
            first_name: profile.first_name,
            last_name: profile.last_name,
            auth_token: Some(token.token_value.as_str().to_string()),
        })
    }

    pub async fn check_auth_token(
        &self,
        raw: &str,
    ) -> Result<CheckAuthTokenAdapterResponse, AdapterError> {
        let token = TokenValue::from_authorization_header(raw)
            .map_err(|_| AdapterError::InvalidRequest("auth token is required".to_string()))?;
        let check = self.authorizer.validate(&token).await?;
        Ok(CheckAuthTokenAdapterResponse {
            is_valid: check.valid,
            user_id: check.subject_id.map(|id| id.to_string()),
            message: if check.valid {
                "Auth token is valid".to_string()
            } else {
                "Invalid auth token".to_string()
            },
        })
    }

    pub async fn authorize_bearer(&self, header: Option<&str>) -> Result<SubjectId, AdapterError> {
        Ok(self.authorizer.authorize_bearer(header).await?)
    }

    pub async fn create_expense<S>(
        &self,
        authorization: Option<&str>,
        source: &mut S,
    ) -> Result<CreateExpenseAdapterResponse, AdapterError>
    where
        S: ChunkSource + ?Sized,
    {
        let outcome = self.orchestrator.run(authorization, source).await?;
        Ok(outcome.into())
    }

    pub async fn create_expense_authorized<S>(
        &self,
        subject_id: SubjectId,
        source: &mut S,
    ) -> Result<CreateExpenseAdapterResponse, AdapterError>
    where
        S: ChunkSource + ?Sized,
    {
        let outcome = self.orchestrator.run_authorized(subject_id, source).await?;
        Ok(outcome.into())
    }
}

fn profile_lookup(
    user_id: Option<&str>,
    username: Option<&str>,
) -> Result<ProfileLookup, AdapterError> {
    let user_id = user_id.map(str::trim).filter(|v| !v.is_empty());
    let username = username.map(str::trim).filter(|v| !v.is_empty());
    match (user_id, username) {
        (Some(id), name) => match (SubjectId::parse(id), name) {
            (Ok(subject_id), _) => Ok(ProfileLookup::BySubject(subject_id)),
            (Err(_), Some(name)) => {
                tracing::debug!("user_id is not a UUID; looking up by username");
                Ok(ProfileLookup::ByUsername(name.to_string()))
            }
            (Err(_), None) => Err(AdapterError::InvalidRequest(
                "user_id must be a UUID".to_string(),
            )),
        },
        (None, Some(name)) => Ok(ProfileLookup::ByUsername(name.to_string())),
        (None, None) => Err(AdapterError::InvalidRequest(
            "user_id or username is required".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use expenses_engines::chunk::ScriptedChunkSource;
    use expenses_engines::extraction::{ExtractionError, ExtractionRequest};

    struct FixedExtractor(Result<String, ExtractionError>);

    impl ExtractionClient for FixedExtractor {
        fn extract(&self, _req: &ExtractionRequest<'_>) -> Result<String, ExtractionError> {
            self.0.clone()
        }
    }

    fn runtime_with(reply: Result<&str, ExtractionError>) -> AdapterRuntime {
        AdapterRuntime::new(
            Arc::new(MemoryStore::new_in_memory()),
            Arc::new(FixedExtractor(reply.map(ToString::to_string))),
            IngestionConfig::mvp_v1(),
            "memory",
        )
        .unwrap()
    }

    fn account(username: &str) -> NewAccount {
        NewAccount {
            username: username.to_string(),
            email: String::new(),
            first_name: "Ada".to_string(),
            last_name: String::new(),
            password: "pw".to_string(),
        }
    }

    fn env_map(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn at_adapter_01_missing_required_env_is_configuration_missing() {
        let err = AdapterConfig::from_env_var_map(env_map(&[(
            "EXPENSES_GEMINI_API_KEY",
            "k",
        )]))
        .unwrap_err();
        assert_eq!(err, ConfigError::ConfigurationMissing("EXPENSES_DATABASE_URL"));
        assert_eq!(err.failure_kind(), IngestionFailureKind::ConfigurationMissing);

        let err = AdapterConfig::from_env_var_map(env_map(&[(
            "EXPENSES_DATABASE_URL",
            "postgres://localhost/expenses",
        )]))
        .unwrap_err();
        assert_eq!(err, ConfigError::ConfigurationMissing("EXPENSES_GEMINI_API_KEY"));
    }

    #[test]
    fn at_adapter_02_defaults_and_clamps() {
        let cfg = AdapterConfig::from_env_var_map(env_map(&[
            ("EXPENSES_STORE", "memory"),
            ("EXPENSES_GEMINI_API_KEY", "k"),
            ("EXPENSES_REQUEST_TIMEOUT_MS", "5"),
            ("EXPENSES_DB_MAX_CONNECTIONS", "5000"),
        ]))
        .unwrap();
        assert_eq!(cfg.store_backend, StoreBackend::Memory);
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.request_timeout_ms, 1_000);
        assert_eq!(cfg.db_max_connections, 100);
        assert_eq!(cfg.gemini_model, DEFAULT_GEMINI_MODEL);
        assert_eq!(cfg.grpc_bind, "127.0.0.1:50051");
        assert_eq!(cfg.http_bind, "127.0.0.1:8080");
        assert_eq!(cfg.gemini_config().timeout_ms, 1_000);
        assert!(!format!("{cfg:?}").contains("\"k\""));
    }

    #[test]
    fn at_adapter_03_unknown_store_backend_rejected() {
        let err = AdapterConfig::from_env_var_map(env_map(&[
            ("EXPENSES_STORE", "sqlite"),
            ("EXPENSES_GEMINI_API_KEY", "k"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "EXPENSES_STORE", .. }));
    }

    #[tokio::test]
    async fn at_adapter_04_get_user_without_password_issues_no_token() {
        let rt = runtime_with(Ok("{}"));
        let created = rt.create_user(account("ada")).await.unwrap();

        let out = rt
            .get_user(GetUserAdapterRequest {
                username: Some("ada".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(out.user_id, created.user_id);
        assert_eq!(out.auth_token, None);

        let check = rt.check_auth_token(&created.auth_token).await.unwrap();
        assert!(check.is_valid);
    }

    #[tokio::test]
    async fn at_adapter_05_get_user_with_password_rotates_token() {
        let rt = runtime_with(Ok("{}"));
        let created = rt.create_user(account("grace")).await.unwrap();

        let out = rt
            .get_user(GetUserAdapterRequest {
                user_id: Some(created.user_id.clone()),
                password: Some("pw".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let fresh = out.auth_token.unwrap();
        assert_ne!(fresh, created.auth_token);
        assert!(!rt.check_auth_token(&created.auth_token).await.unwrap().is_valid);
        assert!(rt.check_auth_token(&fresh).await.unwrap().is_valid);
    }

    #[tokio::test]
    async fn at_adapter_06_bad_password_and_unknown_id_look_the_same() {
        let rt = runtime_with(Ok("{}"));
        let created = rt.create_user(account("linus")).await.unwrap();

        let wrong = rt
            .get_user(GetUserAdapterRequest {
                user_id: Some(created.user_id),
                password: Some("nope".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        let unknown = rt
            .get_user(GetUserAdapterRequest {
                user_id: Some(SubjectId::generate().to_string()),
                password: Some("pw".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(wrong, unknown);
        assert_eq!(wrong.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(wrong.grpc_status().code(), tonic::Code::Unauthenticated);
    }

    #[tokio::test]
    async fn at_adapter_07_create_expense_maps_outcome_and_failures() {
        let rt = runtime_with(Ok("```json\n{\"total_amount\":\"12.50\",\"currency\":\"USD\"}\n```"));
        let created = rt.create_user(account("ken")).await.unwrap();
        let bearer = format!("Bearer {}", created.auth_token);

        let mut src = ScriptedChunkSource::from_chunks(vec![vec![1, 2, 3]]);
        let out = rt.create_expense(Some(&bearer), &mut src).await.unwrap();
        assert_eq!(out.status, "ok");
        assert!(out.persisted);
        assert!(out.expense_id.is_some());
        assert!(!out.response.contains("```"));

        let mut empty = ScriptedChunkSource::from_chunks(Vec::<Vec<u8>>::new());
        let err = rt.create_expense(Some(&bearer), &mut empty).await.unwrap_err();
        assert_eq!(err.outcome(), "EMPTY_PAYLOAD");
        assert_eq!(err.http_status(), StatusCode::BAD_REQUEST);

        let mut src = ScriptedChunkSource::from_chunks(vec![vec![1]]);
        let err = rt.create_expense(None, &mut src).await.unwrap_err();
        assert_eq!(err.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(src.pulls(), 0);
    }

    #[tokio::test]
    async fn at_adapter_08_extraction_failure_maps_to_gateway_codes() {
        let rt = runtime_with(Err(ExtractionError::Unavailable {
            kind: "http_non_200",
            http_status: Some(500),
        }));
        let created = rt.create_user(account("dennis")).await.unwrap();
        let mut src = ScriptedChunkSource::from_chunks(vec![vec![9; 16]]);
        let err = rt
            .create_expense(Some(&created.auth_token), &mut src)
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.grpc_status().code(), tonic::Code::Unavailable);
        assert_eq!(err.to_response().outcome, "EXTRACTION_UNAVAILABLE");
    }

    #[tokio::test]
    async fn at_adapter_09_grpc_stream_error_is_transfer_interrupted() {
        let rt = runtime_with(Ok("{}"));
        let created = rt.create_user(account("barbara")).await.unwrap();
        let items = vec![
            Ok(grpc_api::CreateExpenseRequest {
                chunks: vec![1, 2],
            }),
            Err(tonic::Status::cancelled("client went away")),
        ];
        let mut src = GrpcChunkSource::new(tokio_stream::iter(items));
        let err = rt
            .create_expense(Some(&created.auth_token), &mut src)
            .await
            .unwrap_err();
        assert_eq!(err.outcome(), "TRANSFER_INTERRUPTED");
        assert_eq!(err.grpc_status().code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn at_adapter_10_get_user_needs_an_identifier() {
        assert!(matches!(
            profile_lookup(None, Some("  ")),
            Err(AdapterError::InvalidRequest(_))
        ));
        assert!(matches!(
            profile_lookup(Some("not-a-uuid"), None),
            Err(AdapterError::InvalidRequest(_))
        ));
        assert_eq!(
            profile_lookup(None, Some("ada")).unwrap(),
            ProfileLookup::ByUsername("ada".to_string())
        );
        assert_eq!(
            profile_lookup(Some("not-a-uuid"), Some("ada")).unwrap(),
            ProfileLookup::ByUsername("ada".to_string())
        );
        let subject = SubjectId::generate();
        assert_eq!(
            profile_lookup(Some(&subject.to_string()), Some("ada")).unwrap(),
            ProfileLookup::BySubject(subject)
        );
    }

    #[tokio::test]
    async fn at_adapter_11_grpc_stream_total_size_is_capped() {
        let rt = runtime_with(Ok("{}"));
        let created = rt.create_user(account("margaret")).await.unwrap();
        let chunk = || -> Result<grpc_api::CreateExpenseRequest, tonic::Status> {
            Ok(grpc_api::CreateExpenseRequest {
                chunks: vec![7; 40],
            })
        };

        let within = tokio_stream::iter(vec![chunk(), chunk()]);
        let mut src = GrpcChunkSource::with_limit(within, 100);
        let out = rt
            .create_expense(Some(&created.auth_token), &mut src)
            .await
            .unwrap();
        assert_eq!(out.status, "ok");

        let endless = tokio_stream::iter(std::iter::repeat_with(chunk));
        let mut src = GrpcChunkSource::with_limit(endless, 100);
        let err = rt
            .create_expense(Some(&created.auth_token), &mut src)
            .await
            .unwrap_err();
        assert_eq!(err.outcome(), "TRANSFER_INTERRUPTED");
        assert!(err.to_string().contains("upload exceeds 100 bytes"));
        assert_eq!(err.http_status(), StatusCode::BAD_REQUEST);
    }
}
