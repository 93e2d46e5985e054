#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use expenses_contracts::auth::SubjectId;
use expenses_contracts::ingest::{
    IngestionFailureKind, IngestionStage, ParseStatus, PersistenceStatus,
};
use expenses_contracts::{ContractViolation, ReasonCodeId};
use expenses_engines::chunk::{ChunkReceiver, ChunkSource, TransferError};
use expenses_engines::extraction::{ExtractionClient, ExtractionError, ExtractionRequest};
use expenses_engines::normalize::normalize_extraction;
use tokio::time::Instant;

use crate::authorizer::Authorizer;
use crate::persistence::PersistenceWriter;

pub mod reason_codes {
    use expenses_contracts::ReasonCodeId;

    pub const INGEST_OK: ReasonCodeId = ReasonCodeId(0x4547_0001);
    pub const INGEST_OK_NOT_PERSISTED: ReasonCodeId = ReasonCodeId(0x4547_0002);
    pub const INGEST_AUTH_REJECTED: ReasonCodeId = ReasonCodeId(0x4547_0101);
    pub const INGEST_TRANSFER_REJECTED: ReasonCodeId = ReasonCodeId(0x4547_0102);
    pub const INGEST_EXTRACTION_FAILED: ReasonCodeId = ReasonCodeId(0x4547_0103);
    pub const INGEST_DEADLINE_EXCEEDED: ReasonCodeId = ReasonCodeId(0x4547_0104);
    pub const INGEST_INTERNAL: ReasonCodeId = ReasonCodeId(0x4547_01F1);
}

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionConfig {
    pub request_timeout: Duration,
}

impl IngestionConfig {
    pub fn mvp_v1() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }

    pub fn with_timeout(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

/// Terminal result of an ingestion that reached `Completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionOutcome {
    pub subject_id: SubjectId,
    pub stages: Vec<IngestionStage>,
    /// Normalized extraction text, returned whatever the parse or write outcome.
    pub response_text: String,
    pub parse: ParseStatus,
    pub persistence: PersistenceStatus,
}

impl IngestionOutcome {
    pub fn reason_code(&self) -> ReasonCodeId {
        match self.persistence {
            PersistenceStatus::Committed(_) => reason_codes::INGEST_OK,
            _ => reason_codes::INGEST_OK_NOT_PERSISTED,
        }
    }

    /// The non-fatal failure this call completed with, if any.
    pub fn tolerated_failure(&self) -> Option<IngestionFailureKind> {
        let kind = match (&self.parse, &self.persistence) {
            (ParseStatus::Malformed { .. }, _) => IngestionFailureKind::MalformedExtraction,
            (_, PersistenceStatus::Failed { .. }) => IngestionFailureKind::PersistenceFailed,
            _ => return None,
        };
        Some(kind).filter(IngestionFailureKind::is_response_tolerant)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("ingestion failed during {stage:?}: {kind} ({detail})")]
pub struct IngestionFailure {
    /// Stage that was running when the failure happened.
    pub stage: IngestionStage,
    pub kind: IngestionFailureKind,
    pub stages: Vec<IngestionStage>,
    pub detail: String,
}

impl IngestionFailure {
    pub fn reason_code(&self) -> ReasonCodeId {
        match self.kind {
            IngestionFailureKind::InvalidCredentials
            | IngestionFailureKind::TokenInvalidOrExpired => reason_codes::INGEST_AUTH_REJECTED,
            IngestionFailureKind::TransferInterrupted | IngestionFailureKind::EmptyPayload => {
                reason_codes::INGEST_TRANSFER_REJECTED
            }
            IngestionFailureKind::ExtractionUnavailable | IngestionFailureKind::ExtractionEmpty => {
                reason_codes::INGEST_EXTRACTION_FAILED
            }
            IngestionFailureKind::DeadlineExceeded => reason_codes::INGEST_DEADLINE_EXCEEDED,
            _ => reason_codes::INGEST_INTERNAL,
        }
    }
}

#[derive(Debug, Default)]
struct StageTrail {
    stages: Vec<IngestionStage>,
}

impl StageTrail {
    fn current(&self) -> IngestionStage {
        self.stages
            .last()
            .copied()
            .unwrap_or(IngestionStage::Authorizing)
    }

    fn enter(&mut self, next: IngestionStage) {
        if let Some(prev) = self.stages.last() {
            debug_assert!(prev.can_transition_to(next), "{prev:?} -> {next:?}");
        }
        tracing::debug!(stage = ?next, "ingestion stage");
        self.stages.push(next);
    }

    fn fail(&mut self, kind: IngestionFailureKind, detail: impl Into<String>) -> IngestionFailure {
        debug_assert!(!kind.is_response_tolerant(), "{kind} must not fail the call");
        let stage = self.current();
        self.enter(IngestionStage::Failed(kind));
        IngestionFailure {
            stage,
            kind,
            stages: self.stages.clone(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Gate<'a> {
    Header(Option<&'a str>),
    /// Bearer already checked by the transport's middleware.
    Authorized(SubjectId),
}

/// Authorize, receive, extract, normalize, persist. Strictly sequential, no retries.
#[derive(Clone)]
pub struct IngestionOrchestrator {
    config: IngestionConfig,
    authorizer: Authorizer,
    receiver: ChunkReceiver,
    extractor: Arc<dyn ExtractionClient>,
    writer: PersistenceWriter,
}

impl std::fmt::Debug for IngestionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IngestionOrchestrator {
    pub fn new(
        config: IngestionConfig,
        authorizer: Authorizer,
        extractor: Arc<dyn ExtractionClient>,
        writer: PersistenceWriter,
    ) -> Result<Self, ContractViolation> {
        if config.request_timeout.is_zero() {
            return Err(ContractViolation::InvalidValue {
                field: "ingestion_config.request_timeout",
                reason: "must be > 0",
            });
        }
        Ok(Self {
            config,
            authorizer,
            receiver: ChunkReceiver,
            extractor,
            writer,
        })
    }

    pub fn config(&self) -> IngestionConfig {
        self.config
    }

    pub fn authorizer(&self) -> &Authorizer {
        &self.authorizer
    }

    /// Runs one ingestion under the request deadline. `authorization` is the raw
    /// header value; no chunk is pulled unless it names a live token.
    pub async fn run<S>(
        &self,
        authorization: Option<&str>,
        source: &mut S,
    ) -> Result<IngestionOutcome, IngestionFailure>
    where
        S: ChunkSource + ?Sized,
    {
        self.run_gated(Gate::Header(authorization), source).await
    }

    /// For callers whose middleware already resolved the bearer to `subject_id`.
    pub async fn run_authorized<S>(
        &self,
        subject_id: SubjectId,
        source: &mut S,
    ) -> Result<IngestionOutcome, IngestionFailure>
    where
        S: ChunkSource + ?Sized,
    {
        self.run_gated(Gate::Authorized(subject_id), source).await
    }

    async fn run_gated<S>(
        &self,
        gate: Gate<'_>,
        source: &mut S,
    ) -> Result<IngestionOutcome, IngestionFailure>
    where
        S: ChunkSource + ?Sized,
    {
        let deadline = Instant::now() + self.config.request_timeout;
        let mut trail = StageTrail::default();
        let result =
            tokio::time::timeout_at(deadline, self.pipeline(deadline, gate, source, &mut trail))
                .await;
        match result {
            Ok(Ok((subject_id, response_text, parse, persistence))) => {
                trail.enter(IngestionStage::Completed);
                let outcome = IngestionOutcome {
                    subject_id,
                    stages: trail.stages,
                    response_text,
                    parse,
                    persistence,
                };
                if let Some(kind) = outcome.tolerated_failure() {
                    tracing::warn!(
                        subject_id = %outcome.subject_id,
                        kind = kind.as_str(),
                        "ingestion completed with a tolerated failure"
                    );
                }
                Ok(outcome)
            }
            Ok(Err(failure)) => Err(failure),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.request_timeout.as_millis() as u64,
                    stage = ?trail.current(),
                    "ingestion deadline exceeded"
                );
                Err(trail.fail(IngestionFailureKind::DeadlineExceeded, "request deadline elapsed"))
            }
        }
    }

    async fn pipeline<S>(
        &self,
        deadline: Instant,
        gate: Gate<'_>,
        source: &mut S,
        trail: &mut StageTrail,
    ) -> Result<(SubjectId, String, ParseStatus, PersistenceStatus), IngestionFailure>
    where
        S: ChunkSource + ?Sized,
    {
        trail.enter(IngestionStage::Authorizing);
        let subject_id = match gate {
            Gate::Authorized(subject_id) => subject_id,
            Gate::Header(authorization) => {
                match self.authorizer.authorize_bearer(authorization).await {
                    Ok(id) => id,
                    Err(err) => {
                        tracing::info!(error = %err, "ingestion rejected at gate");
                        return Err(trail.fail(err.failure_kind(), err.to_string()));
                    }
                }
            }
        };

        trail.enter(IngestionStage::Receiving);
        let image = match self.receiver.receive(source).await {
            Ok(image) => image,
            Err(err) => {
                let kind = match err {
                    TransferError::Interrupted(_) => IngestionFailureKind::TransferInterrupted,
                    TransferError::EmptyPayload => IngestionFailureKind::EmptyPayload,
                };
                return Err(trail.fail(kind, err.to_string()));
            }
        };
        tracing::info!(
            subject_id = %subject_id,
            bytes = image.bytes.len(),
            chunks = image.chunk_count,
            "receipt image received"
        );

        trail.enter(IngestionStage::Extracting);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(trail.fail(
                IngestionFailureKind::DeadlineExceeded,
                "no time left for extraction",
            ));
        }
        let extractor = Arc::clone(&self.extractor);
        let bytes = image.bytes;
        let extracted = tokio::task::spawn_blocking(move || {
            extractor.extract(&ExtractionRequest::receipt(&bytes, remaining))
        })
        .await;
        let raw = match extracted {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => {
                tracing::error!(error = %err, "extraction failed");
                let kind = match err {
                    ExtractionError::Unavailable { .. } => IngestionFailureKind::ExtractionUnavailable,
                    ExtractionError::Empty => IngestionFailureKind::ExtractionEmpty,
                };
                return Err(trail.fail(kind, err.to_string()));
            }
            Err(join_err) => {
                tracing::error!(error = %join_err, "extraction task aborted");
                return Err(trail.fail(
                    IngestionFailureKind::ExtractionUnavailable,
                    join_err.to_string(),
                ));
            }
        };

        trail.enter(IngestionStage::Normalizing);
        let normalized = normalize_extraction(&raw);
        let tx = match normalized.parsed {
            Ok(tx) => tx,
            Err(malformed) => {
                tracing::warn!(
                    subject_id = %subject_id,
                    reason = %malformed.reason,
                    "extraction text is not a transaction, skipping persistence"
                );
                return Ok((
                    subject_id,
                    normalized.text,
                    ParseStatus::Malformed {
                        reason: malformed.reason,
                    },
                    PersistenceStatus::Skipped,
                ));
            }
        };

        trail.enter(IngestionStage::Persisting);
        let persistence = self.writer.persist(subject_id, &tx).await;
        Ok((
            subject_id,
            normalized.text,
            ParseStatus::Parsed(tx),
            persistence,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use expenses_contracts::auth::NewAccount;
    use expenses_engines::chunk::ScriptedChunkSource;
    use expenses_storage::{ExpenseRepo, MemoryStore};
    use rust_decimal::Decimal;

    const FENCED_REPLY: &str = "```json\n{\"total_amount\": 12.50, \"currency\": \"USD\"}\n```";

    struct CountingExtractor {
        calls: AtomicUsize,
        reply: Result<String, ExtractionError>,
        delay: Duration,
    }

    impl CountingExtractor {
        fn replying(reply: Result<&str, ExtractionError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: reply.map(ToString::to_string),
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: Ok(FENCED_REPLY.to_string()),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ExtractionClient for CountingExtractor {
        fn extract(&self, req: &ExtractionRequest<'_>) -> Result<String, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(!req.image.is_empty());
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.reply.clone()
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        extractor: Arc<CountingExtractor>,
        orchestrator: IngestionOrchestrator,
        bearer: String,
    }

    async fn harness(extractor: Arc<CountingExtractor>, timeout: Duration) -> Harness {
        let store = Arc::new(MemoryStore::new_in_memory());
        let authorizer = Authorizer::new(store.clone());
        let session = authorizer
            .create_account(NewAccount {
                username: "uploader".to_string(),
                email: String::new(),
                first_name: String::new(),
                last_name: String::new(),
                password: "pw".to_string(),
            })
            .await
            .unwrap();
        let orchestrator = IngestionOrchestrator::new(
            IngestionConfig::with_timeout(timeout),
            authorizer,
            extractor.clone(),
            PersistenceWriter::new(store.clone()),
        )
        .unwrap();
        Harness {
            store,
            extractor,
            orchestrator,
            bearer: format!("Bearer {}", session.token.token_value.as_str()),
        }
    }

    fn receipt_chunks() -> ScriptedChunkSource {
        ScriptedChunkSource::from_chunks(vec![vec![0xFF, 0xD8], vec![0x01; 64], vec![0xFF, 0xD9]])
    }

    #[tokio::test]
    async fn at_ingest_01_happy_path_persists_and_returns_clean_text() {
        let h = harness(
            CountingExtractor::replying(Ok(FENCED_REPLY)),
            Duration::from_secs(5),
        )
        .await;
        let mut src = receipt_chunks();
        let out = h.orchestrator.run(Some(&h.bearer), &mut src).await.unwrap();

        assert!(!out.response_text.contains("```"));
        let ParseStatus::Parsed(tx) = &out.parse else {
            panic!("expected parsed transaction");
        };
        assert_eq!(tx.total_amount, Some(Decimal::new(125, 1)));
        assert_eq!(tx.currency, "USD");
        let PersistenceStatus::Committed(row_id) = out.persistence else {
            panic!("expected committed row");
        };
        assert!(h.store.expense_row(&row_id).await.unwrap().is_some());
        assert_eq!(
            out.stages,
            vec![
                IngestionStage::Authorizing,
                IngestionStage::Receiving,
                IngestionStage::Extracting,
                IngestionStage::Normalizing,
                IngestionStage::Persisting,
                IngestionStage::Completed,
            ]
        );
        assert_eq!(out.reason_code(), reason_codes::INGEST_OK);
        assert_eq!(out.tolerated_failure(), None);
        assert_eq!(h.extractor.calls(), 1);
    }

    #[tokio::test]
    async fn at_ingest_02_zero_chunks_fails_before_extraction() {
        let h = harness(
            CountingExtractor::replying(Ok(FENCED_REPLY)),
            Duration::from_secs(5),
        )
        .await;
        let mut src = ScriptedChunkSource::from_chunks(Vec::<Vec<u8>>::new());
        let err = h.orchestrator.run(Some(&h.bearer), &mut src).await.unwrap_err();

        assert_eq!(err.kind, IngestionFailureKind::EmptyPayload);
        assert_eq!(err.stage, IngestionStage::Receiving);
        assert_eq!(h.extractor.calls(), 0);
    }

    #[tokio::test]
    async fn at_ingest_03_persistence_failure_still_returns_text() {
        let h = harness(
            CountingExtractor::replying(Ok(FENCED_REPLY)),
            Duration::from_secs(5),
        )
        .await;
        h.store.set_expense_writes_failing(true);
        let mut src = receipt_chunks();
        let out = h.orchestrator.run(Some(&h.bearer), &mut src).await.unwrap();

        assert!(out.response_text.contains("\"currency\": \"USD\""));
        assert!(matches!(out.persistence, PersistenceStatus::Failed { .. }));
        assert_eq!(out.stages.last(), Some(&IngestionStage::Completed));
        assert_eq!(out.reason_code(), reason_codes::INGEST_OK_NOT_PERSISTED);
        assert_eq!(
            out.tolerated_failure(),
            Some(IngestionFailureKind::PersistenceFailed)
        );
        assert_eq!(h.store.expense_row_count(), 0);
    }

    #[tokio::test]
    async fn at_ingest_04_rejected_token_reads_no_bytes() {
        let h = harness(
            CountingExtractor::replying(Ok(FENCED_REPLY)),
            Duration::from_secs(5),
        )
        .await;
        let mut src = receipt_chunks();
        let err = h
            .orchestrator
            .run(Some("Bearer not-a-real-token"), &mut src)
            .await
            .unwrap_err();

        assert_eq!(err.kind, IngestionFailureKind::TokenInvalidOrExpired);
        assert_eq!(err.stage, IngestionStage::Authorizing);
        assert_eq!(src.pulls(), 0);
        assert_eq!(h.extractor.calls(), 0);

        let err = h.orchestrator.run(None, &mut src).await.unwrap_err();
        assert_eq!(err.reason_code(), reason_codes::INGEST_AUTH_REJECTED);
        assert_eq!(src.pulls(), 0);
    }

    #[tokio::test]
    async fn at_ingest_05_malformed_text_skips_persistence() {
        let h = harness(
            CountingExtractor::replying(Ok("Sorry, I cannot read this receipt.")),
            Duration::from_secs(5),
        )
        .await;
        let mut src = receipt_chunks();
        let out = h.orchestrator.run(Some(&h.bearer), &mut src).await.unwrap();

        assert_eq!(out.response_text, "Sorry, I cannot read this receipt.");
        assert!(matches!(out.parse, ParseStatus::Malformed { .. }));
        assert_eq!(out.persistence, PersistenceStatus::Skipped);
        assert_eq!(
            out.tolerated_failure(),
            Some(IngestionFailureKind::MalformedExtraction)
        );
        assert!(!out.stages.contains(&IngestionStage::Persisting));
        assert_eq!(h.store.expense_row_count(), 0);
    }

    #[tokio::test]
    async fn at_ingest_06_extraction_failures_fail_the_call() {
        let h = harness(
            CountingExtractor::replying(Err(ExtractionError::Empty)),
            Duration::from_secs(5),
        )
        .await;
        let mut src = receipt_chunks();
        let err = h.orchestrator.run(Some(&h.bearer), &mut src).await.unwrap_err();
        assert_eq!(err.kind, IngestionFailureKind::ExtractionEmpty);
        assert_eq!(err.stage, IngestionStage::Extracting);

        let h = harness(
            CountingExtractor::replying(Err(ExtractionError::Unavailable {
                kind: "rate_limited",
                http_status: Some(429),
            })),
            Duration::from_secs(5),
        )
        .await;
        let mut src = receipt_chunks();
        let err = h.orchestrator.run(Some(&h.bearer), &mut src).await.unwrap_err();
        assert_eq!(err.kind, IngestionFailureKind::ExtractionUnavailable);
        assert_eq!(err.reason_code(), reason_codes::INGEST_EXTRACTION_FAILED);
        assert_eq!(h.store.expense_row_count(), 0);
    }

    #[tokio::test]
    async fn at_ingest_07_interrupted_transfer_fails_before_extraction() {
        let h = harness(
            CountingExtractor::replying(Ok(FENCED_REPLY)),
            Duration::from_secs(5),
        )
        .await;
        let mut src = ScriptedChunkSource::from_chunks(vec![vec![1, 2, 3]]).then_error("reset");
        let err = h.orchestrator.run(Some(&h.bearer), &mut src).await.unwrap_err();
        assert_eq!(err.kind, IngestionFailureKind::TransferInterrupted);
        assert_eq!(h.extractor.calls(), 0);
    }

    #[tokio::test]
    async fn at_ingest_08_deadline_bounds_the_pipeline() {
        let h = harness(
            CountingExtractor::slow(Duration::from_millis(300)),
            Duration::from_millis(50),
        )
        .await;
        let mut src = receipt_chunks();
        let err = h.orchestrator.run(Some(&h.bearer), &mut src).await.unwrap_err();

        assert_eq!(err.kind, IngestionFailureKind::DeadlineExceeded);
        assert_eq!(err.stage, IngestionStage::Extracting);
        assert_eq!(
            err.stages.last(),
            Some(&IngestionStage::Failed(IngestionFailureKind::DeadlineExceeded))
        );
        assert_eq!(h.store.expense_row_count(), 0);
    }

    #[tokio::test]
    async fn at_ingest_09_pre_authorized_run_skips_token_lookup() {
        let h = harness(
            CountingExtractor::replying(Ok(FENCED_REPLY)),
            Duration::from_secs(5),
        )
        .await;
        let subject_id = h
            .orchestrator
            .authorizer()
            .authorize_bearer(Some(&h.bearer))
            .await
            .unwrap();
        let mut src = receipt_chunks();
        let out = h
            .orchestrator
            .run_authorized(subject_id, &mut src)
            .await
            .unwrap();
        assert_eq!(out.subject_id, subject_id);
        assert_eq!(out.stages.first(), Some(&IngestionStage::Authorizing));
        assert_eq!(h.store.expense_row_count(), 1);
    }

    #[test]
    fn at_ingest_10_zero_timeout_rejected() {
        let store = Arc::new(MemoryStore::new_in_memory());
        let err = IngestionOrchestrator::new(
            IngestionConfig::with_timeout(Duration::ZERO),
            Authorizer::new(store.clone()),
            CountingExtractor::replying(Ok("{}")),
            PersistenceWriter::new(store),
        )
        .unwrap_err();
        assert!(matches!(err, ContractViolation::InvalidValue { .. }));
    }
}
