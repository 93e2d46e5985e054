#![forbid(unsafe_code)]

use std::fmt;

use crate::receipt::{ExpenseRowId, ExtractedTransaction};

/// Error taxonomy shared by the pipeline and the adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngestionFailureKind {
    InvalidCredentials,
    TokenInvalidOrExpired,
    TransferInterrupted,
    EmptyPayload,
    ExtractionUnavailable,
    ExtractionEmpty,
    MalformedExtraction,
    PersistenceFailed,
    ConfigurationMissing,
    DeadlineExceeded,
}

impl IngestionFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::TokenInvalidOrExpired => "TOKEN_INVALID_OR_EXPIRED",
            Self::TransferInterrupted => "TRANSFER_INTERRUPTED",
            Self::EmptyPayload => "EMPTY_PAYLOAD",
            Self::ExtractionUnavailable => "EXTRACTION_UNAVAILABLE",
            Self::ExtractionEmpty => "EXTRACTION_EMPTY",
            Self::MalformedExtraction => "MALFORMED_EXTRACTION",
            Self::PersistenceFailed => "PERSISTENCE_FAILED",
            Self::ConfigurationMissing => "CONFIGURATION_MISSING",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
        }
    }

    /// Kinds that still let the caller receive the extraction text.
    pub fn is_response_tolerant(&self) -> bool {
        matches!(self, Self::MalformedExtraction | Self::PersistenceFailed)
    }
}

impl fmt::Display for IngestionFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionStage {
    Authorizing,
    Receiving,
    Extracting,
    Normalizing,
    Persisting,
    Completed,
    Failed(IngestionFailureKind),
}

impl IngestionStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    /// Forward edges of the pipeline. `Failed` is reachable from every non-terminal stage.
    pub fn can_transition_to(&self, next: IngestionStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Self::Failed(_)) {
            return true;
        }
        matches!(
            (self, next),
            (Self::Authorizing, Self::Receiving)
                | (Self::Receiving, Self::Extracting)
                | (Self::Extracting, Self::Normalizing)
                | (Self::Normalizing, Self::Persisting)
                | (Self::Normalizing, Self::Completed)
                | (Self::Persisting, Self::Completed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    Parsed(ExtractedTransaction),
    Malformed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceStatus {
    Committed(ExpenseRowId),
    Failed { reason: String },
    /// Parsing failed, so no write was attempted.
    Skipped,
}
