#![forbid(unsafe_code)]

pub mod authorizer;
pub mod ingest;
pub mod persistence;

pub use authorizer::{AuthError, Authorizer, IssuedSession, ProfileLookup};
pub use ingest::{IngestionConfig, IngestionFailure, IngestionOrchestrator, IngestionOutcome};
pub use persistence::{PersistenceError, PersistenceWriter};
