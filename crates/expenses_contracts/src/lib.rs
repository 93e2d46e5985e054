#![forbid(unsafe_code)]

pub mod auth;
pub mod common;
pub mod ingest;
pub mod receipt;

pub use common::{ContractViolation, ReasonCodeId, Validate};
