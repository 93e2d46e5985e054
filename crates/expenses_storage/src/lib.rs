#![forbid(unsafe_code)]

pub mod memory;
pub mod postgres;
pub mod repo;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use repo::{CredentialRepo, ExpenseRepo, ExpensesStore, StorageError, TokenRepo};
