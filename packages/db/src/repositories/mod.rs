//! Repository implementations for database operations.

mod ledger_repo;

pub use ledger_repo::LedgerRepository;
