//! Error handling for Vanta operations.
//!
//! This module defines the error types used throughout the engine. All
//! public APIs return `Result<T, EngineError>` for consistent error
//! handling.
//!
//! # Commit-path taxonomy
//!
//! The commit pipeline distinguishes failures by what they guarantee about
//! store state:
//!
//! - [`EngineError::ValidationFailed`] - index preconditions violated before
//!   anything was committed; stores untouched, safe to retry.
//! - [`EngineError::AppendFailed`] - the write-ahead log rejected the
//!   transaction; stores untouched, safe to retry.
//! - [`EngineError::ApplyFailed`] - the log accepted the transaction but the
//!   stores could not apply it. Log and store state may now disagree, so
//!   this escalates to the database health signal and halts further commits
//!   until restart and recovery.
//! - [`EngineError::ConstraintViolation`] - a schema constraint failed while
//!   translating transaction state; no commands were produced.
//! - [`EngineError::Terminated`] - the transaction was cooperatively
//!   cancelled and observed the termination flag at a safe point.
//! - [`EngineError::DatabaseUnavailable`] - the engine is not in a state
//!   where it can issue or commit transactions.

use std::io;
use thiserror::Error;

/// Result type for Vanta operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error during serialization or deserialization of data.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected in the log or a store file.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Index preconditions could not be validated before commit.
    ///
    /// Nothing has been appended or applied; the transaction can be retried.
    #[error("index validation failed: {0}")]
    ValidationFailed(String),

    /// The transaction could not be appended to the write-ahead log.
    ///
    /// Stores are untouched; the transaction can be retried.
    #[error("could not append transaction to the log: {0}")]
    AppendFailed(String),

    /// The transaction was durably logged but could not be applied to the
    /// stores. Log and store state may disagree; the database health signal
    /// has been raised and further commits fail fast until restart.
    #[error("could not apply transaction to the store: {0}")]
    ApplyFailed(String),

    /// A schema constraint was violated while translating transaction state.
    ///
    /// No commands were produced; stores are untouched.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// The transaction was marked for termination and aborted at a safe
    /// point instead of completing.
    #[error("transaction terminated")]
    Terminated,

    /// The engine cannot issue or commit transactions right now.
    #[error("database is unavailable: {0}")]
    DatabaseUnavailable(String),

    /// Requested resource was not found.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Invalid argument or operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
