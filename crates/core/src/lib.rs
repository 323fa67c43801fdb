//! `tidecrm-core`: identifiers and error model shared by every tidecrm crate.
//!
//! This crate has no infrastructure concerns (no IO, no async).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, JobLogId, WorkspaceId};
