//! Core data models for the archive storage service.
//!
//! Catalog records map to database tables via `sqlx::FromRow`; everything
//! crossing the HTTP boundary serializes as JSON via `serde`.

pub mod archive;
pub mod entry;
pub mod patch;
pub mod upload;
