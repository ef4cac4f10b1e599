//! Core data models for the file relay.
//!
//! A [`file_record::FileRecord`] maps a client-facing identifier to the
//! bucket and key of the stored object. Records map to the `file_records`
//! table via `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod file_record;
