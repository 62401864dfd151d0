//! Storage layer for Amigo Invisible
//!
//! This crate provides the SQLite database handle, schema migrations, and
//! the group/participant/assignment store the draw engine runs against.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod database;
pub mod groups;

pub use database::{DatabaseConfig, DatabaseError, MigrationDefinition, SqliteDatabase, SynchronousMode};
pub use groups::{AssignmentPair, AssignmentRow, GroupRecord, GroupStore, GroupSummary, ParticipantRow};
