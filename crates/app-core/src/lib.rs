//! Core application logic for Amigo Invisible
//!
//! This crate contains the Secret Santa draw engine (restriction handling,
//! assignment generation, draw orchestration) and group membership rules.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assignment;
pub mod draw;
pub mod groups;
pub mod restrictions;

pub use assignment::{Assignment, GenerateError, DEFAULT_MAX_ATTEMPTS};
pub use draw::{DrawConfig, DrawError, DrawReport, DrawService, DrawStatus, DrawStore, StoreError};
pub use groups::{AssignmentView, GroupError, GroupService};
pub use restrictions::{ParticipantRecord, RestrictionMap};
