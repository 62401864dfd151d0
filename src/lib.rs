//! Amigo Invisible
//!
//! Secret Santa groups and their one-time draw. The draw engine lives in
//! [`app_core`]; persistence lives in [`storage`].

#![warn(missing_docs)]

pub use app_core;
pub use storage;
