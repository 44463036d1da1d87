#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate
)]

//! Shared types and utilities for the Quill chat client.

pub mod error;
pub mod logging;
pub mod security;
pub mod tokens;

pub use error::{Error, Result};
