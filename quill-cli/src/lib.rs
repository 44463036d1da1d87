#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_precision_loss,
    clippy::return_self_not_must_use
)]

//! Quill - a streaming terminal chat client for local LLM backends.
//!
//! The conversation core lives here: the [`engine`] orchestrates
//! exchanges, [`backend`] streams model output, [`session`] holds the
//! data model, durable storage, and budget control.

pub mod backend;
pub mod config;
pub mod engine;
pub mod keys;
pub mod repl;
pub mod session;
