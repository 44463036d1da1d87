//! Conversation session management.
//!
//! - `model`: messages, sessions, token statistics
//! - `store`: durable (optionally encrypted) session records
//! - `budget`: context budget decisions and summarization splits

pub mod budget;
pub mod model;
pub mod store;
