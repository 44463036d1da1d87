//! Token estimation for context budgeting.
//!
//! True tokenization belongs to the backend; these estimates only have to
//! be deterministic and monotone so budget decisions are reproducible
//! without a live model.

/// Fixed framing overhead charged per message (role markers etc).
pub const MESSAGE_OVERHEAD: usize = 4;

/// Flat estimate charged for an attached image reference.
pub const IMAGE_TOKENS: usize = 256;

/// Estimate token count from text (approximate: chars / 4, rounded up).
///
/// Deterministic and monotone: a prefix of `text` never estimates higher
/// than `text` itself.
pub fn estimate_text(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}
