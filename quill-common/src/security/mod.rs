//! Security primitives: payload encryption and sensitive-text masking.

mod mask;
mod store;

pub use mask::{compile_patterns, mask_text, default_mask_patterns};
pub use store::{
    derive_key, generate_key, key_from_hex, Envelope, SecureStore, ENVELOPE_ALGORITHM,
};
