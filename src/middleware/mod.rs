pub mod auth;
pub mod error_handling;
pub mod signature;

pub use auth::{extract_token, Claims, TokenVerifier};
pub use signature::{SignatureVerifier, SIGNATURE_HEADER};
