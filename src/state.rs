use crate::middleware::{SignatureVerifier, TokenVerifier};
use crate::services::ChatServices;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub services: ChatServices,
    pub tokens: Arc<TokenVerifier>,
    pub signature: Arc<SignatureVerifier>,
}
