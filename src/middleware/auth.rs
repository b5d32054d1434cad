use crate::error::{AppError, AppResult};
use actix_web::{http::header::AUTHORIZATION, web, HttpRequest};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Authenticated user id.
    pub uid: String,
    pub exp: usize,
}

/// HS256 verifier for bearer tokens issued by the auth service.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> AppResult<Claims> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "token rejected");
            AppError::Unauthorized("invalid token".into())
        })?;
        if data.claims.uid.is_empty() {
            return Err(AppError::Unauthorized("token has no user id".into()));
        }
        Ok(data.claims)
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Bearer header first, then `?token=` (browsers cannot set headers on upgrade requests).
pub fn extract_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            web::Query::<TokenQuery>::from_query(req.query_string())
                .ok()
                .and_then(|q| q.into_inner().token)
                .filter(|s| !s.is_empty())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, uid: &str, exp_offset: i64) -> String {
        let exp = (chrono::Utc::now().timestamp() + exp_offset) as usize;
        encode(
            &Header::new(Algorithm::HS256),
            &Claims {
                uid: uid.into(),
                exp,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn accepts_valid_token() {
        let verifier = TokenVerifier::new("s3cret");
        let claims = verifier.verify(&token("s3cret", "alice", 600)).unwrap();
        assert_eq!(claims.uid, "alice");
    }

    #[test]
    fn rejects_wrong_secret_and_expired() {
        let verifier = TokenVerifier::new("s3cret");
        assert!(verifier.verify(&token("other", "alice", 600)).is_err());
        assert!(verifier.verify(&token("s3cret", "alice", -600)).is_err());
    }

    #[test]
    fn header_takes_precedence_over_query() {
        let req = TestRequest::default()
            .uri("/v1/chat/ws/c1?token=from-query")
            .insert_header((AUTHORIZATION, "Bearer from-header"))
            .to_http_request();
        assert_eq!(extract_token(&req).as_deref(), Some("from-header"));

        let req = TestRequest::default()
            .uri("/v1/chat/ws/c1?token=from-query")
            .to_http_request();
        assert_eq!(extract_token(&req).as_deref(), Some("from-query"));

        let req = TestRequest::default().uri("/v1/chat/ws/c1").to_http_request();
        assert!(extract_token(&req).is_none());
    }
}
