use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Upstash-Signature";

/// Verifies flush callbacks signed with the current or next signing key.
#[derive(Debug, Clone, Default)]
pub struct SignatureVerifier {
    keys: Vec<String>,
}

impl SignatureVerifier {
    pub fn new(current: Option<String>, next: Option<String>) -> Self {
        Self {
            keys: current.into_iter().chain(next).collect(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.keys.is_empty()
    }

    /// `signature` is base64(HMAC-SHA256(body, key)). Compared in constant time.
    pub fn verify(&self, signature: &str, body: &[u8]) -> bool {
        let signature = signature.trim();
        let Ok(expected) = STANDARD
            .decode(signature)
            .or_else(|_| URL_SAFE_NO_PAD.decode(signature))
        else {
            return false;
        };

        self.keys.iter().any(|key| {
            let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
                return false;
            };
            mac.update(body);
            mac.verify_slice(&expected).is_ok()
        })
    }
}

pub fn sign(key: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"chatId":"c1","flushToken":"t1"}"#;

    #[test]
    fn accepts_current_and_next_keys() {
        let verifier = SignatureVerifier::new(Some("current".into()), Some("next".into()));
        assert!(verifier.verify(&sign("current", BODY), BODY));
        assert!(verifier.verify(&sign("next", BODY), BODY));
        assert!(!verifier.verify(&sign("retired", BODY), BODY));
    }

    #[test]
    fn rejects_tampered_body_and_garbage() {
        let verifier = SignatureVerifier::new(Some("current".into()), None);
        let signature = sign("current", BODY);
        assert!(!verifier.verify(&signature, br#"{"chatId":"c2","flushToken":"t1"}"#));
        assert!(!verifier.verify("not base64 !!", BODY));
    }

    #[test]
    fn unconfigured_verifier_rejects_everything() {
        let verifier = SignatureVerifier::new(None, None);
        assert!(!verifier.is_configured());
        assert!(!verifier.verify(&sign("any", BODY), BODY));
    }
}
