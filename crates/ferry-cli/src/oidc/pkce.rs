//! Per-attempt secrets for the authorization code flow

use aws_lc_rs::digest::{digest, SHA256};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use super::LoginError;

/// Only supported challenge method
pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// Fresh `state`, `nonce`, and PKCE verifier for one login attempt
#[derive(Clone)]
pub struct AttemptSecrets {
    /// Echoed back on the callback; anything else is a stale or forged redirect
    pub state: String,
    /// Must appear in the ID token
    pub nonce: String,
    /// PKCE code verifier, sent only when redeeming the code
    pub code_verifier: String,
}

impl AttemptSecrets {
    /// Draw new values from the system RNG
    pub fn generate() -> Result<Self, LoginError> {
        Ok(Self {
            state: random_string(16)?,
            nonce: random_string(16)?,
            // 48 bytes encode to 64 characters, inside RFC 7636's 43..=128
            code_verifier: random_string(48)?,
        })
    }

    /// `BASE64URL(SHA256(verifier))`
    pub fn code_challenge(&self) -> String {
        code_challenge(&self.code_verifier)
    }
}

impl std::fmt::Debug for AttemptSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptSecrets").finish_non_exhaustive()
    }
}

/// S256 code challenge for `verifier`
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(digest(&SHA256, verifier.as_bytes()).as_ref())
}

fn random_string(len: usize) -> Result<String, LoginError> {
    let mut raw = vec![0u8; len];
    aws_lc_rs::rand::fill(&mut raw)
        .map_err(|_| LoginError::Internal("system random number generator failed".into()))?;
    Ok(URL_SAFE_NO_PAD.encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lengths_and_alphabet() {
        let secrets = AttemptSecrets::generate().unwrap();
        assert_eq!(secrets.state.len(), 22);
        assert_eq!(secrets.nonce.len(), 22);
        assert_eq!(secrets.code_verifier.len(), 64);
        assert!(secrets
            .code_verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn each_attempt_is_unique() {
        let a = AttemptSecrets::generate().unwrap();
        let b = AttemptSecrets::generate().unwrap();
        assert_ne!(a.state, b.state);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.code_verifier, b.code_verifier);
        assert_ne!(a.code_challenge(), b.code_challenge());
    }

    #[test]
    fn challenge_matches_rfc7636_example() {
        // Appendix B of RFC 7636
        assert_eq!(
            code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }
}
