//! Credential token verification
//!
//! The server never issues tokens; it only checks HS256-signed JWTs minted
//! by the authentication service and extracts the peer identity from them.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::util::time::unix_secs;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by an auth token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (username)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: u64,
    /// Granted roles
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Verified peer identity attached to a connection
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub roles: Vec<String>,
    pub expiry: u64,
}

impl Credential {
    fn from_claims(claims: TokenClaims) -> Self {
        Self {
            username: claims.sub,
            roles: claims.roles,
            expiry: claims.exp,
        }
    }
}

/// Verify a token signature and validity window, returning the credential.
///
/// `not_before` is an issue-time floor: tokens minted before it are
/// rejected even when their signature checks out, so a key rotation can
/// invalidate everything already in the wild.
pub fn verify(token: &str, secret: &str, not_before: u64) -> Result<Credential, AuthError> {
    let claims = decode_verified(token, secret)?;

    let now = unix_secs();
    if claims.exp < now {
        return Err(AuthError::TokenExpired);
    }
    if claims.iat < not_before {
        return Err(AuthError::TokenRevoked);
    }

    Ok(Credential::from_claims(claims))
}

/// Verify the HMAC-SHA256 signature and decode the payload
fn decode_verified(token: &str, secret: &str) -> Result<TokenClaims, AuthError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(AuthError::InvalidToken);
    }

    let header_b64 = parts[0];
    let payload_b64 = parts[1];
    let signature_b64 = parts[2];

    let message = format!("{}.{}", header_b64, payload_b64);

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidToken)?;
    mac.update(message.as_bytes());

    let expected_signature = mac.finalize().into_bytes();
    let provided_signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| AuthError::InvalidToken)?;

    if expected_signature.as_slice() != provided_signature.as_slice() {
        return Err(AuthError::InvalidToken);
    }

    let payload_json = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AuthError::InvalidToken)?;

    serde_json::from_slice(&payload_json).map_err(|_| AuthError::InvalidToken)
}

/// Authentication error types
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token issued before rotation floor")]
    TokenRevoked,
}

#[cfg(test)]
pub(crate) fn sign_for_tests(claims: &TokenClaims, secret: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    let message = format!("{}.{}", header, payload);

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(message.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    format!("{}.{}", message, signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(iat: u64, exp: u64) -> TokenClaims {
        TokenClaims {
            sub: "alice".into(),
            exp,
            iat,
            roles: vec!["player".into()],
        }
    }

    #[test]
    fn valid_token_yields_credential() {
        let token = sign_for_tests(&claims(unix_secs(), unix_secs() + 3600), "s3cret");
        let cred = verify(&token, "s3cret", 0).unwrap();
        assert_eq!(cred.username, "alice");
        assert_eq!(cred.roles, vec!["player".to_string()]);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = sign_for_tests(&claims(unix_secs(), unix_secs() + 3600), "s3cret");
        assert!(matches!(
            verify(&token, "other", 0),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = sign_for_tests(&claims(unix_secs() - 7200, unix_secs() - 3600), "s3cret");
        assert!(matches!(
            verify(&token, "s3cret", 0),
            Err(AuthError::TokenExpired)
        ));
    }

    #[test]
    fn token_issued_before_rotation_floor_is_rejected() {
        let now = unix_secs();
        let token = sign_for_tests(&claims(now - 100, now + 3600), "s3cret");
        assert!(matches!(
            verify(&token, "s3cret", now - 10),
            Err(AuthError::TokenRevoked)
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(verify("not-a-token", "s3cret", 0).is_err());
        assert!(verify("a.b.c", "s3cret", 0).is_err());
    }
}
