//! Bearer-token identity verification.
//!
//! Tokens are self-describing and signed:
//!
//! ```text
//! base64url(user_id) . expiry_unix_secs . hex(sha256(secret ∥ user_id ∥ expiry))
//! ```
//!
//! [`TokenVerifier::verify`] checks shape, signature, and expiry, then
//! resolves the user against the store. Verification happens before the
//! websocket upgrade; a refused credential creates no server state.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::error::AuthError;
use crate::protocol::UserIdentity;
use crate::store::Store;
use crate::util::now_secs;

/// Claims carried by a structurally valid token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub user_id: String,
    pub expires_at: u64,
}

pub struct TokenVerifier {
    secret: String,
}

impl TokenVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Mint a token for `user_id` valid for `ttl_secs` from now.
    pub fn issue(&self, user_id: &str, ttl_secs: u64) -> String {
        let expires_at = now_secs().saturating_add(ttl_secs);
        let sig = self.signature(user_id, expires_at);
        format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(user_id.as_bytes()),
            expires_at,
            sig
        )
    }

    /// Validate shape, signature, and expiry without touching the store.
    pub fn decode(&self, credential: &str) -> Result<TokenClaims, AuthError> {
        let mut parts = credential.split('.');
        let (id_part, expiry_part, sig_part) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(a), Some(b), Some(c), None) => (a, b, c),
                _ => return Err(AuthError::Malformed),
            };

        let user_id_bytes = URL_SAFE_NO_PAD
            .decode(id_part)
            .map_err(|_| AuthError::Malformed)?;
        let user_id = String::from_utf8(user_id_bytes).map_err(|_| AuthError::Malformed)?;
        let expires_at: u64 = expiry_part.parse().map_err(|_| AuthError::Malformed)?;

        if !constant_time_eq(self.signature(&user_id, expires_at).as_bytes(), sig_part.as_bytes()) {
            return Err(AuthError::Malformed);
        }
        if expires_at <= now_secs() {
            return Err(AuthError::Expired);
        }

        Ok(TokenClaims {
            user_id,
            expires_at,
        })
    }

    /// Full verification: token checks plus user resolution.
    pub fn verify(&self, credential: &str, store: &Store) -> Result<UserIdentity, AuthError> {
        let claims = self.decode(credential)?;
        let user = store
            .get_user(&claims.user_id)
            .ok()
            .flatten()
            .ok_or_else(|| AuthError::UnknownUser(claims.user_id.clone()))?;
        Ok(UserIdentity {
            user_id: user.user_id,
            username: user.username,
            avatar: user.avatar,
        })
    }

    fn signature(&self, user_id: &str, expires_at: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(user_id.as_bytes());
        hasher.update(expires_at.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
