//! Verification of the signed bearer tokens minted by the learning portal.
//!
//! Wire format: `<payload-b64url>.<hex-sig>` where the signature is
//! HMAC-SHA256 over the base64url payload bytes, rendered as lower-case hex.

use crate::types::plan::PlanTier;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use snafu::{OptionExt, ResultExt, Snafu};
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

/// How long a nonce is remembered for replay rejection.
const REPLAY_WINDOW_SECS: i64 = 5 * 60;

/// Error type returned by token verification.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum AuthError {
    /// The token is not `payload.signature`.
    #[snafu(display("Malformed token: {}", reason))]
    Malformed { reason: String },
    /// The payload is not valid base64url/JSON.
    #[snafu(display("Undecodable token payload: {}", source))]
    Payload { source: serde_json::Error },
    /// The signature does not verify against the shared secret.
    #[snafu(display("Token signature mismatch"))]
    BadSignature,
    /// The token has expired.
    #[snafu(display("Token expired at {}", expires))]
    Expired { expires: i64 },
    /// The nonce was already seen within the replay window.
    #[snafu(display("Token nonce '{}' was already used", nonce))]
    Replayed { nonce: String },
}

/// The trusted fields carried by a verified portal token.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortalClaims {
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub fullname: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub plan: PlanTier,
    #[serde(default)]
    pub quota_minutes: Option<i64>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub expires: i64,
    pub nonce: String,
    #[serde(default)]
    pub site_url: Option<String>,
    /// Producer fields we do not depend on.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl PortalClaims {
    /// Display name preference: full name, then username, then the id.
    pub fn display_name(&self) -> String {
        self.fullname
            .clone()
            .or_else(|| self.username.clone())
            .unwrap_or_else(|| self.user_id.clone())
    }

    /// Effective monthly quota, falling back to the plan default.
    pub fn effective_quota_minutes(&self) -> i64 {
        self.quota_minutes
            .unwrap_or_else(|| self.plan.default_quota_minutes())
    }
}

/// Verifies portal tokens against the shared secret and rejects replays.
pub struct TokenVerifier {
    secret: Vec<u8>,
    seen_nonces: Mutex<HashMap<String, i64>>,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            seen_nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Verify a token against the current wall clock.
    pub fn verify(&self, token: &str) -> Result<PortalClaims, AuthError> {
        self.verify_at(token, crate::now_ts())
    }

    /// Verify a token as of the given instant.
    pub fn verify_at(&self, token: &str, now: i64) -> Result<PortalClaims, AuthError> {
        let (payload, signature_hex) = token.trim().split_once('.').context(Malformed {
            reason: "expected <payload>.<signature>",
        })?;

        let signature = hex::decode(signature_hex).ok().context(Malformed {
            reason: "signature is not hex",
        })?;

        // constant-time comparison, via the mac itself
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("hmac accepts keys of any length");
        mac.update(payload.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            return Err(AuthError::BadSignature);
        }

        // the producer may or may not pad; strip before decoding without
        let stripped = payload.trim_end_matches('=');
        let payload_bytes = base64::decode_config(stripped, base64::URL_SAFE_NO_PAD)
            .ok()
            .context(Malformed {
                reason: "payload is not base64url",
            })?;
        let claims: PortalClaims =
            serde_json::from_slice(&payload_bytes).context(Payload {})?;

        if claims.expires < now {
            return Err(AuthError::Expired {
                expires: claims.expires,
            });
        }

        let mut seen = self.seen_nonces.lock();
        seen.retain(|_, first_seen| now - *first_seen < REPLAY_WINDOW_SECS);
        if seen.contains_key(&claims.nonce) {
            return Err(AuthError::Replayed {
                nonce: claims.nonce,
            });
        }
        seen.insert(claims.nonce.clone(), now);

        Ok(claims)
    }
}
