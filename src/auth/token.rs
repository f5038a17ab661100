use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Generate an API token. Returns `(raw_token, sha256_hash)`.
/// Format: `sspace_` + 32 random bytes as hex.
pub fn generate_api_token() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::fill(&mut bytes);
    let raw = format!("sspace_{}", hex::encode(bytes));
    let hash = hash_token(&raw);
    (raw, hash)
}

/// SHA-256 hash of a token string, returned as lowercase hex. Only hashes
/// are stored.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Mint a short-lived VNC stream token bound to a session and its owning
/// principal. Carried in the proxy upgrade query string.
pub fn mint_vnc_token(
    secret: &str,
    session_id: Uuid,
    principal: &str,
    expires_at: DateTime<Utc>,
) -> String {
    let claims = format!("{session_id}|{principal}|{}", expires_at.timestamp());
    let sig = sign(secret, &claims);
    format!("{}.{}", URL_SAFE_NO_PAD.encode(&claims), hex::encode(sig))
}

/// Errors a VNC token can fail validation with.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum VncTokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token is for a different session")]
    WrongSession,
}

/// Validate a VNC stream token against the session it is presented for.
/// Returns the principal the token was minted for.
pub fn verify_vnc_token(
    secret: &str,
    session_id: Uuid,
    token: &str,
) -> Result<String, VncTokenError> {
    let (claims_b64, sig_hex) = token.split_once('.').ok_or(VncTokenError::Malformed)?;
    let claims_bytes = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|_| VncTokenError::Malformed)?;
    let claims = String::from_utf8(claims_bytes).map_err(|_| VncTokenError::Malformed)?;
    let sig = hex::decode(sig_hex).map_err(|_| VncTokenError::Malformed)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| VncTokenError::Malformed)?;
    mac.update(claims.as_bytes());
    mac.verify_slice(&sig)
        .map_err(|_| VncTokenError::BadSignature)?;

    let mut parts = claims.splitn(3, '|');
    let token_session = parts
        .next()
        .and_then(|s| s.parse::<Uuid>().ok())
        .ok_or(VncTokenError::Malformed)?;
    let principal = parts.next().ok_or(VncTokenError::Malformed)?.to_owned();
    let expiry = parts
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .ok_or(VncTokenError::Malformed)?;

    if token_session != session_id {
        return Err(VncTokenError::WrongSession);
    }
    if expiry < Utc::now() {
        return Err(VncTokenError::Expired);
    }
    Ok(principal)
}

fn sign(secret: &str, claims: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(claims.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn api_token_format() {
        let (raw, hash) = generate_api_token();
        assert!(raw.starts_with("sspace_"));
        assert_eq!(raw.len(), 7 + 64); // "sspace_" + 32 bytes hex
        assert_eq!(hash.len(), 64); // sha256 hex
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_token("sspace_abc"), hash_token("sspace_abc"));
        assert_ne!(hash_token("sspace_abc"), hash_token("sspace_abd"));
    }

    #[test]
    fn vnc_token_round_trip() {
        let session = Uuid::new_v4();
        let token = mint_vnc_token("secret", session, "u1", Utc::now() + Duration::minutes(1));
        assert_eq!(verify_vnc_token("secret", session, &token).unwrap(), "u1");
    }

    #[test]
    fn vnc_token_rejects_other_session() {
        let token = mint_vnc_token(
            "secret",
            Uuid::new_v4(),
            "u1",
            Utc::now() + Duration::minutes(1),
        );
        assert_eq!(
            verify_vnc_token("secret", Uuid::new_v4(), &token),
            Err(VncTokenError::WrongSession)
        );
    }

    #[test]
    fn vnc_token_rejects_expiry_and_tamper() {
        let session = Uuid::new_v4();
        let expired = mint_vnc_token("secret", session, "u1", Utc::now() - Duration::minutes(1));
        assert_eq!(
            verify_vnc_token("secret", session, &expired),
            Err(VncTokenError::Expired)
        );

        let good = mint_vnc_token("secret", session, "u1", Utc::now() + Duration::minutes(1));
        assert_eq!(
            verify_vnc_token("other-secret", session, &good),
            Err(VncTokenError::BadSignature)
        );
        assert_eq!(
            verify_vnc_token("secret", session, "not-a-token"),
            Err(VncTokenError::Malformed)
        );
    }
}
