//! Bearer-token authentication
//!
//! Token issuing, refresh rotation and registration live in the external auth
//! service; this module only verifies the HS256 access token it mints and
//! resolves the connection's user identity. Tokens arrive either as
//! `Authorization: Bearer <token>` or as the `access_token` cookie (browser
//! WebSocket handshakes cannot set headers).

use anyhow::{anyhow, bail, Result};
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

fn sign_input(secret: &str, input: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| anyhow!("HMAC key error"))?;
    mac.update(input.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Mint an HS256 token for the given claims.
pub fn sign(claims: &Claims, secret: &str) -> Result<String> {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let input = format!("{}.{}", header, payload);
    let sig = URL_SAFE_NO_PAD.encode(sign_input(secret, &input)?);
    Ok(format!("{}.{}", input, sig))
}

/// Verify an HS256 token: algorithm, signature (constant-time) and expiry.
pub fn verify(token: &str, secret: &str, now: i64) -> Result<Claims> {
    let mut parts = token.split('.');
    let (header_b64, payload_b64, sig_b64) =
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s), None) => (h, p, s),
            _ => bail!("malformed token"),
        };

    let header: serde_json::Value =
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_b64)?)?;
    if header.get("alg").and_then(|v| v.as_str()) != Some("HS256") {
        bail!("unexpected signing algorithm");
    }

    let input = format!("{}.{}", header_b64, payload_b64);
    let expected = sign_input(secret, &input)?;
    let provided = URL_SAFE_NO_PAD.decode(sig_b64)?;
    if expected.ct_eq(&provided).unwrap_u8() != 1 {
        bail!("invalid signature");
    }

    let claims: Claims = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload_b64)?)?;
    if claims.exp <= now {
        bail!("token expired");
    }
    if claims.user_id <= 0 {
        bail!("invalid user id");
    }
    Ok(claims)
}

fn cookie_value(parts: &Parts, name: &str) -> Option<String> {
    let raw = parts.headers.get("cookie")?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
        .or_else(|| cookie_value(parts, "access_token"))
}

/// Authenticated caller, resolved from the access token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
    pub role: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| ApiError::unauthorized("missing_access_token", "Missing access token"))?;

        let claims = verify(&token, &state.config.jwt_secret, chrono::Utc::now().timestamp())
            .map_err(|_| {
                ApiError::unauthorized("invalid_access_token", "Invalid or expired token")
            })?;

        Ok(AuthUser {
            user_id: claims.user_id,
            role: claims.role,
        })
    }
}
