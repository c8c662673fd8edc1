//! JWT authentication for the usage API.
//!
//! Tokens are HS256 JWTs presented either as `Authorization: Bearer <jwt>`
//! or as the `token` cookie. The bearer header is tried first.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{Duration, Utc};
use cm_config::ConfigPaths;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ApiErrorResponse;
use crate::state::AppState;

pub const TOKEN_COOKIE: &str = "token";
pub const TOKEN_EXPIRY_DAYS: i64 = 7;
const SECRET_ENV: &str = "MENTOR_JWT_SECRET";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credentials presented")]
    Missing,
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Invalid(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub exp: i64,
}

/// Identity attached to authenticated requests by [`auth_middleware`].
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.sub,
            email: claims.email,
        }
    }
}

pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    pub fn issue(
        &self,
        user_id: &str,
        email: Option<&str>,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let exp = Utc::now()
            .checked_add_signed(ttl)
            .ok_or_else(|| AuthError::Signing("token lifetime out of range".to_string()))?
            .timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            email: email.map(str::to_string),
            exp,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())?;
        Ok(data.claims)
    }
}

/// Read the signing secret from `MENTOR_JWT_SECRET`, or from the secret
/// file, generating and saving a new one on first use.
pub fn load_or_create_secret(paths: &ConfigPaths) -> anyhow::Result<Vec<u8>> {
    if let Ok(secret) = std::env::var(SECRET_ENV) {
        if !secret.is_empty() {
            if secret.len() < 32 {
                tracing::warn!("{} is shorter than 32 characters", SECRET_ENV);
            }
            return Ok(secret.into_bytes());
        }
    }

    let path = paths.jwt_secret_path();
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let secret = existing.trim();
        if !secret.is_empty() {
            return Ok(secret.as_bytes().to_vec());
        }
    }

    let secret = generate_secret();
    paths.ensure_config_dir()?;
    std::fs::write(&path, &secret)?;
    tracing::info!("Generated new JWT secret at {}", path.display());
    Ok(secret.into_bytes())
}

pub fn generate_secret() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..64).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

pub fn extract_bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

pub fn extract_cookie_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all("cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == TOKEN_COOKIE)
        .map(|(_, value)| value.trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

/// Verify the bearer token, falling back to the cookie when the header is
/// absent or fails verification.
pub fn authenticate(keys: &JwtKeys, headers: &HeaderMap) -> Result<Claims, AuthError> {
    let candidates = [
        extract_bearer_from_headers(headers),
        extract_cookie_token(headers),
    ];
    let mut last_error = AuthError::Missing;
    for token in candidates.into_iter().flatten() {
        match keys.verify(&token) {
            Ok(claims) => return Ok(claims),
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiErrorResponse> {
    let claims = authenticate(&state.keys, req.headers()).map_err(|e| {
        tracing::debug!("rejected request to {}: {}", req.uri().path(), e);
        ApiErrorResponse::from(e)
    })?;
    req.extensions_mut().insert(AuthUser::from(claims));
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> JwtKeys {
        JwtKeys::new(b"test-secret-that-is-long-enough-for-hs256")
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn issue_then_verify() {
        let keys = keys();
        let token = keys
            .issue("user-123", Some("dev@example.com"), Duration::days(TOKEN_EXPIRY_DAYS))
            .unwrap();
        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.sub, "user-123");
        assert_eq!(claims.email.as_deref(), Some("dev@example.com"));
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn expired_token_is_rejected() {
        let keys = keys();
        // beyond the default 60s leeway
        let token = keys.issue("user-123", None, Duration::minutes(-5)).unwrap();
        assert!(matches!(keys.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn token_from_other_secret_is_invalid() {
        let token = JwtKeys::new(b"another-secret-another-secret-xx")
            .issue("user-123", None, Duration::hours(1))
            .unwrap();
        assert!(matches!(keys().verify(&token), Err(AuthError::Invalid(_))));
        assert!(matches!(keys().verify("garbage"), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn generate_secret_length_and_hex() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 128);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn extract_bearer_valid_and_malformed() {
        assert_eq!(
            extract_bearer_from_headers(&headers(&[("authorization", "Bearer abc")])),
            Some("abc".to_string())
        );
        assert_eq!(
            extract_bearer_from_headers(&headers(&[("authorization", "Basic abc")])),
            None
        );
        assert_eq!(extract_bearer_from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn extract_cookie_finds_token_among_others() {
        let h = headers(&[("cookie", "theme=dark; token=jwt-value; lang=es")]);
        assert_eq!(extract_cookie_token(&h), Some("jwt-value".to_string()));

        let h = headers(&[("cookie", "theme=dark"), ("cookie", "token=second")]);
        assert_eq!(extract_cookie_token(&h), Some("second".to_string()));

        let h = headers(&[("cookie", "mytoken=nope; token=")]);
        assert_eq!(extract_cookie_token(&h), None);
    }

    #[test]
    fn authenticate_prefers_valid_bearer() {
        let keys = keys();
        let bearer = keys.issue("bearer-user", None, Duration::hours(1)).unwrap();
        let cookie = keys.issue("cookie-user", None, Duration::hours(1)).unwrap();
        let h = headers(&[
            ("authorization", format!("Bearer {bearer}").as_str()),
            ("cookie", format!("token={cookie}").as_str()),
        ]);
        assert_eq!(authenticate(&keys, &h).unwrap().sub, "bearer-user");
    }

    #[test]
    fn authenticate_falls_back_to_cookie() {
        let keys = keys();
        let cookie = keys.issue("cookie-user", None, Duration::hours(1)).unwrap();
        let h = headers(&[
            ("authorization", "Bearer not-a-jwt"),
            ("cookie", format!("token={cookie}").as_str()),
        ]);
        assert_eq!(authenticate(&keys, &h).unwrap().sub, "cookie-user");
    }

    #[test]
    fn authenticate_without_credentials_is_missing() {
        assert!(matches!(
            authenticate(&keys(), &HeaderMap::new()),
            Err(AuthError::Missing)
        ));
    }

    #[test]
    fn secret_file_is_created_once() {
        if std::env::var(SECRET_ENV).is_ok() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::with_base(dir.path().join("mentor"));
        let first = load_or_create_secret(&paths).unwrap();
        let second = load_or_create_secret(&paths).unwrap();
        assert_eq!(first, second);
        assert!(paths.jwt_secret_path().exists());
    }
}
