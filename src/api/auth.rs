//! Authentication: connection tokens and the REST API key

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::ApiState;

/// Claims carried by a connection token
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Parent id the token was issued to
    pub sub: String,
    pub exp: u64,
}

/// Result of checking a connection token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub valid: bool,
    /// Who the token belongs to, when it says
    pub subject: Option<String>,
}

impl AuthOutcome {
    const fn rejected() -> Self {
        Self {
            valid: false,
            subject: None,
        }
    }
}

/// Validates the `token` query parameter of the interaction socket
pub struct TokenValidator {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl TokenValidator {
    /// HS256 validation when `secret` is set, development mode otherwise
    #[must_use]
    pub fn new(secret: Option<&SecretString>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.required_spec_claims.remove("aud");

        let key = secret.map(|s| DecodingKey::from_secret(s.expose_secret().as_bytes()));
        if key.is_none() {
            tracing::warn!("no JWT secret configured - any non-empty connection token is accepted");
        }
        Self { key, validation }
    }

    /// Accept any non-empty token
    #[must_use]
    pub fn development() -> Self {
        Self::new(None)
    }

    /// Check a token; a missing or empty token is never valid
    #[must_use]
    pub fn validate(&self, token: Option<&str>) -> AuthOutcome {
        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            tracing::debug!("no connection token provided");
            return AuthOutcome::rejected();
        };

        let Some(key) = &self.key else {
            return AuthOutcome {
                valid: true,
                subject: None,
            };
        };

        match decode::<TokenClaims>(token, key, &self.validation) {
            Ok(data) => AuthOutcome {
                valid: true,
                subject: Some(data.claims.sub),
            },
            Err(e) => {
                tracing::warn!(error = %e, "connection token rejected");
                AuthOutcome::rejected()
            }
        }
    }
}

/// Extract API key from Authorization header
fn extract_api_key(req: &Request) -> Option<&str> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Middleware to verify API key
pub async fn require_api_key(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // If no API key configured, allow all requests (development mode)
    let Some(expected_key) = &state.api_key else {
        return Ok(next.run(req).await);
    };

    match extract_api_key(&req) {
        Some(key) if key == expected_key.expose_secret() => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!("invalid API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::debug!("no API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};

    use super::*;

    fn token(secret: &str, sub: &str, exp_offset_secs: i64) -> String {
        let exp = u64::try_from(chrono::Utc::now().timestamp() + exp_offset_secs).unwrap();
        encode(
            &Header::default(),
            &TokenClaims {
                sub: sub.to_string(),
                exp,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_extract_api_key() {
        let mut req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(extract_api_key(&req), None);

        req.headers_mut().insert(
            "authorization",
            HeaderValue::from_static("Bearer test-key-123"),
        );
        assert_eq!(extract_api_key(&req), Some("test-key-123"));
    }

    #[test]
    fn test_development_mode() {
        let validator = TokenValidator::development();
        assert!(validator.validate(Some("anything")).valid);
        assert!(!validator.validate(Some("  ")).valid);
        assert!(!validator.validate(None).valid);
    }

    #[test]
    fn test_valid_jwt_yields_subject() {
        let secret = SecretString::from("s3cret");
        let validator = TokenValidator::new(Some(&secret));

        let outcome = validator.validate(Some(&token("s3cret", "parent-1", 3600)));
        assert_eq!(
            outcome,
            AuthOutcome {
                valid: true,
                subject: Some("parent-1".to_string()),
            }
        );
    }

    #[test]
    fn test_rejects_wrong_secret_and_expired() {
        let secret = SecretString::from("s3cret");
        let validator = TokenValidator::new(Some(&secret));

        assert!(!validator.validate(Some(&token("other", "parent-1", 3600))).valid);
        assert!(!validator.validate(Some(&token("s3cret", "parent-1", -3600))).valid);
        assert!(!validator.validate(Some("not-a-jwt")).valid);
    }
}
