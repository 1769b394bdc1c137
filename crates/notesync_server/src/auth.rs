//! Bearer token authentication.
//!
//! Tokens are HS256 JWTs whose `sub` claim names the user. A token may also
//! carry a `deviceId` claim, in which case it is only valid for requests made
//! on behalf of that device.

use crate::error::{ServerError, ServerResult};
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Device the token is bound to, if any.
    #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Expiry in Unix seconds.
    pub exp: u64,
    /// Issue time in Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
}

/// The identity behind an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedDevice {
    /// User the request acts for.
    pub user_id: String,
    /// Device the token is bound to, if any.
    pub device_id: Option<String>,
}

impl AuthenticatedDevice {
    /// Creates an identity not bound to a device.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: None,
        }
    }

    /// Checks that the request may act as `device_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotAuthorized`] if `device_id` is empty or the
    /// token is bound to a different device.
    pub fn authorize_device(&self, device_id: &str) -> ServerResult<()> {
        if device_id.trim().is_empty() {
            return Err(ServerError::NotAuthorized("deviceId is required".into()));
        }
        match &self.device_id {
            Some(bound) if bound != device_id => Err(ServerError::NotAuthorized(format!(
                "token is not valid for device {device_id}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Verifies bearer tokens.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Creates a verifier for tokens signed with `secret`.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        validation.leeway = 30;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Sets the allowed clock difference for `exp` in seconds.
    pub fn with_leeway(mut self, seconds: u64) -> Self {
        self.validation.leeway = seconds;
        self
    }

    /// Verifies `token` and returns the identity it carries.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AuthenticationFailed`] for malformed, forged or
    /// expired tokens.
    pub fn verify(&self, token: &str) -> ServerResult<AuthenticatedDevice> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|err| {
            let reason = match err.kind() {
                ErrorKind::ExpiredSignature => "token expired",
                ErrorKind::InvalidSignature => "invalid token signature",
                _ => "invalid token",
            };
            ServerError::AuthenticationFailed(reason.into())
        })?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(ServerError::AuthenticationFailed(
                "token has no subject".into(),
            ));
        }
        Ok(AuthenticatedDevice {
            user_id: claims.sub,
            device_id: claims.device_id.filter(|d| !d.is_empty()),
        })
    }
}

/// Extracts the token from an `Authorization: Bearer` header.
///
/// # Errors
///
/// Returns [`ServerError::AuthenticationFailed`] if the header is missing or
/// not a bearer credential.
pub fn extract_bearer_token(headers: &HeaderMap) -> ServerResult<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ServerError::AuthenticationFailed("missing authorization header".into()))?
        .to_str()
        .map_err(|_| ServerError::AuthenticationFailed("malformed authorization header".into()))?;

    let (scheme, token) = value
        .split_once(' ')
        .ok_or_else(|| ServerError::AuthenticationFailed("expected a bearer token".into()))?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(ServerError::AuthenticationFailed(
            "expected a bearer token".into(),
        ));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"test-secret-for-auth";

    fn token(claims: &Claims, secret: &[u8]) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    fn claims(device: Option<&str>, exp: u64) -> Claims {
        Claims {
            sub: "user-1".into(),
            device_id: device.map(String::from),
            exp,
            iat: None,
        }
    }

    fn far_future() -> u64 {
        (chrono::Utc::now().timestamp() + 3600) as u64
    }

    #[test]
    fn verifies_valid_token() {
        let verifier = TokenVerifier::new(SECRET);
        let auth = verifier
            .verify(&token(&claims(Some("dev-a"), far_future()), SECRET))
            .unwrap();

        assert_eq!(auth.user_id, "user-1");
        assert_eq!(auth.device_id.as_deref(), Some("dev-a"));
    }

    #[test]
    fn rejects_wrong_secret() {
        let verifier = TokenVerifier::new(SECRET);
        let err = verifier
            .verify(&token(&claims(None, far_future()), b"another-secret"))
            .unwrap_err();
        assert!(matches!(err, ServerError::AuthenticationFailed(_)));
    }

    #[test]
    fn rejects_expired_token() {
        let verifier = TokenVerifier::new(SECRET).with_leeway(0);
        let expired = (chrono::Utc::now().timestamp() - 120) as u64;
        let err = verifier
            .verify(&token(&claims(None, expired), SECRET))
            .unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn rejects_garbage() {
        let verifier = TokenVerifier::new(SECRET);
        assert!(verifier.verify("not.a.jwt").is_err());
        assert!(verifier.verify("").is_err());
    }

    #[test]
    fn device_binding() {
        let bound = AuthenticatedDevice {
            user_id: "u".into(),
            device_id: Some("dev-a".into()),
        };
        assert!(bound.authorize_device("dev-a").is_ok());
        assert!(matches!(
            bound.authorize_device("dev-b"),
            Err(ServerError::NotAuthorized(_))
        ));

        let unbound = AuthenticatedDevice::user("u");
        assert!(unbound.authorize_device("anything").is_ok());
        assert!(unbound.authorize_device("  ").is_err());
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(extract_bearer_token(&headers).is_err());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc.def");

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer   xyz "));
        assert_eq!(extract_bearer_token(&headers).unwrap(), "xyz");

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert!(extract_bearer_token(&headers).is_err());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(extract_bearer_token(&headers).is_err());
    }
}
