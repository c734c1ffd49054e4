//! JWT authorisation for routed requests.
//!
//! Tokens are HS256-family only, carried as a bearer header or a
//! `token` query parameter. The audience is the authenticated client;
//! an optional subject restricts the token to one group and an optional
//! method list restricts the HTTP verbs.

use axum::http::{header, HeaderMap, Method};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

/// Header carrying the authenticated client name after verification.
pub const USER_HEADER: &str = "x-user";

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// Token missing, malformed, badly signed, or without audience.
    Unauthorized,
    /// Token valid but not allowed for this group or method.
    Forbidden,
}

impl AuthFailure {
    pub fn status(self) -> axum::http::StatusCode {
        match self {
            Self::Unauthorized => axum::http::StatusCode::UNAUTHORIZED,
            Self::Forbidden => axum::http::StatusCode::FORBIDDEN,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    aud: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    methods: Option<Vec<String>>,
}

/// Shared-secret token verifier.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        // Expiry and not-before apply when present; nothing is mandatory
        // beyond the audience, which is checked by hand below.
        validation.required_spec_claims.clear();
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verifies a token against the record's group and request method.
    ///
    /// Returns the audience (client name) on success.
    pub fn verify(
        &self,
        token: &str,
        method: &Method,
        group: &str,
    ) -> Result<String, AuthFailure> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|error| {
            debug!(error = %error, "token rejected");
            AuthFailure::Unauthorized
        })?;

        let audience = data
            .claims
            .aud
            .filter(|aud| !aud.is_empty())
            .ok_or(AuthFailure::Unauthorized)?;

        if let Some(subject) = data.claims.sub.as_deref() {
            if !subject.is_empty() && !subject.eq_ignore_ascii_case(group) {
                return Err(AuthFailure::Forbidden);
            }
        }
        if let Some(methods) = &data.claims.methods {
            if !methods.is_empty()
                && !methods
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(method.as_str()))
            {
                return Err(AuthFailure::Forbidden);
            }
        }
        Ok(audience)
    }
}

/// Pulls the token out of the `Authorization` header or the `token`
/// query parameter. An empty header value behaves like an absent one;
/// a non-empty value that is not a bearer token is rejected.
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let value = value.to_str().ok()?.trim();
        if !value.is_empty() {
            let (kind, token) = value.split_once(' ')?;
            if !kind.trim().eq_ignore_ascii_case("bearer") {
                return None;
            }
            return Some(token.trim().to_string());
        }
    }
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        aud: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        sub: Option<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        methods: Option<Vec<&'static str>>,
    }

    fn token(secret: &str, claims: &TestClaims) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_returns_audience() {
        let verifier = JwtVerifier::new("changeme");
        let token = token(
            "changeme",
            &TestClaims {
                aud: "client1",
                sub: None,
                methods: None,
            },
        );
        let audience = verifier.verify(&token, &Method::GET, "my-app").unwrap();
        assert_eq!(audience, "client1");
    }

    #[test]
    fn test_wrong_secret_unauthorized() {
        let verifier = JwtVerifier::new("changeme");
        let token = token(
            "other",
            &TestClaims {
                aud: "client1",
                sub: None,
                methods: None,
            },
        );
        assert_eq!(
            verifier.verify(&token, &Method::GET, "my-app"),
            Err(AuthFailure::Unauthorized)
        );
    }

    #[test]
    fn test_missing_audience_unauthorized() {
        let verifier = JwtVerifier::new("changeme");
        #[derive(Serialize)]
        struct Empty {}
        let token = encode(
            &Header::default(),
            &Empty {},
            &EncodingKey::from_secret(b"changeme"),
        )
        .unwrap();
        assert_eq!(
            verifier.verify(&token, &Method::GET, "my-app"),
            Err(AuthFailure::Unauthorized)
        );
    }

    #[test]
    fn test_subject_restricts_group() {
        let verifier = JwtVerifier::new("changeme");
        let token = token(
            "changeme",
            &TestClaims {
                aud: "client1",
                sub: Some("My-App"),
                methods: None,
            },
        );
        // Case-insensitive match on the owning group.
        assert!(verifier.verify(&token, &Method::GET, "my-app").is_ok());
        assert_eq!(
            verifier.verify(&token, &Method::GET, "other"),
            Err(AuthFailure::Forbidden)
        );
    }

    #[test]
    fn test_methods_restrict_verb() {
        let verifier = JwtVerifier::new("changeme");
        let token = token(
            "changeme",
            &TestClaims {
                aud: "client1",
                sub: None,
                methods: Some(vec!["POST"]),
            },
        );
        assert!(verifier.verify(&token, &Method::POST, "my-app").is_ok());
        assert_eq!(
            verifier.verify(&token, &Method::GET, "my-app"),
            Err(AuthFailure::Forbidden)
        );
    }

    #[test]
    fn test_extract_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "BeArEr abc.def.ghi".parse().unwrap());
        assert_eq!(
            extract_token(&headers, None).as_deref(),
            Some("abc.def.ghi")
        );
    }

    #[test]
    fn test_extract_rejects_basic() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert_eq!(extract_token(&headers, None), None);
    }

    #[test]
    fn test_extract_query_fallback() {
        let headers = HeaderMap::new();
        assert_eq!(
            extract_token(&headers, Some("a=1&token=abc")).as_deref(),
            Some("abc")
        );
        assert_eq!(extract_token(&headers, Some("a=1")), None);
    }

    #[test]
    fn test_empty_header_falls_back_to_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "".parse().unwrap());
        assert_eq!(
            extract_token(&headers, Some("token=abc")).as_deref(),
            Some("abc")
        );
        // A malformed non-empty header still wins over the query.
        headers.insert(header::AUTHORIZATION, "Bearer".parse().unwrap());
        assert_eq!(extract_token(&headers, Some("token=abc")), None);
    }
}
