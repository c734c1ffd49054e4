//! Token minting for the router's JWT authorisation.
//!
//! Emits one signed HS256 token per client name to standard output.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Args;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;

use crate::error::CliError;

#[derive(Args, Debug)]
pub struct JwtArgs {
    /// Shared JWT secret
    #[arg(long, short = 's', env = "SECRET")]
    pub secret: String,

    /// Allowed group (repo name)
    #[arg(long, short = 'g', env = "GROUP")]
    pub group: Option<String>,

    /// Expiration time (for example 24h)
    #[arg(long, short = 'e', env = "EXPIRATION", value_parser = humantime::parse_duration)]
    pub expiration: Option<Duration>,

    /// Allowed HTTP methods
    #[arg(long, short = 'm', env = "METHODS", value_delimiter = ',')]
    pub methods: Vec<String>,

    /// Client names; one token is generated per name
    #[arg(value_name = "name", required = true)]
    pub names: Vec<String>,
}

#[derive(Serialize)]
struct TokenClaims<'a> {
    aud: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    methods: Option<&'a [String]>,
    iat: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
}

pub fn execute(args: JwtArgs) -> Result<(), CliError> {
    let key = EncodingKey::from_secret(args.secret.as_bytes());
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    for name in &args.names {
        let claims = TokenClaims {
            aud: name,
            sub: args.group.as_deref().filter(|group| !group.is_empty()),
            methods: (!args.methods.is_empty()).then_some(args.methods.as_slice()),
            iat: now,
            exp: args.expiration.map(|expiration| now + expiration.as_secs()),
        };
        let token = encode(&Header::default(), &claims, &key)?;
        println!("{token}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Decoded {
        aud: String,
        sub: Option<String>,
        methods: Option<Vec<String>>,
        iat: u64,
    }

    #[test]
    fn test_token_claims_roundtrip() {
        let claims = TokenClaims {
            aud: "client1",
            sub: Some("my-app"),
            methods: Some(&["GET".to_string()]),
            iat: 1_700_000_000,
            exp: None,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"changeme"),
        )
        .unwrap();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_aud = false;
        let decoded = decode::<Decoded>(
            &token,
            &DecodingKey::from_secret(b"changeme"),
            &validation,
        )
        .unwrap();
        assert_eq!(decoded.claims.aud, "client1");
        assert_eq!(decoded.claims.sub.as_deref(), Some("my-app"));
        assert_eq!(decoded.claims.methods, Some(vec!["GET".to_string()]));
        assert_eq!(decoded.claims.iat, 1_700_000_000);
    }
}
