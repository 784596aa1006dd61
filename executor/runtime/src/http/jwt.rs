use std::collections::HashSet;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::value::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub secret: String,
    /// When set, requests without a verifiable token are rejected with 401;
    /// otherwise they proceed without claims.
    #[serde(default)]
    pub required: bool,
}

fn default_enabled() -> bool {
    true
}

/// Verify a compact HS256 token and return its claims. Signature comparison
/// is constant-time inside the jsonwebtoken crate; `exp` is checked against
/// the current time when present.
pub fn verify(secret: &str, token: &str) -> Result<Value> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.validate_aud = false;
    validation.leeway = 0;
    // exp stays optional; tokens that carry it are still checked
    validation.required_spec_claims = HashSet::new();
    let data = decode::<serde_json::Value>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(Value::from_json(&data.claims))
}

/// Sign claims as a compact HS256 token (`typ: JWT`).
pub fn sign(secret: &str, claims: &Value) -> Result<String> {
    let header = Header::new(Algorithm::HS256);
    let token = encode(
        &header,
        &claims.to_json(),
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let rest = header_value.strip_prefix("Bearer ")?;
    let rest = rest.trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn claims(entries: &[(&str, Value)]) -> Value {
        let map: HashMap<String, Value> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Value::object(map)
    }

    #[test]
    fn round_trip_under_same_secret() {
        let token = sign("s3cret", &claims(&[("sub", Value::Str("alice".into()))])).unwrap();
        let verified = verify("s3cret", &token).unwrap();
        let sub = verified.as_object().unwrap().lock().get("sub").cloned();
        assert_eq!(sub, Some(Value::Str("alice".into())));
    }

    #[test]
    fn fails_under_different_secret() {
        let token = sign("s3cret", &claims(&[("sub", Value::Str("alice".into()))])).unwrap();
        let err = verify("other", &token).unwrap_err();
        assert_eq!(err.kind_str(), "jwt_invalid");
    }

    #[test]
    fn fails_on_header_or_payload_tampering() {
        let token = sign("s3cret", &claims(&[("sub", Value::Str("alice".into()))])).unwrap();
        let parts: Vec<&str> = token.split('.').collect();

        // payload tampering
        let forged = format!("{}.{}.{}", parts[0], "eyJzdWIiOiJtYWxsb3J5In0", parts[2]);
        assert!(verify("s3cret", &forged).is_err());

        // header tampering
        let forged = format!("{}.{}.{}", "eyJhbGciOiJub25lIn0", parts[1], parts[2]);
        assert!(verify("s3cret", &forged).is_err());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let token = sign("s3cret", &claims(&[("exp", Value::Num(1.0))])).unwrap();
        let err = verify("s3cret", &token).unwrap_err();
        assert_eq!(err.kind_str(), "jwt_invalid");
    }

    #[test]
    fn future_exp_is_accepted() {
        let exp = chrono::Utc::now().timestamp() as f64 + 3600.0;
        let token = sign("s3cret", &claims(&[("exp", Value::Num(exp))])).unwrap();
        assert!(verify("s3cret", &token).is_ok());
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(bearer_token("Bearer abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
