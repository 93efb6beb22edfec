use std::collections::HashSet;

use axum::http::HeaderMap;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Accepted clock skew for proof `iat`, in seconds.
const MAX_PROOF_AGE: i64 = 300;

pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

#[derive(Debug, Deserialize)]
pub struct ProofClaims {
    pub jti: String,
    pub htm: String,
    pub htu: String,
    pub iat: i64,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub ath: Option<String>,
}

/// A proof that passed every check, with the thumbprint of its key.
#[derive(Debug)]
pub struct VerifiedProof {
    pub jkt: String,
    pub claims: ProofClaims,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProofError {
    Missing,
    Invalid(String),
    /// Proof is fine apart from a missing or stale nonce.
    UseNonce,
}

impl ProofError {
    pub fn description(&self) -> String {
        match self {
            ProofError::Missing => "DPoP proof required".to_string(),
            ProofError::Invalid(reason) => format!("Invalid DPoP proof: {reason}"),
            ProofError::UseNonce => "Authorization server requires nonce in DPoP proof".to_string(),
        }
    }
}

pub fn sha256_b64(input: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(input.as_bytes()))
}

/// RFC 7638 thumbprint of an EC public JWK.
pub fn thumbprint(jwk: &Value) -> Result<String, ProofError> {
    let member = |name: &str| {
        jwk.get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| ProofError::Invalid(format!("jwk is missing {name}")))
    };
    let canonical = format!(
        r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
        member("crv")?,
        member("kty")?,
        member("x")?,
        member("y")?
    );
    Ok(sha256_b64(&canonical))
}

/// Check the `DPoP` header of a request against what the server expects.
pub fn verify_proof(
    headers: &HeaderMap,
    method: &str,
    url: &str,
    expected_nonce: &str,
    access_token: Option<&str>,
    seen_jtis: &mut HashSet<String>,
) -> Result<VerifiedProof, ProofError> {
    let proof = headers
        .get("dpop")
        .and_then(|v| v.to_str().ok())
        .ok_or(ProofError::Missing)?;

    let header = decode_header(proof).map_err(|e| ProofError::Invalid(e.to_string()))?;
    if header.typ.as_deref() != Some("dpop+jwt") {
        return Err(ProofError::Invalid("typ must be dpop+jwt".into()));
    }
    if header.alg != Algorithm::ES256 {
        return Err(ProofError::Invalid("alg must be ES256".into()));
    }
    let jwk = header
        .jwk
        .ok_or_else(|| ProofError::Invalid("header has no jwk".into()))?;
    let jkt = thumbprint(
        &serde_json::to_value(&jwk).map_err(|e| ProofError::Invalid(e.to_string()))?,
    )?;

    let key = DecodingKey::from_jwk(&jwk).map_err(|e| ProofError::Invalid(e.to_string()))?;
    let mut validation = Validation::new(Algorithm::ES256);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();
    let claims = decode::<ProofClaims>(proof, &key, &validation)
        .map_err(|e| ProofError::Invalid(e.to_string()))?
        .claims;

    if !claims.htm.eq_ignore_ascii_case(method) {
        return Err(ProofError::Invalid(format!("htm {} != {method}", claims.htm)));
    }
    if claims.htu != url {
        return Err(ProofError::Invalid(format!("htu {} != {url}", claims.htu)));
    }
    if (Utc::now().timestamp() - claims.iat).abs() > MAX_PROOF_AGE {
        return Err(ProofError::Invalid("iat out of range".into()));
    }
    if let Some(token) = access_token {
        if claims.ath.as_deref() != Some(sha256_b64(token).as_str()) {
            return Err(ProofError::Invalid("ath does not match access token".into()));
        }
    }
    if claims.nonce.as_deref() != Some(expected_nonce) {
        return Err(ProofError::UseNonce);
    }
    if !seen_jtis.insert(claims.jti.clone()) {
        return Err(ProofError::Invalid("jti replayed".into()));
    }

    Ok(VerifiedProof { jkt, claims })
}

#[derive(Debug, Deserialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
}

/// Shallow `private_key_jwt` check: the assertion must be an ES256 JWT naming
/// `client_id` and addressed to `issuer`. The signature is not verified since
/// fixture clients do not publish their JWKS anywhere reachable.
pub fn check_client_assertion(
    form: &std::collections::HashMap<String, String>,
    issuer: &str,
) -> Result<String, String> {
    let client_id = form.get("client_id").ok_or("client_id is required")?;
    if form.get("client_assertion_type").map(String::as_str) != Some(CLIENT_ASSERTION_TYPE) {
        return Err("unsupported client_assertion_type".into());
    }
    let assertion = form
        .get("client_assertion")
        .ok_or("client_assertion is required")?;

    let header = decode_header(assertion).map_err(|e| e.to_string())?;
    if header.alg != Algorithm::ES256 || header.kid.is_none() {
        return Err("client assertion must be ES256 with a kid".into());
    }

    let mut validation = Validation::new(Algorithm::ES256);
    validation.insecure_disable_signature_validation();
    validation.set_audience(&[issuer]);
    validation.set_required_spec_claims(&["exp", "aud", "iss", "sub"]);
    let claims = decode::<AssertionClaims>(assertion, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| e.to_string())?
        .claims;

    if claims.iss != *client_id || claims.sub != *client_id {
        return Err("client assertion iss/sub must equal client_id".into());
    }
    Ok(client_id.clone())
}
