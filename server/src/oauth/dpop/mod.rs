use chrono::Utc;
use jsonwebtoken::{Algorithm, Header};
use p256::ecdsa::{signature::Signer as _, Signature};
use p256::elliptic_curve::JwkEcKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::SigningError;
use super::jwk::{ClientKeys, DpopKey};
use super::utils::{base64_url_encode, generate_jti};

pub const JWT_HEADER_TYP_DPOP: &str = "dpop+jwt";
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Lifetime of proofs and client assertions, in seconds.
const PROOF_LIFETIME: i64 = 300;

#[derive(Debug, Serialize)]
struct DpopHeader<'a> {
    typ: &'a str,
    alg: &'a str,
    jwk: JwkEcKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpopClaims {
    pub jti: String,
    pub htm: String,
    pub htu: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,
}

/// JWT payload for `private_key_jwt` client authentication
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientAssertionClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub jti: String,
    pub exp: i64,
    pub iat: i64,
}

/// Build a DPoP proof bound to `method` + `url`, and optionally to a server
/// nonce and an access token. Empty nonces are treated as absent.
pub fn build_dpop_proof(
    key: &DpopKey,
    method: &str,
    url: &str,
    nonce: Option<&str>,
    access_token: Option<&str>,
) -> Result<String, SigningError> {
    let now = Utc::now().timestamp();

    let header = DpopHeader {
        typ: JWT_HEADER_TYP_DPOP,
        alg: "ES256",
        jwk: key.public_jwk(),
    };
    let claims = DpopClaims {
        jti: generate_jti(),
        htm: method.to_uppercase(),
        htu: normalize_htu(url),
        iat: now,
        exp: now + PROOF_LIFETIME,
        nonce: nonce.filter(|n| !n.is_empty()).map(str::to_owned),
        ath: access_token.map(access_token_hash),
    };

    tracing::debug!(htm = %claims.htm, htu = %claims.htu, has_nonce = claims.nonce.is_some(), "building DPoP proof");

    let header_b64 = base64_url_encode(&serde_json::to_vec(&header)?);
    let payload_b64 = base64_url_encode(&serde_json::to_vec(&claims)?);
    let message = format!("{header_b64}.{payload_b64}");

    let signature: Signature = key.signing_key().try_sign(message.as_bytes())?;

    Ok(format!(
        "{message}.{}",
        base64_url_encode(&signature.to_bytes())
    ))
}

/// `ath` claim value: base64url(SHA-256(access_token))
pub fn access_token_hash(access_token: &str) -> String {
    base64_url_encode(&Sha256::digest(access_token.as_bytes()))
}

/// The `htu` claim excludes query and fragment.
fn normalize_htu(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => raw.to_string(),
    }
}

/// Create a client assertion JWT for token and PAR requests
pub fn create_client_assertion(
    keys: &ClientKeys,
    client_id: &str,
    audience: &str,
) -> Result<String, SigningError> {
    let now = Utc::now().timestamp();

    let mut header = Header::new(Algorithm::ES256);
    header.kid = Some(keys.kid().to_string());

    let claims = ClientAssertionClaims {
        iss: client_id.to_string(),
        sub: client_id.to_string(),
        aud: audience.to_string(),
        jti: generate_jti(),
        exp: now + PROOF_LIFETIME,
        iat: now,
    };

    Ok(jsonwebtoken::encode(
        &header,
        &claims,
        &keys.encoding_key()?,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};

    fn verify(proof: &str) -> (jsonwebtoken::Header, DpopClaims) {
        let header = decode_header(proof).unwrap();
        let jwk = header.jwk.clone().expect("proof embeds its public key");
        let key = DecodingKey::from_jwk(&jwk).unwrap();

        let mut validation = Validation::new(Algorithm::ES256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let claims = decode::<DpopClaims>(proof, &key, &validation).unwrap().claims;
        (header, claims)
    }

    #[test]
    fn proof_is_a_valid_es256_jws() {
        let key = DpopKey::generate();
        let proof = build_dpop_proof(
            &key,
            "post",
            "https://pds.example/xrpc/com.atproto.repo.createRecord",
            Some("server-nonce"),
            None,
        )
        .unwrap();

        let (header, claims) = verify(&proof);
        assert_eq!(header.typ.as_deref(), Some(JWT_HEADER_TYP_DPOP));
        assert_eq!(header.alg, Algorithm::ES256);
        assert_eq!(claims.htm, "POST");
        assert_eq!(
            claims.htu,
            "https://pds.example/xrpc/com.atproto.repo.createRecord"
        );
        assert_eq!(claims.nonce.as_deref(), Some("server-nonce"));
        assert_eq!(claims.exp - claims.iat, PROOF_LIFETIME);
        assert!(claims.ath.is_none());
    }

    #[test]
    fn empty_nonce_is_omitted() {
        let key = DpopKey::generate();
        let proof = build_dpop_proof(&key, "POST", "https://as.example/token", Some(""), None)
            .unwrap();

        let (_, claims) = verify(&proof);
        assert!(claims.nonce.is_none());
    }

    #[test]
    fn ath_binds_the_access_token() {
        let key = DpopKey::generate();
        let proof = build_dpop_proof(
            &key,
            "GET",
            "https://pds.example/xrpc/a?b=c#d",
            None,
            Some("token-123"),
        )
        .unwrap();

        let (_, claims) = verify(&proof);
        assert_eq!(claims.ath, Some(access_token_hash("token-123")));
        assert_eq!(claims.htu, "https://pds.example/xrpc/a");
    }

    #[test]
    fn every_proof_gets_a_fresh_jti() {
        let key = DpopKey::generate();
        let a = build_dpop_proof(&key, "POST", "https://as.example/par", None, None).unwrap();
        let b = build_dpop_proof(&key, "POST", "https://as.example/par", None, None).unwrap();

        assert_ne!(verify(&a).1.jti, verify(&b).1.jti);
    }

    #[test]
    fn access_token_hash_is_base64url_sha256() {
        // RFC 9449 section 7.1
        assert_eq!(
            access_token_hash("Kz~8mXK1EalYznwH-LC-1fBAo.4Ljp~zsPE_NeO.gxU"),
            "fUHyO2r2Z3DZ53EsNrWBb0xWXoaNy59IiKCAqksmQEo"
        );
    }

    #[test]
    fn client_assertion_carries_client_identity() {
        let keys = ClientKeys::generate().unwrap();
        let assertion =
            create_client_assertion(&keys, "https://app.example/client-metadata.json", "https://as.example")
                .unwrap();

        let header = decode_header(&assertion).unwrap();
        assert_eq!(header.kid.as_deref(), Some(keys.kid()));

        let mut validation = Validation::new(Algorithm::ES256);
        validation.insecure_disable_signature_validation();
        validation.set_audience(&["https://as.example"]);
        let claims = decode::<ClientAssertionClaims>(
            &assertion,
            &DecodingKey::from_secret(&[]),
            &validation,
        )
        .unwrap()
        .claims;

        assert_eq!(claims.iss, "https://app.example/client-metadata.json");
        assert_eq!(claims.sub, claims.iss);
        assert_eq!(claims.aud, "https://as.example");
    }
}
