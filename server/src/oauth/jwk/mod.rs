use base64::{engine::general_purpose::STANDARD, Engine as _};
use jsonwebtoken::EncodingKey;
use p256::{
    ecdsa::SigningKey,
    elliptic_curve::JwkEcKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding},
    SecretKey,
};
use rand::rngs::OsRng;
use serde_json::{json, Value};

use super::error::{OAuthError, SigningError};
use super::utils::base64_url_encode;

/// The confidential client's long-lived signing key.
///
/// Its public half is published through the JWKS document and it signs every
/// `private_key_jwt` client assertion sent to an authorization server.
#[derive(Clone)]
pub struct ClientKeys {
    secret: SecretKey,
    pem: String,
    kid: String,
}

impl std::fmt::Debug for ClientKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientKeys").field("kid", &self.kid).finish()
    }
}

impl ClientKeys {
    /// Load a key from a base64 encoded PKCS#8 PEM document.
    pub fn from_base64_pem(encoded: &str) -> Result<Self, OAuthError> {
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| OAuthError::Config(format!("client key is not valid base64: {e}")))?;
        let pem = String::from_utf8(decoded)
            .map_err(|e| OAuthError::Config(format!("client key is not UTF-8 PEM: {e}")))?;

        Self::from_pem(&pem)
    }

    pub fn from_pem(pem: &str) -> Result<Self, OAuthError> {
        let secret = SecretKey::from_pkcs8_pem(pem)
            .map_err(|e| OAuthError::Config(format!("client key is not a P-256 PKCS#8 key: {e}")))?;

        Self::from_secret(secret).map_err(|e| OAuthError::Config(e.to_string()))
    }

    pub fn generate() -> Result<Self, SigningError> {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    fn from_secret(secret: SecretKey) -> Result<Self, SigningError> {
        let pem = secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| SigningError::Key(e.to_string()))?
            .to_string();
        let kid = jwk_thumbprint(&secret.public_key().to_jwk())?;

        Ok(Self { secret, pem, kid })
    }

    pub fn to_base64_pem(&self) -> String {
        STANDARD.encode(self.pem.as_bytes())
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub(crate) fn encoding_key(&self) -> Result<EncodingKey, SigningError> {
        Ok(EncodingKey::from_ec_pem(self.pem.as_bytes())?)
    }

    /// Public JWK advertised to authorization servers.
    pub fn public_jwk(&self) -> Result<Value, SigningError> {
        let mut jwk = serde_json::to_value(self.secret.public_key().to_jwk())?;
        if let Value::Object(map) = &mut jwk {
            map.insert("kid".into(), json!(self.kid));
            map.insert("alg".into(), json!("ES256"));
            map.insert("use".into(), json!("sig"));
        }
        Ok(jwk)
    }

    pub fn jwks(&self) -> Result<Value, SigningError> {
        Ok(json!({ "keys": [self.public_jwk()?] }))
    }
}

/// Ephemeral proof-of-possession key, one per authorization flow.
///
/// Serialized as a private JWK so it can be stored with the pending request
/// and later with the session.
#[derive(Clone)]
pub struct DpopKey {
    secret: SecretKey,
}

impl std::fmt::Debug for DpopKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpopKey").finish_non_exhaustive()
    }
}

impl DpopKey {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    pub fn from_jwk_str(jwk: &str) -> Result<Self, SigningError> {
        let secret =
            SecretKey::from_jwk_str(jwk).map_err(|e| SigningError::Key(e.to_string()))?;
        Ok(Self { secret })
    }

    pub fn to_jwk_string(&self) -> String {
        self.secret.to_jwk_string().to_string()
    }

    pub fn public_jwk(&self) -> JwkEcKey {
        self.secret.public_key().to_jwk()
    }

    pub fn thumbprint(&self) -> Result<String, SigningError> {
        jwk_thumbprint(&self.public_jwk())
    }

    pub(crate) fn signing_key(&self) -> SigningKey {
        SigningKey::from(&self.secret)
    }
}

/// RFC 7638 thumbprint of an EC public key.
pub fn jwk_thumbprint(jwk: &JwkEcKey) -> Result<String, SigningError> {
    let value = serde_json::to_value(jwk)?;
    let member = |name: &str| {
        value
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| SigningError::Key(format!("JWK is missing `{name}`")))
    };

    // members in lexicographic order, no whitespace
    let canonical = format!(
        r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
        member("crv")?,
        member("x")?,
        member("y")?
    );

    use ring::digest::{digest, SHA256};
    Ok(base64_url_encode(
        digest(&SHA256, canonical.as_bytes()).as_ref(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dpop_key_survives_storage() {
        let key = DpopKey::generate();
        let stored = key.to_jwk_string();

        let restored = DpopKey::from_jwk_str(&stored).unwrap();
        assert_eq!(
            key.thumbprint().unwrap(),
            restored.thumbprint().unwrap()
        );
        assert!(stored.contains("\"d\""));
    }

    #[test]
    fn garbage_jwk_is_a_signing_error() {
        let err = DpopKey::from_jwk_str("{\"kty\":\"EC\"}").unwrap_err();
        assert!(matches!(err, SigningError::Key(_)));
    }

    #[test]
    fn client_key_loads_from_base64_pem() {
        let generated = ClientKeys::generate().unwrap();
        let loaded = ClientKeys::from_base64_pem(&generated.to_base64_pem()).unwrap();

        assert_eq!(generated.kid(), loaded.kid());
    }

    #[test]
    fn public_jwk_never_leaks_the_private_scalar() {
        let keys = ClientKeys::generate().unwrap();
        let jwks = keys.jwks().unwrap();
        let jwk = &jwks["keys"][0];

        assert_eq!(jwk["kty"], "EC");
        assert_eq!(jwk["crv"], "P-256");
        assert_eq!(jwk["alg"], "ES256");
        assert_eq!(jwk["kid"], keys.kid());
        assert!(jwk.get("d").is_none());
    }

    #[test]
    fn invalid_client_key_is_a_config_error() {
        let err = ClientKeys::from_base64_pem("not base64!").unwrap_err();
        assert!(matches!(err, OAuthError::Config(_)));
    }

    #[test]
    fn thumbprint_matches_rfc7638_example_shape() {
        let key = DpopKey::generate();
        let thumbprint = key.thumbprint().unwrap();
        // 32 byte digest, base64url without padding
        assert_eq!(thumbprint.len(), 43);
        assert!(!thumbprint.contains('='));
    }
}
