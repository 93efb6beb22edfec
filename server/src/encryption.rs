use std::io::{Cursor, Read, Write};
use std::iter;
use std::str::FromStr;
use std::sync::Arc;

use age::{x25519::Identity, Decryptor, Encryptor};
use color_eyre::eyre::{eyre, Result, WrapErr};

/// Age key used to protect tokens and private keys at rest.
#[derive(Clone)]
pub struct EncryptionConfig {
    pub key: Arc<Identity>,
}

impl EncryptionConfig {
    pub fn from_key_str(key: &str) -> Result<Self> {
        let key = Identity::from_str(key.trim())
            .map_err(|e| eyre!("Failed to parse ENCRYPTION_KEY: {}", e))?;
        Ok(Self { key: Arc::new(key) })
    }

    pub fn generate() -> Self {
        Self {
            key: Arc::new(Identity::generate()),
        }
    }

    pub async fn encrypt(&self, data: &str) -> Result<String> {
        encrypt(data, &self.key).await
    }

    pub async fn decrypt(&self, encrypted_base64: &str) -> Result<String> {
        decrypt(encrypted_base64, &self.key).await
    }
}

/// Encrypts a string to the identity's own recipient, base64 encoded for
/// storage in a text column.
pub async fn encrypt(data: &str, key: &Arc<Identity>) -> Result<String> {
    let data = data.as_bytes().to_vec();
    let key = key.clone();

    // age is CPU bound, keep it off the async workers
    let encrypted = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let recipient = key.to_public();
        let encryptor =
            Encryptor::with_recipients(iter::once(&recipient as &dyn age::Recipient))
                .map_err(|e| eyre!("Failed to create encryptor: {}", e))?;

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .wrap_err("Failed to create encrypted writer")?;
        writer
            .write_all(&data)
            .wrap_err("Failed to write data for encryption")?;
        writer.finish().wrap_err("Failed to finish encryption")?;

        Ok(encrypted)
    })
    .await??;

    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        &encrypted,
    ))
}

/// Reverses [`encrypt`].
pub async fn decrypt(encrypted_base64: &str, key: &Arc<Identity>) -> Result<String> {
    let encrypted =
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encrypted_base64)
            .wrap_err("Failed to decode base64 data")?;
    let key = key.clone();

    tokio::task::spawn_blocking(move || -> Result<String> {
        let decryptor = Decryptor::new(Cursor::new(encrypted))
            .map_err(|e| eyre!("Failed to create decryptor: {}", e))?;
        let mut reader = decryptor
            .decrypt(iter::once(key.as_ref() as &dyn age::Identity))
            .map_err(|e| eyre!("Failed to decrypt data: {}", e))?;

        let mut decrypted = String::new();
        reader
            .read_to_string(&mut decrypted)
            .wrap_err("Failed to read decrypted data")?;
        Ok(decrypted)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokens_survive_encryption() {
        let config = EncryptionConfig::generate();
        let token = "eyJhbGciOiJFUzI1NiJ9.access.token";

        let encrypted = config.encrypt(token).await.unwrap();
        assert_ne!(encrypted, token);
        assert!(!encrypted.contains("access"));

        assert_eq!(config.decrypt(&encrypted).await.unwrap(), token);
    }

    #[tokio::test]
    async fn a_different_key_cannot_decrypt() {
        let encrypted = EncryptionConfig::generate().encrypt("secret").await.unwrap();
        assert!(EncryptionConfig::generate().decrypt(&encrypted).await.is_err());
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(EncryptionConfig::from_key_str("AGE-SECRET-KEY-nope").is_err());
    }
}
