use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_KEY_ENV: &str = "TURBO_REMOTE_CACHE_SIGNATURE_KEY";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature secret key not found. Set {SIGNATURE_KEY_ENV}")]
    NoSignatureSecretKey,
    #[error("base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Signs and verifies remote artifact bodies.
///
/// The tag is `base64(hmac-sha256(key, team_id || hash || body))`, carried in
/// the `x-artifact-tag` header. The key comes from
/// `TURBO_REMOTE_CACHE_SIGNATURE_KEY` and never leaves the machine.
pub struct ArtifactSignatureAuthenticator {
    pub team_id: Vec<u8>,
    /// Test seam; production reads the environment.
    pub secret_key_override: Option<Vec<u8>>,
}

impl ArtifactSignatureAuthenticator {
    pub fn new(team_id: Vec<u8>, secret_key_override: Option<Vec<u8>>) -> Self {
        Self {
            team_id,
            secret_key_override,
        }
    }

    fn secret_key(&self) -> Result<Vec<u8>, SignatureError> {
        if let Some(key) = &self.secret_key_override {
            return Ok(key.clone());
        }
        std::env::var(SIGNATURE_KEY_ENV)
            .map(String::into_bytes)
            .map_err(|_| SignatureError::NoSignatureSecretKey)
    }

    fn construct_mac(&self, hash: &[u8], artifact_body: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret_key()?)
            .expect("hmac accepts keys of any length");
        mac.update(&self.team_id);
        mac.update(hash);
        mac.update(artifact_body);
        Ok(mac)
    }

    pub fn generate_tag(&self, hash: &[u8], artifact_body: &[u8]) -> Result<String, SignatureError> {
        let mac = self.construct_mac(hash, artifact_body)?;
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    pub fn validate(
        &self,
        hash: &[u8],
        artifact_body: &[u8],
        expected_tag: &str,
    ) -> Result<bool, SignatureError> {
        let expected = STANDARD.decode(expected_tag)?;
        let mac = self.construct_mac(hash, artifact_body)?;
        Ok(mac.verify_slice(&expected).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    fn authenticator() -> ArtifactSignatureAuthenticator {
        ArtifactSignatureAuthenticator::new(
            b"my-team".to_vec(),
            Some(b"secret-key".to_vec()),
        )
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let auth = authenticator();
        let tag = auth.generate_tag(b"some-hash", b"archive bytes")?;
        assert!(auth.validate(b"some-hash", b"archive bytes", &tag)?);
        Ok(())
    }

    #[test]
    fn test_tampered_body_fails() -> Result<()> {
        let auth = authenticator();
        let tag = auth.generate_tag(b"some-hash", b"archive bytes")?;
        assert!(!auth.validate(b"some-hash", b"tampered bytes", &tag)?);
        Ok(())
    }

    #[test]
    fn test_wrong_hash_fails() -> Result<()> {
        let auth = authenticator();
        let tag = auth.generate_tag(b"some-hash", b"archive bytes")?;
        assert!(!auth.validate(b"other-hash", b"archive bytes", &tag)?);
        Ok(())
    }

    #[test]
    fn test_wrong_key_fails() -> Result<()> {
        let auth = authenticator();
        let tag = auth.generate_tag(b"some-hash", b"archive bytes")?;

        let other = ArtifactSignatureAuthenticator::new(
            b"my-team".to_vec(),
            Some(b"different-key".to_vec()),
        );
        assert!(!other.validate(b"some-hash", b"archive bytes", &tag)?);
        Ok(())
    }
}
