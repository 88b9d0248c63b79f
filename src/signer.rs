use p256::ecdsa::{Signature, SigningKey, signature::Signer as _};
use p256::pkcs8::DecodePrivateKey;

use crate::error::BuilderError;

/// The signer holds the pkcs8 key used to sign proposals and envelopes with ECDSA P-256.
/// In the test network the key is found in
/// `organizations/peerOrganizations/org1.example.com/users/User1@org1.example.com/msp/keystore/priv_sk`
///
/// # Example
/// ```rust,ignore
/// use fabric_gateway_rust::signer::Signer;
///
/// let signer = Signer::from_pem(std::fs::read(keystore_path)?)?;
/// ```
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    pub fn from_pem(pem_bytes: impl AsRef<[u8]>) -> Result<Self, BuilderError> {
        let pem = std::str::from_utf8(pem_bytes.as_ref())
            .map_err(|_| BuilderError::InvalidParameter("key is not valid UTF-8 PEM".into()))?;
        let key = SigningKey::from_pkcs8_pem(pem)
            .map_err(|err| BuilderError::InvalidParameter(format!("invalid pkcs8 key: {}", err)))?;
        Ok(Signer { key })
    }

    /// Signs the SHA-256 digest of `message` and returns a DER signature.
    ///
    /// Fabric rejects high-S signatures, so S is always normalized.
    pub fn sign_message(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.key.sign(message);
        let signature = signature.normalize_s().unwrap_or(signature);
        signature.to_der().as_bytes().to_vec()
    }

    #[cfg(test)]
    pub(crate) fn verifying_key(&self) -> p256::ecdsa::VerifyingKey {
        self.key.verifying_key().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Verifier;
    use p256::pkcs8::{EncodePrivateKey, LineEnding};

    fn test_signer() -> Signer {
        let key = SigningKey::from_bytes(&[7u8; 32].into()).unwrap();
        let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
        Signer::from_pem(pem.as_bytes()).unwrap()
    }

    #[test]
    fn signatures_verify_and_are_low_s() {
        let signer = test_signer();
        let der = signer.sign_message(b"proposal bytes");
        let signature = Signature::from_der(&der).unwrap();
        assert!(signature.normalize_s().is_none());
        signer
            .verifying_key()
            .verify(b"proposal bytes", &signature)
            .unwrap();
    }

    #[test]
    fn rejects_garbage_keys() {
        assert!(Signer::from_pem(b"not a key").is_err());
    }
}
