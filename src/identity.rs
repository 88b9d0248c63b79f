use prost::Message;

use crate::{error::BuilderError, fabric::msp::SerializedIdentity};

/// Submitter identity: MSP id plus the PEM certificate of the signing user.
///
/// The gateway stamps this identity on every proposal it creates and on the
/// envelopes it assembles for the ordering service.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    inner: SerializedIdentity,
}

impl Identity {
    pub fn msp_id(&self) -> &str {
        &self.inner.mspid
    }

    pub fn certificate(&self) -> &[u8] {
        &self.inner.id_bytes
    }

    /// Protobuf encoding used as the `creator` field of signature headers.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.encode_to_vec()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("msp_id", &self.inner.mspid)
            .field("certificate_len", &self.inner.id_bytes.len())
            .finish()
    }
}

pub struct IdentityBuilder {
    msp: Option<String>,
    cert: Vec<u8>,
}

impl IdentityBuilder {
    pub fn from_pem(pem_bytes: &[u8]) -> IdentityBuilder {
        IdentityBuilder {
            msp: None,
            cert: pem_bytes.to_vec(),
        }
    }

    pub fn with_msp(mut self, msp: impl Into<String>) -> Result<IdentityBuilder, BuilderError> {
        let msp = msp.into().trim().to_string();
        if msp.is_empty() {
            return Err(BuilderError::InvalidParameter("msp cannot be empty".into()));
        }
        self.msp = Some(msp);
        Ok(self)
    }

    pub fn build(self) -> Result<Identity, BuilderError> {
        let mspid = match self.msp {
            Some(msp) => msp,
            None => return Err(BuilderError::MissingParameter("msp".into())),
        };
        if self.cert.is_empty() {
            return Err(BuilderError::InvalidParameter(
                "certificate cannot be empty".into(),
            ));
        }
        Ok(Identity {
            inner: SerializedIdentity {
                mspid,
                id_bytes: self.cert,
            },
        })
    }
}
