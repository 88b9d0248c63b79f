use std::{collections::HashMap, time::SystemTime};

use prost::Message;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{
    error::BuilderError,
    fabric::{
        common::{ChannelHeader, HEADER_TYPE_ENDORSER_TRANSACTION, Header, SignatureHeader},
        protos::{
            CHAINCODE_TYPE_GOLANG, ChaincodeHeaderExtension, ChaincodeId, ChaincodeInput,
            ChaincodeInvocationSpec, ChaincodeProposalPayload, ChaincodeSpec, SignedProposal,
        },
    },
    identity::Identity,
    signer::Signer,
};

pub(crate) const NONCE_LENGTH: usize = 24;

/// A transaction attempt before endorsement.
///
/// Immutable once built. The transaction id is derived from the nonce and the
/// submitter, so two proposals never share an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    channel_name: String,
    chaincode_name: String,
    chaincode_version: String,
    function_name: String,
    function_args: Vec<Vec<u8>>,
    transient: HashMap<String, Vec<u8>>,
    creator: Identity,
    nonce: [u8; NONCE_LENGTH],
    transaction_id: String,
    timestamp: SystemTime,
}

impl Proposal {
    /// Empty for channel-less proposals such as chaincode install.
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn chaincode_name(&self) -> &str {
        &self.chaincode_name
    }

    pub fn chaincode_version(&self) -> &str {
        &self.chaincode_version
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn function_args(&self) -> &[Vec<u8>] {
        &self.function_args
    }

    pub fn creator(&self) -> &Identity {
        &self.creator
    }

    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    fn chaincode_id(&self) -> ChaincodeId {
        ChaincodeId {
            path: String::default(),
            name: self.chaincode_name.clone(),
            version: self.chaincode_version.clone(),
        }
    }

    /// Serialized `Header` shared by the proposal and the envelope built from it.
    pub(crate) fn header_bytes(&self) -> Vec<u8> {
        self.header().encode_to_vec()
    }

    pub(crate) fn header(&self) -> Header {
        let creator = self.creator.to_bytes();
        let signature_header = SignatureHeader {
            creator,
            nonce: self.nonce.to_vec(),
        };

        let tls_cert_hash = Sha256::digest(self.creator.certificate()).to_vec();
        let extension = ChaincodeHeaderExtension {
            chaincode_id: Some(self.chaincode_id()),
        };
        let channel_header = ChannelHeader {
            r#type: HEADER_TYPE_ENDORSER_TRANSACTION,
            version: 1,
            timestamp: Some(self.timestamp.into()),
            channel_id: self.channel_name.clone(),
            tx_id: self.transaction_id.clone(),
            epoch: 0,
            extension: extension.encode_to_vec(),
            tls_cert_hash,
        };

        Header {
            channel_header: channel_header.encode_to_vec(),
            signature_header: signature_header.encode_to_vec(),
        }
    }

    /// Serialized `ChaincodeProposalPayload`. Transient data is stripped when
    /// the payload is embedded in a transaction.
    pub(crate) fn payload_bytes(&self, include_transient: bool) -> Vec<u8> {
        let mut args = Vec::with_capacity(self.function_args.len() + 1);
        args.push(self.function_name.as_bytes().to_vec());
        args.extend(self.function_args.iter().cloned());

        let chaincode_spec = ChaincodeSpec {
            r#type: CHAINCODE_TYPE_GOLANG,
            chaincode_id: Some(self.chaincode_id()),
            input: Some(ChaincodeInput {
                args,
                decorations: HashMap::default(),
                is_init: false,
            }),
            timeout: 0,
        };
        let invocation = ChaincodeInvocationSpec {
            chaincode_spec: Some(chaincode_spec),
        };
        let transient_map = if include_transient {
            self.transient.clone()
        } else {
            HashMap::default()
        };
        ChaincodeProposalPayload {
            input: invocation.encode_to_vec(),
            transient_map,
        }
        .encode_to_vec()
    }

    /// Wire form of the proposal, signed by `signer`.
    pub(crate) fn sign(&self, signer: &Signer) -> SignedProposal {
        let extension = ChaincodeHeaderExtension {
            chaincode_id: Some(self.chaincode_id()),
        };
        let proposal = crate::fabric::protos::Proposal {
            header: self.header_bytes(),
            payload: self.payload_bytes(true),
            extension: extension.encode_to_vec(),
        };
        let proposal_bytes = proposal.encode_to_vec();
        let signature = signer.sign_message(&proposal_bytes);
        SignedProposal {
            proposal_bytes,
            signature,
        }
    }
}

pub struct ProposalBuilder {
    creator: Identity,
    channel_name: Option<String>,
    chaincode_name: Option<String>,
    chaincode_version: String,
    function_name: Option<String>,
    function_args: Vec<Vec<u8>>,
    transient: HashMap<String, Vec<u8>>,
}

impl ProposalBuilder {
    pub fn new(creator: Identity) -> ProposalBuilder {
        ProposalBuilder {
            creator,
            channel_name: None,
            chaincode_name: None,
            chaincode_version: String::new(),
            function_name: None,
            function_args: vec![],
            transient: HashMap::default(),
        }
    }

    pub fn with_channel_name(
        mut self,
        name: impl Into<String>,
    ) -> Result<ProposalBuilder, BuilderError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(BuilderError::InvalidParameter(
                "channel name cannot be empty".into(),
            ));
        }
        self.channel_name = Some(name);
        Ok(self)
    }

    pub fn with_chaincode_id(
        mut self,
        id: impl Into<String>,
    ) -> Result<ProposalBuilder, BuilderError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(BuilderError::InvalidParameter("id cannot be empty".into()));
        }
        self.chaincode_name = Some(id);
        Ok(self)
    }

    pub fn with_chaincode_version(
        mut self,
        version: impl Into<String>,
    ) -> Result<ProposalBuilder, BuilderError> {
        self.chaincode_version = version.into().trim().to_string();
        Ok(self)
    }

    pub fn with_function_name(
        mut self,
        name: impl Into<String>,
    ) -> Result<ProposalBuilder, BuilderError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(BuilderError::InvalidParameter(
                "function name cannot be empty".into(),
            ));
        }
        self.function_name = Some(name);
        Ok(self)
    }

    pub fn with_function_args<I, A>(mut self, args: I) -> Result<ProposalBuilder, BuilderError>
    where
        I: IntoIterator<Item = A>,
        A: Into<Vec<u8>>,
    {
        self.function_args = args.into_iter().map(Into::into).collect();
        Ok(self)
    }

    pub fn with_transient(
        mut self,
        transient: HashMap<String, Vec<u8>>,
    ) -> Result<ProposalBuilder, BuilderError> {
        self.transient = transient;
        Ok(self)
    }

    /// Builds the proposal. Without a channel name the proposal is channel-less.
    pub fn build(self) -> Result<Proposal, BuilderError> {
        let chaincode_name = match self.chaincode_name {
            Some(chaincode_name) => chaincode_name,
            None => return Err(BuilderError::MissingParameter("chaincode_id".into())),
        };
        let function_name = match self.function_name {
            Some(function_name) => function_name,
            None => return Err(BuilderError::MissingParameter("function_name".into())),
        };
        let nonce = generate_nonce();
        let transaction_id = generate_transaction_id(&nonce, &self.creator.to_bytes());
        Ok(Proposal {
            channel_name: self.channel_name.unwrap_or_default(),
            chaincode_name,
            chaincode_version: self.chaincode_version,
            function_name,
            function_args: self.function_args,
            transient: self.transient,
            creator: self.creator,
            nonce,
            transaction_id,
            timestamp: SystemTime::now(),
        })
    }
}

pub(crate) fn generate_nonce() -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Creates a unique transaction ID by concatenating a nonce with an identity
/// and then hashing the result.
///
/// # Arguments
/// * `nonce` - A byte slice representing a random nonce.
/// * `creator` - A byte slice representing the identity of the creator in serialized format.
///
/// # Returns
/// A string representing the hashed transaction ID, encoded in hexadecimal format.
pub(crate) fn generate_transaction_id(nonce: &[u8], creator: &[u8]) -> String {
    let salted_creator = [nonce, creator].concat();
    hex::encode(Sha256::digest(salted_creator.as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fabric::common::Header, identity::IdentityBuilder};

    fn identity() -> Identity {
        IdentityBuilder::from_pem(b"cert")
            .with_msp("Org1MSP")
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn transaction_id_is_hash_of_nonce_and_creator() {
        let proposal = ProposalBuilder::new(identity())
            .with_channel_name("mychannel")
            .unwrap()
            .with_chaincode_id("basic")
            .unwrap()
            .with_function_name("CreateAsset")
            .unwrap()
            .with_function_args(["asset1", "blue"])
            .unwrap()
            .build()
            .unwrap();
        let expected = generate_transaction_id(proposal.nonce(), &identity().to_bytes());
        assert_eq!(proposal.transaction_id(), expected);
        assert_eq!(proposal.transaction_id().len(), 64);
        assert_eq!(proposal.function_args().len(), 2);
    }

    #[test]
    fn each_build_gets_a_fresh_nonce() {
        let build = || {
            ProposalBuilder::new(identity())
                .with_chaincode_id("basic")
                .unwrap()
                .with_function_name("ReadAsset")
                .unwrap()
                .build()
                .unwrap()
        };
        assert_ne!(build().transaction_id(), build().transaction_id());
        assert_eq!(build().channel_name(), "");
    }

    #[test]
    fn missing_function_is_rejected() {
        let err = ProposalBuilder::new(identity())
            .with_chaincode_id("basic")
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(err, BuilderError::MissingParameter("function_name".into()));
    }

    #[test]
    fn header_carries_channel_and_transaction_id() {
        let proposal = ProposalBuilder::new(identity())
            .with_channel_name("mychannel")
            .unwrap()
            .with_chaincode_id("basic")
            .unwrap()
            .with_function_name("ReadAsset")
            .unwrap()
            .build()
            .unwrap();
        let header = Header::decode(proposal.header_bytes().as_slice()).unwrap();
        let channel_header = ChannelHeader::decode(header.channel_header.as_slice()).unwrap();
        assert_eq!(channel_header.channel_id, "mychannel");
        assert_eq!(channel_header.tx_id, proposal.transaction_id());
        assert_eq!(channel_header.r#type, HEADER_TYPE_ENDORSER_TRANSACTION);
        assert_eq!(proposal.header_bytes(), proposal.header_bytes());
    }
}
