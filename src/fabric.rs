//! Subset of the Fabric protobuf messages the gateway puts on the wire.
//!
//! Field tags follow `fabric-protos` (common, msp, peer and orderer packages).

use std::collections::HashMap;

pub(crate) mod common {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Header {
        #[prost(bytes = "vec", tag = "1")]
        pub channel_header: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub signature_header: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChannelHeader {
        #[prost(int32, tag = "1")]
        pub r#type: i32,
        #[prost(int32, tag = "2")]
        pub version: i32,
        #[prost(message, optional, tag = "3")]
        pub timestamp: Option<::prost_types::Timestamp>,
        #[prost(string, tag = "4")]
        pub channel_id: String,
        #[prost(string, tag = "5")]
        pub tx_id: String,
        #[prost(uint64, tag = "6")]
        pub epoch: u64,
        #[prost(bytes = "vec", tag = "7")]
        pub extension: Vec<u8>,
        #[prost(bytes = "vec", tag = "8")]
        pub tls_cert_hash: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SignatureHeader {
        #[prost(bytes = "vec", tag = "1")]
        pub creator: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub nonce: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Payload {
        #[prost(message, optional, tag = "1")]
        pub header: Option<Header>,
        #[prost(bytes = "vec", tag = "2")]
        pub data: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Envelope {
        #[prost(bytes = "vec", tag = "1")]
        pub payload: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub signature: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Block {
        #[prost(message, optional, tag = "1")]
        pub header: Option<BlockHeader>,
        #[prost(message, optional, tag = "2")]
        pub data: Option<BlockData>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BlockHeader {
        #[prost(uint64, tag = "1")]
        pub number: u64,
        #[prost(bytes = "vec", tag = "2")]
        pub previous_hash: Vec<u8>,
        #[prost(bytes = "vec", tag = "3")]
        pub data_hash: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BlockData {
        #[prost(bytes = "vec", repeated, tag = "1")]
        pub data: Vec<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BlockchainInfo {
        #[prost(uint64, tag = "1")]
        pub height: u64,
        #[prost(bytes = "vec", tag = "2")]
        pub current_block_hash: Vec<u8>,
        #[prost(bytes = "vec", tag = "3")]
        pub previous_block_hash: Vec<u8>,
    }

    pub const HEADER_TYPE_ENDORSER_TRANSACTION: i32 = 3;
    pub const STATUS_SUCCESS: i32 = 200;
}

pub(crate) mod msp {
    #[derive(Clone, PartialEq, Eq, ::prost::Message)]
    pub struct SerializedIdentity {
        #[prost(string, tag = "1")]
        pub mspid: String,
        #[prost(bytes = "vec", tag = "2")]
        pub id_bytes: Vec<u8>,
    }
}

pub(crate) mod protos {
    use super::HashMap;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SignedProposal {
        #[prost(bytes = "vec", tag = "1")]
        pub proposal_bytes: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub signature: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Proposal {
        #[prost(bytes = "vec", tag = "1")]
        pub header: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub payload: Vec<u8>,
        #[prost(bytes = "vec", tag = "3")]
        pub extension: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChaincodeHeaderExtension {
        #[prost(message, optional, tag = "2")]
        pub chaincode_id: Option<ChaincodeId>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChaincodeProposalPayload {
        #[prost(bytes = "vec", tag = "1")]
        pub input: Vec<u8>,
        #[prost(map = "string, bytes", tag = "2")]
        pub transient_map: HashMap<String, Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChaincodeId {
        #[prost(string, tag = "1")]
        pub path: String,
        #[prost(string, tag = "2")]
        pub name: String,
        #[prost(string, tag = "3")]
        pub version: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChaincodeInput {
        #[prost(bytes = "vec", repeated, tag = "1")]
        pub args: Vec<Vec<u8>>,
        #[prost(map = "string, bytes", tag = "2")]
        pub decorations: HashMap<String, Vec<u8>>,
        #[prost(bool, tag = "3")]
        pub is_init: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChaincodeSpec {
        #[prost(int32, tag = "1")]
        pub r#type: i32,
        #[prost(message, optional, tag = "2")]
        pub chaincode_id: Option<ChaincodeId>,
        #[prost(message, optional, tag = "3")]
        pub input: Option<ChaincodeInput>,
        #[prost(int32, tag = "4")]
        pub timeout: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChaincodeInvocationSpec {
        #[prost(message, optional, tag = "1")]
        pub chaincode_spec: Option<ChaincodeSpec>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChaincodeDeploymentSpec {
        #[prost(message, optional, tag = "1")]
        pub chaincode_spec: Option<ChaincodeSpec>,
        #[prost(bytes = "vec", tag = "3")]
        pub code_package: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Response {
        #[prost(int32, tag = "1")]
        pub status: i32,
        #[prost(string, tag = "2")]
        pub message: String,
        #[prost(bytes = "vec", tag = "3")]
        pub payload: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Endorsement {
        #[prost(bytes = "vec", tag = "1")]
        pub endorser: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub signature: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ProposalResponse {
        #[prost(int32, tag = "1")]
        pub version: i32,
        #[prost(message, optional, tag = "2")]
        pub timestamp: Option<::prost_types::Timestamp>,
        #[prost(message, optional, tag = "4")]
        pub response: Option<Response>,
        #[prost(bytes = "vec", tag = "5")]
        pub payload: Vec<u8>,
        #[prost(message, optional, tag = "6")]
        pub endorsement: Option<Endorsement>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Transaction {
        #[prost(message, repeated, tag = "1")]
        pub actions: Vec<TransactionAction>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TransactionAction {
        #[prost(bytes = "vec", tag = "1")]
        pub header: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub payload: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChaincodeActionPayload {
        #[prost(bytes = "vec", tag = "1")]
        pub chaincode_proposal_payload: Vec<u8>,
        #[prost(message, optional, tag = "2")]
        pub action: Option<ChaincodeEndorsedAction>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChaincodeEndorsedAction {
        #[prost(bytes = "vec", tag = "1")]
        pub proposal_response_payload: Vec<u8>,
        #[prost(message, repeated, tag = "2")]
        pub endorsements: Vec<Endorsement>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ProcessedTransaction {
        #[prost(message, optional, tag = "1")]
        pub transaction_envelope: Option<super::common::Envelope>,
        #[prost(int32, tag = "2")]
        pub validation_code: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChaincodeQueryResponse {
        #[prost(message, repeated, tag = "1")]
        pub chaincodes: Vec<ChaincodeInfo>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChaincodeInfo {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub version: String,
        #[prost(string, tag = "3")]
        pub path: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChannelQueryResponse {
        #[prost(message, repeated, tag = "1")]
        pub channels: Vec<ChannelInfo>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChannelInfo {
        #[prost(string, tag = "1")]
        pub channel_id: String,
    }

    pub const CHAINCODE_TYPE_GOLANG: i32 = 1;
}

pub(crate) mod orderer {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BroadcastResponse {
        #[prost(int32, tag = "1")]
        pub status: i32,
        #[prost(string, tag = "2")]
        pub info: String,
    }
}
