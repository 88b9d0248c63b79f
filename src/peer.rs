use std::{fmt, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{
    error::{ClientError, GatewayError, ResponseSummary},
    transaction::Proposal,
};

/// Name of a configured peer, e.g. `peer0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        PeerId(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a caller picks the peers of one request.
///
/// Peers can be addressed by name or by index into the configured peer list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PeerTarget {
    #[default]
    Default,
    Names(Vec<String>),
    Indices(Vec<usize>),
}

/// Ordered, duplicate free set of peers targeted by one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSet {
    peers: Vec<PeerId>,
}

impl PeerSet {
    pub fn new(peers: impl IntoIterator<Item = PeerId>) -> Result<Self, GatewayError> {
        let mut unique: Vec<PeerId> = vec![];
        for peer in peers {
            if !unique.contains(&peer) {
                unique.push(peer);
            }
        }
        if unique.is_empty() {
            return Err(GatewayError::validation("peer set cannot be empty"));
        }
        Ok(PeerSet { peers: unique })
    }

    pub fn first(&self) -> &PeerId {
        &self.peers[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    pub(crate) fn position(&self, peer: &PeerId) -> usize {
        self.peers
            .iter()
            .position(|p| p == peer)
            .unwrap_or(self.peers.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endorsement {
    /// Serialized identity of the endorsing peer.
    pub endorser: Vec<u8>,
    pub signature: Vec<u8>,
}

/// A single peer's answer to a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalResponse {
    pub peer: PeerId,
    pub status: i32,
    pub message: String,
    /// Proposal response payload (read-write set and chaincode response) the peer signed.
    pub payload: Vec<u8>,
    pub endorsement: Endorsement,
    /// Chaincode result handed back to the caller.
    pub result: Vec<u8>,
}

impl ProposalResponse {
    /// Fabric treats anything outside `[200, 400)` as an error response.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn payload_hash(&self) -> [u8; 32] {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&Sha256::digest(&self.payload));
        hash
    }

    pub fn summary(&self) -> ResponseSummary {
        ResponseSummary {
            peer: self.peer.clone(),
            status: self.status,
            message: self.message.clone(),
            payload_hash: hex::encode(self.payload_hash()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChaincodeInfo {
    pub name: String,
    pub version: String,
    pub path: String,
}

impl ChaincodeInfo {
    /// Matches `name` or `name@version`.
    pub fn matches(&self, id: &str) -> bool {
        match id.split_once('@') {
            Some((name, version)) => self.name == name && self.version == version,
            None => self.name == id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub height: u64,
    pub current_block_hash: String,
    pub previous_block_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub number: u64,
    pub previous_hash: String,
    pub data_hash: String,
    pub transaction_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionInfo {
    pub transaction_id: String,
    pub validation_code: i32,
    pub envelope: Vec<u8>,
}

/// Read request answered from one peer's ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerQuery {
    Channels,
    InstantiatedChaincodes,
    BlockByNumber(u64),
    BlockByHash(Vec<u8>),
    TransactionById(String),
    Chaincode { chaincode_id: String, args: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LedgerRecord {
    Channels(Vec<String>),
    Chaincodes(Vec<ChaincodeInfo>),
    Block(BlockInfo),
    Transaction(TransactionInfo),
    Payload(Vec<u8>),
}

/// Capability to talk to individual peers.
///
/// Implementations report transport problems as [`ClientError::Transport`] so
/// the gateway can retry them, and application level refusals as
/// [`ClientError::Rejected`].
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn propose(
        &self,
        peer: &PeerId,
        proposal: &Proposal,
        timeout: Duration,
    ) -> Result<ProposalResponse, ClientError>;

    async fn query_installed(
        &self,
        peer: &PeerId,
        timeout: Duration,
    ) -> Result<Vec<ChaincodeInfo>, ClientError>;

    async fn query_ledger(
        &self,
        peer: &PeerId,
        channel: &str,
        query: &LedgerQuery,
        timeout: Duration,
    ) -> Result<LedgerRecord, ClientError>;

    async fn get_channel_info(
        &self,
        peer: &PeerId,
        channel: &str,
        timeout: Duration,
    ) -> Result<ChannelInfo, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_set_keeps_order_and_drops_duplicates() {
        let set = PeerSet::new(["peer1", "peer0", "peer1"].map(PeerId::from)).unwrap();
        let ids: Vec<&str> = set.iter().map(PeerId::as_str).collect();
        assert_eq!(ids, vec!["peer1", "peer0"]);
        assert_eq!(set.first().as_str(), "peer1");
        assert!(PeerSet::new(Vec::<PeerId>::new()).is_err());
    }

    #[test]
    fn chaincode_id_matches_name_and_version() {
        let info = ChaincodeInfo {
            name: "cc1".into(),
            version: "1.0".into(),
            path: String::new(),
        };
        assert!(info.matches("cc1"));
        assert!(info.matches("cc1@1.0"));
        assert!(!info.matches("cc1@2.0"));
        assert!(!info.matches("cc2"));
    }
}
