//! Fabric network adapter over tonic channels.
//!
//! Speaks the peer `Endorser` and orderer `AtomicBroadcast` services directly
//! with prost messages. Ledger reads go through the system chaincodes.

use std::{collections::HashMap, sync::Arc, sync::Once, time::Duration};

use async_trait::async_trait;
use prost::Message;
use tonic::{
    Code, Request, Status,
    client::Grpc,
    codec::ProstCodec,
    codegen::http::uri::PathAndQuery,
    transport::{Certificate, Channel, ClientTlsConfig},
};
use tracing::{debug, trace};

use crate::{
    aggregator::EndorsedEnvelope,
    commit::{CommitEvent, CommitSource},
    config::{Endpoint, GatewayConfig},
    error::{BuilderError, ClientError},
    fabric::{
        common::{Block, BlockchainInfo, Envelope, Payload, STATUS_SUCCESS},
        orderer::BroadcastResponse,
        protos::{
            self, ChaincodeActionPayload, ChaincodeEndorsedAction, ChaincodeQueryResponse,
            ChannelQueryResponse, ProcessedTransaction, SignedProposal, Transaction,
            TransactionAction,
        },
    },
    orderer::OrdererClient,
    peer::{
        BlockInfo, ChaincodeInfo, ChannelInfo, Endorsement, LedgerQuery, LedgerRecord, PeerClient,
        PeerId, PeerTarget, ProposalResponse, TransactionInfo,
    },
    request::split_chaincode_id,
    signer::Signer,
    transaction::{Proposal, ProposalBuilder},
};

const PROCESS_PROPOSAL: &str = "/protos.Endorser/ProcessProposal";
const BROADCAST: &str = "/orderer.AtomicBroadcast/Broadcast";

const QUERY_CHAINCODE: &str = "qscc";
const CONFIGURATION_CHAINCODE: &str = "cscc";
const LIFECYCLE_CHAINCODE: &str = "lscc";

static CRYPTO_PROVIDER: Once = Once::new();

fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        // Another component of the process may have installed one already.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// [`PeerClient`], [`OrdererClient`] and polling [`CommitSource`] for a real
/// Fabric network.
///
/// Channels connect lazily, so building never touches the network.
pub struct GrpcNetwork {
    config: Arc<GatewayConfig>,
    signer: Signer,
    peers: HashMap<PeerId, Channel>,
    orderer: Channel,
}

impl GrpcNetwork {
    pub fn new(config: Arc<GatewayConfig>, signer: Signer) -> Result<GrpcNetwork, BuilderError> {
        install_crypto_provider();
        let mut peers = HashMap::with_capacity(config.peers().len());
        for peer in config.peers() {
            peers.insert(peer.id.clone(), connect_lazy(&peer.endpoint)?);
        }
        let orderer = connect_lazy(config.orderer())?;
        Ok(GrpcNetwork {
            config,
            signer,
            peers,
            orderer,
        })
    }

    fn channel(&self, peer: &PeerId) -> Result<Channel, ClientError> {
        match self.peers.get(peer) {
            Some(channel) => Ok(channel.clone()),
            None => Err(ClientError::Transport(format!("no connection for peer {}", peer))),
        }
    }

    async fn process(
        &self,
        peer: &PeerId,
        proposal: &Proposal,
        timeout: Duration,
    ) -> Result<protos::ProposalResponse, ClientError> {
        let signed = proposal.sign(&self.signer);
        trace!(%peer, tx_id = proposal.transaction_id(), "sending proposal");
        unary::<SignedProposal, protos::ProposalResponse>(
            self.channel(peer)?,
            PROCESS_PROPOSAL,
            signed,
            timeout,
        )
        .await
    }

    /// Runs a system chaincode function and returns its response payload.
    async fn system_query(
        &self,
        peer: &PeerId,
        channel: &str,
        chaincode: &str,
        function: &str,
        args: Vec<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Vec<u8>, ClientError> {
        let mut builder = ProposalBuilder::new(self.config.identity().clone());
        if !channel.is_empty() {
            builder = builder.with_channel_name(channel).map_err(malformed)?;
        }
        let proposal = builder
            .with_chaincode_id(chaincode)
            .and_then(|builder| builder.with_function_name(function))
            .and_then(|builder| builder.with_function_args(args))
            .and_then(|builder| builder.build())
            .map_err(malformed)?;
        let response = self.process(peer, &proposal, timeout).await?;
        match response.response {
            Some(response) if response.status == STATUS_SUCCESS => Ok(response.payload),
            Some(response) => Err(rejection(response.status, response.message)),
            None => Err(ClientError::Malformed(format!(
                "{} {} answered without a response",
                chaincode, function
            ))),
        }
    }
}

#[async_trait]
impl PeerClient for GrpcNetwork {
    async fn propose(
        &self,
        peer: &PeerId,
        proposal: &Proposal,
        timeout: Duration,
    ) -> Result<ProposalResponse, ClientError> {
        let response = self.process(peer, proposal, timeout).await?;
        let (status, message, result) = match response.response {
            Some(response) => (response.status, response.message, response.payload),
            None => {
                return Err(ClientError::Malformed(
                    "proposal response without chaincode response".into(),
                ));
            }
        };
        let endorsement = match response.endorsement {
            Some(endorsement) => Endorsement {
                endorser: endorsement.endorser,
                signature: endorsement.signature,
            },
            None => Endorsement {
                endorser: vec![],
                signature: vec![],
            },
        };
        Ok(ProposalResponse {
            peer: peer.clone(),
            status,
            message,
            payload: response.payload,
            endorsement,
            result,
        })
    }

    async fn query_installed(
        &self,
        peer: &PeerId,
        timeout: Duration,
    ) -> Result<Vec<ChaincodeInfo>, ClientError> {
        let payload = self
            .system_query(peer, "", LIFECYCLE_CHAINCODE, "getinstalledchaincodes", vec![], timeout)
            .await?;
        let response = ChaincodeQueryResponse::decode(payload.as_slice()).map_err(malformed)?;
        Ok(response.chaincodes.into_iter().map(chaincode_info).collect())
    }

    async fn query_ledger(
        &self,
        peer: &PeerId,
        channel: &str,
        query: &LedgerQuery,
        timeout: Duration,
    ) -> Result<LedgerRecord, ClientError> {
        let channel_arg = channel.as_bytes().to_vec();
        match query {
            LedgerQuery::Channels => {
                let payload = self
                    .system_query(peer, "", CONFIGURATION_CHAINCODE, "GetChannels", vec![], timeout)
                    .await?;
                let response = ChannelQueryResponse::decode(payload.as_slice()).map_err(malformed)?;
                Ok(LedgerRecord::Channels(
                    response.channels.into_iter().map(|c| c.channel_id).collect(),
                ))
            }
            LedgerQuery::InstantiatedChaincodes => {
                let payload = self
                    .system_query(
                        peer,
                        channel,
                        LIFECYCLE_CHAINCODE,
                        "getchaincodes",
                        vec![],
                        timeout,
                    )
                    .await?;
                let response =
                    ChaincodeQueryResponse::decode(payload.as_slice()).map_err(malformed)?;
                Ok(LedgerRecord::Chaincodes(
                    response.chaincodes.into_iter().map(chaincode_info).collect(),
                ))
            }
            LedgerQuery::BlockByNumber(number) => {
                let args = vec![channel_arg, number.to_string().into_bytes()];
                let payload = self
                    .system_query(peer, channel, QUERY_CHAINCODE, "GetBlockByNumber", args, timeout)
                    .await?;
                Ok(LedgerRecord::Block(block_info(&payload)?))
            }
            LedgerQuery::BlockByHash(hash) => {
                let args = vec![channel_arg, hash.clone()];
                let payload = self
                    .system_query(peer, channel, QUERY_CHAINCODE, "GetBlockByHash", args, timeout)
                    .await?;
                Ok(LedgerRecord::Block(block_info(&payload)?))
            }
            LedgerQuery::TransactionById(tx_id) => {
                let args = vec![channel_arg, tx_id.as_bytes().to_vec()];
                let payload = self
                    .system_query(
                        peer,
                        channel,
                        QUERY_CHAINCODE,
                        "GetTransactionByID",
                        args,
                        timeout,
                    )
                    .await?;
                let processed =
                    ProcessedTransaction::decode(payload.as_slice()).map_err(malformed)?;
                Ok(LedgerRecord::Transaction(TransactionInfo {
                    transaction_id: tx_id.clone(),
                    validation_code: processed.validation_code,
                    envelope: processed
                        .transaction_envelope
                        .map(|envelope| envelope.encode_to_vec())
                        .unwrap_or_default(),
                }))
            }
            LedgerQuery::Chaincode { chaincode_id, args } => {
                let (name, version) = split_chaincode_id(chaincode_id);
                let (function, rest) = match args.split_first() {
                    Some((function, rest)) => (function.as_str(), rest),
                    None => {
                        return Err(ClientError::Malformed(
                            "chaincode query without function".into(),
                        ));
                    }
                };
                let proposal = ProposalBuilder::new(self.config.identity().clone())
                    .with_channel_name(channel)
                    .and_then(|builder| builder.with_chaincode_id(name))
                    .and_then(|builder| builder.with_chaincode_version(version))
                    .and_then(|builder| builder.with_function_name(function))
                    .and_then(|builder| builder.with_function_args(rest.iter().map(String::as_str)))
                    .and_then(|builder| builder.build())
                    .map_err(malformed)?;
                let response = self.propose(peer, &proposal, timeout).await?;
                if !response.is_success() {
                    return Err(rejection(response.status, response.message));
                }
                Ok(LedgerRecord::Payload(response.result))
            }
        }
    }

    async fn get_channel_info(
        &self,
        peer: &PeerId,
        channel: &str,
        timeout: Duration,
    ) -> Result<ChannelInfo, ClientError> {
        let args = vec![channel.as_bytes().to_vec()];
        let payload = self
            .system_query(peer, channel, QUERY_CHAINCODE, "GetChainInfo", args, timeout)
            .await?;
        let info = BlockchainInfo::decode(payload.as_slice()).map_err(malformed)?;
        Ok(ChannelInfo {
            height: info.height,
            current_block_hash: hex::encode(info.current_block_hash),
            previous_block_hash: hex::encode(info.previous_block_hash),
        })
    }
}

#[async_trait]
impl OrdererClient for GrpcNetwork {
    async fn submit(
        &self,
        envelope: &EndorsedEnvelope,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let transaction = transaction_envelope(envelope, &self.signer)?;
        let mut grpc = Grpc::new(self.orderer.clone());
        grpc.ready()
            .await
            .map_err(|err| ClientError::Transport(format!("orderer not ready: {}", err)))?;
        let mut request = Request::new(futures_util::stream::iter(vec![transaction]));
        request.set_timeout(timeout);
        let response = grpc
            .streaming(
                request,
                PathAndQuery::from_static(BROADCAST),
                ProstCodec::<Envelope, BroadcastResponse>::default(),
            )
            .await
            .map_err(status_error)?;
        let mut inbound = response.into_inner();
        match inbound.message().await.map_err(status_error)? {
            Some(reply) if reply.status == STATUS_SUCCESS => {
                debug!(tx_id = envelope.transaction_id(), "broadcast acknowledged");
                Ok(())
            }
            Some(reply) => Err(ClientError::Rejected {
                status: reply.status,
                message: reply.info,
            }),
            None => Err(ClientError::Transport(
                "orderer closed the broadcast stream without a reply".into(),
            )),
        }
    }
}

#[async_trait]
impl CommitSource for GrpcNetwork {
    async fn poll(
        &self,
        channel: &str,
        transaction_id: &str,
    ) -> Result<Option<CommitEvent>, ClientError> {
        let peers = self
            .config
            .resolve_query_peers(channel, &PeerTarget::Default)
            .map_err(|err| ClientError::Transport(err.message))?;
        let peer = peers.first();
        let timeout = self.config.timeouts().query;
        let query = LedgerQuery::TransactionById(transaction_id.to_string());
        let transaction = match self.query_ledger(peer, channel, &query, timeout).await {
            Ok(LedgerRecord::Transaction(transaction)) => transaction,
            Ok(_) => return Err(ClientError::Malformed("unexpected ledger record".into())),
            Err(ClientError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let args = vec![channel.as_bytes().to_vec(), transaction_id.as_bytes().to_vec()];
        let payload = self
            .system_query(peer, channel, QUERY_CHAINCODE, "GetBlockByTxID", args, timeout)
            .await?;
        let block = block_info(&payload)?;
        Ok(Some(CommitEvent {
            transaction_id: transaction.transaction_id,
            block_number: block.number,
            validation_code: transaction.validation_code,
        }))
    }
}

fn connect_lazy(endpoint: &Endpoint) -> Result<Channel, BuilderError> {
    let mut builder = Channel::from_shared(endpoint.url.clone())
        .map_err(|err| BuilderError::InvalidParameter(format!("{}: {}", endpoint.url, err)))?;
    if let Some(ca) = &endpoint.tls_ca {
        let mut tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca));
        if let Some(domain) = &endpoint.tls_domain {
            tls = tls.domain_name(domain.clone());
        }
        builder = builder
            .tls_config(tls)
            .map_err(|err| BuilderError::InvalidParameter(err.to_string()))?;
    }
    Ok(builder.connect_lazy())
}

async fn unary<Req, Resp>(
    channel: Channel,
    path: &'static str,
    message: Req,
    timeout: Duration,
) -> Result<Resp, ClientError>
where
    Req: Message + Send + Sync + 'static,
    Resp: Message + Default + Send + Sync + 'static,
{
    let mut grpc = Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|err| ClientError::Transport(format!("peer not ready: {}", err)))?;
    let mut request = Request::new(message);
    request.set_timeout(timeout);
    let response = grpc
        .unary(request, PathAndQuery::from_static(path), ProstCodec::<Req, Resp>::default())
        .await
        .map_err(status_error)?;
    Ok(response.into_inner())
}

/// Signed endorser transaction for the ordering service.
fn transaction_envelope(
    envelope: &EndorsedEnvelope,
    signer: &Signer,
) -> Result<Envelope, ClientError> {
    let proposal = envelope.proposal();
    let header = proposal.header();
    let endorsed_action = ChaincodeEndorsedAction {
        proposal_response_payload: envelope.payload().to_vec(),
        endorsements: envelope
            .endorsements()
            .iter()
            .map(|response| protos::Endorsement {
                endorser: response.endorsement.endorser.clone(),
                signature: response.endorsement.signature.clone(),
            })
            .collect(),
    };
    let action_payload = ChaincodeActionPayload {
        chaincode_proposal_payload: proposal.payload_bytes(false),
        action: Some(endorsed_action),
    };
    let transaction = Transaction {
        actions: vec![TransactionAction {
            header: header.signature_header.clone(),
            payload: action_payload.encode_to_vec(),
        }],
    };
    let payload = Payload {
        header: Some(header),
        data: transaction.encode_to_vec(),
    }
    .encode_to_vec();
    let signature = signer.sign_message(&payload);
    Ok(Envelope { payload, signature })
}

fn block_info(payload: &[u8]) -> Result<BlockInfo, ClientError> {
    let block = Block::decode(payload).map_err(malformed)?;
    let header = match block.header {
        Some(header) => header,
        None => return Err(ClientError::Malformed("block without header".into())),
    };
    Ok(BlockInfo {
        number: header.number,
        previous_hash: hex::encode(header.previous_hash),
        data_hash: hex::encode(header.data_hash),
        transaction_count: block.data.map(|data| data.data.len()).unwrap_or_default(),
    })
}

fn chaincode_info(info: protos::ChaincodeInfo) -> ChaincodeInfo {
    ChaincodeInfo {
        name: info.name,
        version: info.version,
        path: info.path,
    }
}

fn malformed(err: impl std::fmt::Display) -> ClientError {
    ClientError::Malformed(err.to_string())
}

fn is_not_found(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("not found") || message.contains("no such")
}

fn rejection(status: i32, message: String) -> ClientError {
    if is_not_found(&message) {
        ClientError::NotFound(message)
    } else {
        ClientError::Rejected { status, message }
    }
}

fn status_error(status: Status) -> ClientError {
    let message = status.message().to_string();
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled | Code::ResourceExhausted => {
            ClientError::Transport(message)
        }
        Code::NotFound => ClientError::NotFound(message),
        code => rejection(code as i32, message),
    }
}
