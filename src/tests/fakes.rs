use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, Once,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_channel::mpsc::{self, UnboundedSender};
use futures_util::StreamExt;
use lazy_static::lazy_static;

use crate::{
    aggregator::EndorsedEnvelope,
    commit::{CommitEvent, CommitSource, CommitStream},
    config::{Endpoint, GatewayConfig, GatewayConfigBuilder, RetryPolicy, Timeouts},
    error::ClientError,
    gateway::{Gateway, GatewayBuilder},
    identity::{Identity, IdentityBuilder},
    orderer::OrdererClient,
    peer::{
        ChaincodeInfo, ChannelInfo, Endorsement, LedgerQuery, LedgerRecord, PeerClient, PeerId,
        ProposalResponse,
    },
    transaction::Proposal,
};

lazy_static! {
    static ref INITIALIZER: Once = Once::new();
}

fn initialize() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn init_tracing() {
    INITIALIZER.call_once(initialize);
}

/// How a fake peer answers proposals.
#[derive(Debug, Clone)]
pub enum Script {
    Endorse(Vec<u8>),
    Reject(i32, String),
    /// Every attempt fails at the transport level.
    Unreachable,
    /// First attempt fails at the transport level, later ones endorse.
    FlakyThenEndorse(Vec<u8>),
    /// Never answers.
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalCall {
    pub peer: PeerId,
    pub chaincode: String,
    pub function: String,
    pub transaction_id: String,
}

#[derive(Default)]
pub struct FakePeers {
    scripts: Mutex<HashMap<PeerId, Script>>,
    proposals: Mutex<Vec<ProposalCall>>,
    installed: Mutex<HashMap<PeerId, Vec<ChaincodeInfo>>>,
    unreachable: Mutex<Vec<PeerId>>,
    ledger: Mutex<Vec<(LedgerQuery, LedgerRecord)>>,
    ledger_calls: Mutex<Vec<(PeerId, LedgerQuery)>>,
    channel_info: Mutex<Option<ChannelInfo>>,
}

impl FakePeers {
    pub fn new() -> Arc<FakePeers> {
        Arc::new(FakePeers::default())
    }

    pub fn script(&self, peer: &str, script: Script) {
        self.scripts.lock().unwrap().insert(PeerId::from(peer), script);
    }

    pub fn install(&self, peer: &str, name: &str, version: &str) {
        self.installed
            .lock()
            .unwrap()
            .entry(PeerId::from(peer))
            .or_default()
            .push(ChaincodeInfo {
                name: name.into(),
                version: version.into(),
                path: format!("github.com/example/{}", name),
            });
    }

    /// Every query to `peer` fails at the transport level.
    pub fn cut_off(&self, peer: &str) {
        self.unreachable.lock().unwrap().push(PeerId::from(peer));
    }

    pub fn answer(&self, query: LedgerQuery, record: LedgerRecord) {
        self.ledger.lock().unwrap().push((query, record));
    }

    pub fn set_channel_info(&self, info: ChannelInfo) {
        *self.channel_info.lock().unwrap() = Some(info);
    }

    pub fn proposals(&self) -> Vec<ProposalCall> {
        self.proposals.lock().unwrap().clone()
    }

    /// Attempts made against `peer`, retries included.
    pub fn attempts(&self, peer: &str) -> usize {
        self.proposals
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.peer.as_str() == peer)
            .count()
    }

    pub fn ledger_calls(&self) -> Vec<(PeerId, LedgerQuery)> {
        self.ledger_calls.lock().unwrap().clone()
    }

    fn is_unreachable(&self, peer: &PeerId) -> bool {
        self.unreachable.lock().unwrap().contains(peer)
    }
}

fn endorsement(peer: &PeerId, payload: &[u8]) -> ProposalResponse {
    ProposalResponse {
        peer: peer.clone(),
        status: 200,
        message: String::new(),
        payload: payload.to_vec(),
        endorsement: Endorsement {
            endorser: format!("{}-cert", peer).into_bytes(),
            signature: vec![0x30, 0x44, 0x02],
        },
        result: payload.to_vec(),
    }
}

#[async_trait]
impl PeerClient for FakePeers {
    async fn propose(
        &self,
        peer: &PeerId,
        proposal: &Proposal,
        _timeout: Duration,
    ) -> Result<ProposalResponse, ClientError> {
        let attempt = {
            let mut proposals = self.proposals.lock().unwrap();
            proposals.push(ProposalCall {
                peer: peer.clone(),
                chaincode: proposal.chaincode_name().to_string(),
                function: proposal.function_name().to_string(),
                transaction_id: proposal.transaction_id().to_string(),
            });
            proposals.iter().filter(|call| &call.peer == peer).count()
        };
        let script = self.scripts.lock().unwrap().get(peer).cloned();
        match script {
            Some(Script::Endorse(payload)) => Ok(endorsement(peer, &payload)),
            Some(Script::Reject(status, message)) => Ok(ProposalResponse {
                status,
                message,
                ..endorsement(peer, b"")
            }),
            Some(Script::FlakyThenEndorse(payload)) if attempt > 1 => {
                Ok(endorsement(peer, &payload))
            }
            Some(Script::FlakyThenEndorse(_)) | Some(Script::Unreachable) => {
                Err(ClientError::Transport("connection refused".into()))
            }
            Some(Script::Hang) => std::future::pending().await,
            None => Err(ClientError::Transport(format!("no script for {}", peer))),
        }
    }

    async fn query_installed(
        &self,
        peer: &PeerId,
        _timeout: Duration,
    ) -> Result<Vec<ChaincodeInfo>, ClientError> {
        if self.is_unreachable(peer) {
            return Err(ClientError::Transport("connection refused".into()));
        }
        Ok(self
            .installed
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .unwrap_or_default())
    }

    async fn query_ledger(
        &self,
        peer: &PeerId,
        _channel: &str,
        query: &LedgerQuery,
        _timeout: Duration,
    ) -> Result<LedgerRecord, ClientError> {
        self.ledger_calls
            .lock()
            .unwrap()
            .push((peer.clone(), query.clone()));
        if self.is_unreachable(peer) {
            return Err(ClientError::Transport("connection refused".into()));
        }
        let ledger = self.ledger.lock().unwrap();
        match ledger.iter().find(|(known, _)| known == query) {
            Some((_, record)) => Ok(record.clone()),
            None => Err(ClientError::NotFound(format!("{:?} not found", query))),
        }
    }

    async fn get_channel_info(
        &self,
        peer: &PeerId,
        channel: &str,
        _timeout: Duration,
    ) -> Result<ChannelInfo, ClientError> {
        self.ledger_calls
            .lock()
            .unwrap()
            .push((peer.clone(), LedgerQuery::Channels));
        if self.is_unreachable(peer) {
            return Err(ClientError::Transport("connection refused".into()));
        }
        match self.channel_info.lock().unwrap().clone() {
            Some(info) => Ok(info),
            None => Err(ClientError::NotFound(format!("channel {} not found", channel))),
        }
    }
}

/// Records submissions and, when wired to a commit source, commits them.
pub struct RecordingOrderer {
    submissions: Mutex<Vec<String>>,
    rejection: Mutex<Option<ClientError>>,
    commits: Option<(Arc<FakeCommits>, i32)>,
    blocks: AtomicU64,
}

impl RecordingOrderer {
    /// Accepts every envelope, nothing ever commits.
    pub fn silent() -> Arc<RecordingOrderer> {
        Arc::new(RecordingOrderer {
            submissions: Mutex::default(),
            rejection: Mutex::default(),
            commits: None,
            blocks: AtomicU64::new(5),
        })
    }

    /// Commits every accepted envelope into `commits` with `validation_code`.
    pub fn committing(commits: Arc<FakeCommits>, validation_code: i32) -> Arc<RecordingOrderer> {
        Arc::new(RecordingOrderer {
            submissions: Mutex::default(),
            rejection: Mutex::default(),
            commits: Some((commits, validation_code)),
            blocks: AtomicU64::new(5),
        })
    }

    pub fn reject_with(&self, err: ClientError) {
        *self.rejection.lock().unwrap() = Some(err);
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrdererClient for RecordingOrderer {
    async fn submit(
        &self,
        envelope: &EndorsedEnvelope,
        _timeout: Duration,
    ) -> Result<(), ClientError> {
        self.submissions
            .lock()
            .unwrap()
            .push(envelope.transaction_id().to_string());
        if let Some(err) = self.rejection.lock().unwrap().clone() {
            return Err(err);
        }
        if let Some((commits, validation_code)) = &self.commits {
            commits.publish(CommitEvent {
                transaction_id: envelope.transaction_id().to_string(),
                block_number: self.blocks.fetch_add(1, Ordering::SeqCst),
                validation_code: *validation_code,
            });
        }
        Ok(())
    }
}

/// Commit source backed by in-memory channels.
pub struct FakeCommits {
    streaming: bool,
    subscribers: Mutex<Vec<UnboundedSender<CommitEvent>>>,
    committed: Mutex<HashMap<String, CommitEvent>>,
    polls: AtomicUsize,
    stalled: AtomicBool,
}

impl FakeCommits {
    pub fn streaming() -> Arc<FakeCommits> {
        FakeCommits::with_streaming(true)
    }

    pub fn polling() -> Arc<FakeCommits> {
        FakeCommits::with_streaming(false)
    }

    fn with_streaming(streaming: bool) -> Arc<FakeCommits> {
        Arc::new(FakeCommits {
            streaming,
            subscribers: Mutex::default(),
            committed: Mutex::default(),
            polls: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
        })
    }

    pub fn publish(&self, event: CommitEvent) {
        self.committed
            .lock()
            .unwrap()
            .insert(event.transaction_id.clone(), event.clone());
        self.subscribers
            .lock()
            .unwrap()
            .retain(|subscriber| subscriber.unbounded_send(event.clone()).is_ok());
    }

    /// Closes every open event stream.
    pub fn end_streams(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    /// Polls from now on never answer.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    /// Subscriptions whose receiving side is still alive.
    pub fn open_subscriptions(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|subscriber| !subscriber.is_closed())
            .count()
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommitSource for FakeCommits {
    fn subscribe(&self, _channel: &str) -> Option<CommitStream> {
        if !self.streaming {
            return None;
        }
        let (sender, receiver) = mpsc::unbounded();
        self.subscribers.lock().unwrap().push(sender);
        Some(receiver.boxed())
    }

    async fn poll(
        &self,
        _channel: &str,
        transaction_id: &str,
    ) -> Result<Option<CommitEvent>, ClientError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.committed.lock().unwrap().get(transaction_id).cloned())
    }
}

pub fn identity() -> Identity {
    IdentityBuilder::from_pem(b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n")
        .with_msp("Org1MSP")
        .unwrap()
        .build()
        .unwrap()
}

pub fn timeouts() -> Timeouts {
    Timeouts {
        proposal: Duration::from_secs(1),
        endorsement: Duration::from_secs(2),
        submit: Duration::from_secs(1),
        commit: Duration::from_secs(5),
        query: Duration::from_secs(1),
    }
}

/// Peers `peer0..peerN`, with `mychannel` served by all of them.
pub fn config_builder(peers: &[&str]) -> GatewayConfigBuilder {
    let mut builder = GatewayConfigBuilder::new().with_identity(identity()).unwrap();
    for (index, peer) in peers.iter().enumerate() {
        builder = builder
            .with_peer(*peer, Endpoint::new(format!("http://localhost:{}", 7051 + index * 2000)))
            .unwrap();
    }
    builder
        .with_orderer(Endpoint::new("http://localhost:7050"))
        .unwrap()
        .with_channel_peers("mychannel", peers.iter().copied())
        .unwrap()
        .with_timeouts(timeouts())
        .unwrap()
        .with_retry(RetryPolicy {
            budget: 1,
            backoff: Duration::from_millis(10),
        })
        .unwrap()
        .with_commit_poll_interval(Duration::from_millis(100))
        .unwrap()
}

pub fn config(peers: &[&str]) -> GatewayConfig {
    config_builder(peers).build().unwrap()
}

pub fn gateway(
    config: GatewayConfig,
    peers: Arc<FakePeers>,
    orderer: Arc<RecordingOrderer>,
    commits: Arc<FakeCommits>,
) -> Gateway {
    init_tracing();
    GatewayBuilder::new()
        .with_config(config)
        .unwrap()
        .with_peer_client(peers)
        .unwrap()
        .with_orderer_client(orderer)
        .unwrap()
        .with_commit_source(commits)
        .unwrap()
        .build()
        .unwrap()
}
