use std::{collections::BTreeMap, sync::Arc};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    aggregator::EndorsedEnvelope,
    commit::{CommitSource, TransactionRecord},
    config::{ConfigHandle, GatewayConfig},
    error::{BuilderError, ErrorKind, GatewayError, Stage},
    grpc::GrpcNetwork,
    orchestrator::{FlowKind, FlowOutcome, Orchestrator},
    orderer::OrdererClient,
    peer::{BlockInfo, ChaincodeInfo, ChannelInfo, PeerClient, PeerId, PeerTarget, TransactionInfo},
    query::{LedgerParams, QueryDispatcher, QueryKind, QueryResult, QuerySelector},
    request::{
        ChaincodeDeployRequest, ChaincodeInstallRequest, ChannelRequest, FlowPayload, JoinRequest,
        TransactionRequest,
    },
    signer::Signer,
};

/// Entry point for callers: every inbound operation of the gateway.
///
/// Cloning is cheap and clones share configuration, capabilities and the root
/// cancellation token.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConfigHandle,
    orchestrator: Orchestrator,
    queries: QueryDispatcher,
    root: CancellationToken,
}

/// A request running on its own task.
pub struct RequestHandle<T> {
    cancel: CancellationToken,
    task: JoinHandle<Result<T, GatewayError>>,
}

impl<T> RequestHandle<T> {
    /// Stops the request at its next suspension point. Proposals already sent
    /// are not retracted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn outcome(self) -> Result<T, GatewayError> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(GatewayError::cancelled(Stage::Respond)),
        }
    }
}

impl Gateway {
    /// Configuration new requests start with.
    pub fn config(&self) -> Arc<GatewayConfig> {
        self.inner.config.snapshot()
    }

    /// Replaces the configuration for requests started after this call.
    pub fn reload(&self, config: GatewayConfig) {
        self.inner.config.reload(config);
    }

    /// Token for [`Gateway::execute`], cancelled on shutdown.
    pub fn request_token(&self) -> CancellationToken {
        self.inner.root.child_token()
    }

    /// Cancels every request still running.
    pub fn shutdown(&self) {
        info!("gateway shutting down");
        self.inner.root.cancel();
    }

    /// Runs any flow with caller-controlled cancellation.
    pub async fn execute(
        &self,
        kind: FlowKind,
        channel: &str,
        target: &PeerTarget,
        payload: FlowPayload,
        cancel: &CancellationToken,
    ) -> Result<FlowOutcome, GatewayError> {
        let config = self.inner.config.snapshot();
        self.inner
            .orchestrator
            .execute(&config, kind, channel, target, payload, cancel)
            .await
    }

    /// Runs a flow on its own task.
    pub fn spawn(
        &self,
        channel: impl Into<String>,
        target: PeerTarget,
        payload: FlowPayload,
    ) -> RequestHandle<FlowOutcome> {
        let cancel = self.request_token();
        let gateway = self.clone();
        let channel = channel.into();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            gateway
                .execute(payload.kind(), &channel, &target, payload, &token)
                .await
        });
        RequestHandle { cancel, task }
    }

    async fn run(
        &self,
        channel: &str,
        target: &PeerTarget,
        payload: FlowPayload,
    ) -> Result<FlowOutcome, GatewayError> {
        let cancel = self.request_token();
        let _guard = cancel.clone().drop_guard();
        self.execute(payload.kind(), channel, target, payload, &cancel).await
    }

    /// Endorses, orders and waits for the commit of a chaincode invocation.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    ///  let outcome = gateway
    ///    .submit_transaction(
    ///        "mychannel",
    ///        &PeerTarget::Default,
    ///        TransactionRequest {
    ///            chaincode_id: "basic".into(),
    ///            function: "CreateAsset".into(),
    ///            args: vec!["asset7".into(), "orange".into()],
    ///            ..Default::default()
    ///        },
    ///    )
    ///    .await?;
    /// ```
    pub async fn submit_transaction(
        &self,
        channel: &str,
        target: &PeerTarget,
        request: TransactionRequest,
    ) -> Result<FlowOutcome, GatewayError> {
        self.run(channel, target, FlowPayload::Transaction(request)).await
    }

    /// Endorses a chaincode invocation without ordering it.
    pub async fn endorse(
        &self,
        channel: &str,
        target: &PeerTarget,
        request: TransactionRequest,
    ) -> Result<EndorsedEnvelope, GatewayError> {
        let config = self.inner.config.snapshot();
        let cancel = self.request_token();
        let _guard = cancel.clone().drop_guard();
        self.inner
            .orchestrator
            .endorse(&config, channel, target, request, &cancel)
            .await
    }

    pub async fn install_chaincode(
        &self,
        target: &PeerTarget,
        request: ChaincodeInstallRequest,
    ) -> Result<FlowOutcome, GatewayError> {
        self.run("", target, FlowPayload::Install(request)).await
    }

    pub async fn instantiate_chaincode(
        &self,
        channel: &str,
        target: &PeerTarget,
        request: ChaincodeDeployRequest,
    ) -> Result<FlowOutcome, GatewayError> {
        self.run(channel, target, FlowPayload::Instantiate(request)).await
    }

    pub async fn upgrade_chaincode(
        &self,
        channel: &str,
        target: &PeerTarget,
        request: ChaincodeDeployRequest,
    ) -> Result<FlowOutcome, GatewayError> {
        self.run(channel, target, FlowPayload::Upgrade(request)).await
    }

    pub async fn create_channel(
        &self,
        channel: &str,
        target: &PeerTarget,
        request: ChannelRequest,
    ) -> Result<FlowOutcome, GatewayError> {
        self.run(channel, target, FlowPayload::CreateChannel(request)).await
    }

    pub async fn update_channel(
        &self,
        channel: &str,
        target: &PeerTarget,
        request: ChannelRequest,
    ) -> Result<FlowOutcome, GatewayError> {
        self.run(channel, target, FlowPayload::UpdateChannel(request)).await
    }

    /// Joins the targeted peers to `channel`. Each peer reports separately.
    pub async fn join_peer(
        &self,
        channel: &str,
        target: &PeerTarget,
        request: JoinRequest,
    ) -> Result<FlowOutcome, GatewayError> {
        self.run(channel, target, FlowPayload::JoinPeer(request)).await
    }

    async fn query(
        &self,
        kind: QueryKind,
        channel: &str,
        selector: QuerySelector,
        target: &PeerTarget,
    ) -> Result<QueryResult, GatewayError> {
        let config = self.inner.config.snapshot();
        let cancel = self.request_token();
        let _guard = cancel.clone().drop_guard();
        self.inner
            .queries
            .query(&config, kind, channel, selector, target, &cancel)
            .await
    }

    pub async fn list_channels(&self, target: &PeerTarget) -> Result<Vec<String>, GatewayError> {
        match self.query(QueryKind::ListChannels, "", QuerySelector::None, target).await? {
            QueryResult::Channels(channels) => Ok(channels),
            other => Err(unexpected(other)),
        }
    }

    pub async fn channel_info(
        &self,
        channel: &str,
        target: &PeerTarget,
    ) -> Result<ChannelInfo, GatewayError> {
        match self.query(QueryKind::ChannelInfo, channel, QuerySelector::None, target).await? {
            QueryResult::ChannelInfo(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    /// Chaincodes instantiated on `channel`.
    pub async fn list_chaincodes(
        &self,
        channel: &str,
        target: &PeerTarget,
    ) -> Result<Vec<ChaincodeInfo>, GatewayError> {
        match self.query(QueryKind::ListChaincodes, channel, QuerySelector::None, target).await? {
            QueryResult::Chaincodes(chaincodes) => Ok(chaincodes),
            other => Err(unexpected(other)),
        }
    }

    pub async fn chaincode_info(
        &self,
        channel: &str,
        chaincode_id: &str,
        target: &PeerTarget,
    ) -> Result<ChaincodeInfo, GatewayError> {
        let selector = QuerySelector::ChaincodeId(chaincode_id.to_string());
        match self.query(QueryKind::ChaincodeInfo, channel, selector, target).await? {
            QueryResult::Chaincode(chaincode) => Ok(chaincode),
            other => Err(unexpected(other)),
        }
    }

    /// Install state of a chaincode on every targeted peer.
    pub async fn installed_chaincode(
        &self,
        chaincode_id: &str,
        target: &PeerTarget,
    ) -> Result<BTreeMap<PeerId, Result<ChaincodeInfo, GatewayError>>, GatewayError> {
        let selector = QuerySelector::ChaincodeId(chaincode_id.to_string());
        match self.query(QueryKind::InstalledChaincode, "", selector, target).await? {
            QueryResult::Installed(installed) => Ok(installed),
            other => Err(unexpected(other)),
        }
    }

    /// Block by number or, when no number is given, by hex encoded hash.
    pub async fn block(
        &self,
        channel: &str,
        block_id: Option<u64>,
        block_hash: Option<&str>,
        target: &PeerTarget,
    ) -> Result<BlockInfo, GatewayError> {
        let selector = match (block_id, block_hash) {
            (Some(number), _) => QuerySelector::BlockNumber(number),
            (None, Some(hash)) => QuerySelector::BlockHash(hash.to_string()),
            (None, None) => {
                return Err(GatewayError::validation(
                    "block query needs a block id or a block hash",
                ));
            }
        };
        match self.query(QueryKind::Block, channel, selector, target).await? {
            QueryResult::Block(block) => Ok(block),
            other => Err(unexpected(other)),
        }
    }

    pub async fn transaction(
        &self,
        channel: &str,
        transaction_id: &str,
        target: &PeerTarget,
    ) -> Result<TransactionInfo, GatewayError> {
        let selector = QuerySelector::TransactionId(transaction_id.to_string());
        match self.query(QueryKind::Transaction, channel, selector, target).await? {
            QueryResult::Transaction(transaction) => Ok(transaction),
            other => Err(unexpected(other)),
        }
    }

    /// Generic ledger lookup by transaction id, block id, block hash or
    /// chaincode query, in that order of precedence.
    pub async fn ledger(
        &self,
        channel: &str,
        params: LedgerParams,
        target: &PeerTarget,
    ) -> Result<QueryResult, GatewayError> {
        let selector = QuerySelector::from_ledger_params(params)?;
        self.query(QueryKind::Ledger, channel, selector, target).await
    }

    /// Current state of a submitted transaction, from a single poll.
    pub async fn commit_status(
        &self,
        channel: &str,
        transaction_id: &str,
    ) -> Result<TransactionRecord, GatewayError> {
        let config = self.inner.config.snapshot();
        let cancel = self.request_token();
        let _guard = cancel.clone().drop_guard();
        self.inner
            .orchestrator
            .commit_waiter(&config)
            .status(transaction_id, channel, &cancel)
            .await
    }
}

fn unexpected(result: QueryResult) -> GatewayError {
    GatewayError::new(
        ErrorKind::MalformedResponse,
        Stage::Respond,
        format!("unexpected query result {:?}", result),
    )
}

/// Builds a [`Gateway`] from a configuration and its network capabilities.
///
/// # Examples
///
/// ```rust,ignore
///  let gateway = GatewayBuilder::new()
///    .with_config(config)?
///    .with_grpc(Signer::from_pem(std::fs::read(keystore_path)?)?)?
///    .build()?;
/// ```
#[derive(Default)]
pub struct GatewayBuilder {
    config: Option<GatewayConfig>,
    peers: Option<Arc<dyn PeerClient>>,
    orderer: Option<Arc<dyn OrdererClient>>,
    commits: Option<Arc<dyn CommitSource>>,
    signer: Option<Signer>,
}

impl GatewayBuilder {
    pub fn new() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    pub fn with_config(mut self, config: GatewayConfig) -> Result<GatewayBuilder, BuilderError> {
        self.config = Some(config);
        Ok(self)
    }

    pub fn with_peer_client(
        mut self,
        peers: Arc<dyn PeerClient>,
    ) -> Result<GatewayBuilder, BuilderError> {
        self.peers = Some(peers);
        Ok(self)
    }

    pub fn with_orderer_client(
        mut self,
        orderer: Arc<dyn OrdererClient>,
    ) -> Result<GatewayBuilder, BuilderError> {
        self.orderer = Some(orderer);
        Ok(self)
    }

    pub fn with_commit_source(
        mut self,
        commits: Arc<dyn CommitSource>,
    ) -> Result<GatewayBuilder, BuilderError> {
        self.commits = Some(commits);
        Ok(self)
    }

    /// Talks to the configured endpoints over gRPC for every capability not
    /// set explicitly. Transactions are signed with `signer`.
    pub fn with_grpc(mut self, signer: Signer) -> Result<GatewayBuilder, BuilderError> {
        self.signer = Some(signer);
        Ok(self)
    }

    /// Collects and validates the values. Building does not contact the network.
    pub fn build(self) -> Result<Gateway, BuilderError> {
        let config = match self.config {
            Some(config) => config,
            None => return Err(BuilderError::MissingParameter("config".into())),
        };
        let config = ConfigHandle::new(config);
        let network = match self.signer {
            Some(signer) => Some(Arc::new(GrpcNetwork::new(config.snapshot(), signer)?)),
            None => None,
        };
        let peers: Arc<dyn PeerClient> = match (self.peers, &network) {
            (Some(peers), _) => peers,
            (None, Some(network)) => network.clone(),
            (None, None) => return Err(BuilderError::MissingParameter("peer_client".into())),
        };
        let orderer: Arc<dyn OrdererClient> = match (self.orderer, &network) {
            (Some(orderer), _) => orderer,
            (None, Some(network)) => network.clone(),
            (None, None) => return Err(BuilderError::MissingParameter("orderer_client".into())),
        };
        let commits: Arc<dyn CommitSource> = match (self.commits, &network) {
            (Some(commits), _) => commits,
            (None, Some(network)) => network.clone(),
            (None, None) => return Err(BuilderError::MissingParameter("commit_source".into())),
        };
        Ok(Gateway {
            inner: Arc::new(Inner {
                config,
                orchestrator: Orchestrator::new(peers.clone(), orderer, commits),
                queries: QueryDispatcher::new(peers),
                root: CancellationToken::new(),
            }),
        })
    }
}
