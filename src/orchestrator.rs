use std::{collections::BTreeMap, sync::Arc};

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    aggregator::{EndorsedEnvelope, PeerOutcome, aggregate, collect_responses},
    commit::{CommitSource, CommitWaiter, TransactionRecord, TxStatus},
    config::GatewayConfig,
    error::{ClientError, ErrorKind, GatewayError, Stage},
    orderer::OrdererClient,
    peer::{PeerClient, PeerId, PeerTarget, ProposalResponse},
    request::{FlowPayload, TransactionRequest},
    retry::with_retry,
};

const COMMITTING_STAGES: &[Stage] = &[
    Stage::Validate,
    Stage::Propose,
    Stage::Aggregate,
    Stage::Submit,
    Stage::WaitCommit,
    Stage::Respond,
];

const PER_PEER_STAGES: &[Stage] = &[
    Stage::Validate,
    Stage::Propose,
    Stage::Aggregate,
    Stage::Respond,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowKind {
    SubmitTransaction,
    InstallChaincode,
    InstantiateChaincode,
    UpgradeChaincode,
    CreateChannel,
    UpdateChannel,
    JoinPeer,
}

impl FlowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::SubmitTransaction => "SUBMIT_TRANSACTION",
            FlowKind::InstallChaincode => "INSTALL_CHAINCODE",
            FlowKind::InstantiateChaincode => "INSTANTIATE_CHAINCODE",
            FlowKind::UpgradeChaincode => "UPGRADE_CHAINCODE",
            FlowKind::CreateChannel => "CREATE_CHANNEL",
            FlowKind::UpdateChannel => "UPDATE_CHANNEL",
            FlowKind::JoinPeer => "JOIN_PEER",
        }
    }

    /// Whether the flow produces a ledger transaction.
    pub fn commits(&self) -> bool {
        !matches!(self, FlowKind::InstallChaincode | FlowKind::JoinPeer)
    }

    /// Install and join act on a peer rather than on a channel.
    pub fn is_channel_less(&self) -> bool {
        !self.commits()
    }

    pub fn stages(&self) -> &'static [Stage] {
        if self.commits() {
            COMMITTING_STAGES
        } else {
            PER_PEER_STAGES
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Stage(Stage),
    Failed,
    Done,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Failed | FlowState::Done)
    }
}

/// State machine of one flow execution.
///
/// Stages run strictly in the order of the flow's stage list. Any stage may
/// fail; only RESPOND may finish.
#[derive(Debug)]
pub struct FlowTracker {
    flow: &'static str,
    stages: &'static [Stage],
    state: FlowState,
}

impl FlowTracker {
    pub fn new(kind: FlowKind) -> Self {
        FlowTracker::with_stages(kind.as_str(), kind.stages())
    }

    /// Tracker for endorsement without submission.
    pub fn endorse_only() -> Self {
        FlowTracker::with_stages("ENDORSE", PER_PEER_STAGES)
    }

    fn with_stages(flow: &'static str, stages: &'static [Stage]) -> Self {
        FlowTracker {
            flow,
            stages,
            state: FlowState::Stage(stages[0]),
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Moves to `next` if it directly follows the current stage.
    pub fn advance(&mut self, next: Stage) -> bool {
        let FlowState::Stage(current) = self.state else {
            return false;
        };
        let follows = self
            .stages
            .windows(2)
            .any(|pair| pair[0] == current && pair[1] == next);
        if follows {
            debug!(flow = self.flow, from = %current, to = %next, "stage transition");
            self.state = FlowState::Stage(next);
        }
        follows
    }

    pub fn fail(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = FlowState::Failed;
        true
    }

    pub fn finish(&mut self) -> bool {
        if self.state != FlowState::Stage(Stage::Respond) {
            return false;
        }
        self.state = FlowState::Done;
        true
    }
}

/// Acknowledgement of a per-peer operation such as install or join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerAck {
    pub status: i32,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum FlowOutcome {
    /// Ledger transaction flows. The record may be TIMED_OUT, in which case
    /// the transaction's fate is unknown.
    Committed {
        record: TransactionRecord,
        result: Vec<u8>,
        endorsements: Vec<ProposalResponse>,
    },
    /// Install and join, one entry per targeted peer.
    PerPeer(BTreeMap<PeerId, Result<PeerAck, GatewayError>>),
}

impl FlowOutcome {
    pub fn record(&self) -> Option<&TransactionRecord> {
        match self {
            FlowOutcome::Committed { record, .. } => Some(record),
            FlowOutcome::PerPeer(_) => None,
        }
    }

    pub fn per_peer(&self) -> Option<&BTreeMap<PeerId, Result<PeerAck, GatewayError>>> {
        match self {
            FlowOutcome::PerPeer(results) => Some(results),
            FlowOutcome::Committed { .. } => None,
        }
    }

    /// Turns a TIMED_OUT record into a COMMIT_TIMEOUT error.
    pub fn require_valid(self) -> Result<FlowOutcome, GatewayError> {
        match &self {
            FlowOutcome::Committed { record, .. } if record.status() == TxStatus::TimedOut => {
                Err(GatewayError::new(
                    ErrorKind::CommitTimeout,
                    Stage::WaitCommit,
                    format!(
                        "transaction {} not committed before the deadline",
                        record.transaction_id()
                    ),
                ))
            }
            _ => Ok(self),
        }
    }
}

/// Drives flows through their stages against the injected capabilities.
pub struct Orchestrator {
    peers: Arc<dyn PeerClient>,
    orderer: Arc<dyn OrdererClient>,
    commits: Arc<dyn CommitSource>,
}

impl Orchestrator {
    pub fn new(
        peers: Arc<dyn PeerClient>,
        orderer: Arc<dyn OrdererClient>,
        commits: Arc<dyn CommitSource>,
    ) -> Self {
        Orchestrator {
            peers,
            orderer,
            commits,
        }
    }

    pub(crate) fn commit_waiter(&self, config: &GatewayConfig) -> CommitWaiter {
        CommitWaiter::new(
            self.commits.clone(),
            config.commit_poll_interval(),
            config.timeouts().query,
        )
    }

    /// Runs one flow to completion.
    ///
    /// Every targeted peer receives exactly one logical proposal and the
    /// orderer receives at most one submission.
    pub async fn execute(
        &self,
        config: &GatewayConfig,
        kind: FlowKind,
        channel: &str,
        target: &PeerTarget,
        payload: FlowPayload,
        cancel: &CancellationToken,
    ) -> Result<FlowOutcome, GatewayError> {
        if payload.kind() != kind {
            return Err(GatewayError::validation(format!(
                "{} payload cannot run as {}",
                payload.kind().as_str(),
                kind.as_str()
            )));
        }
        let mut tracker = FlowTracker::new(kind);
        info!(flow = kind.as_str(), channel, "flow started");
        let result = self
            .run(config, kind, channel, target, &payload, cancel, &mut tracker)
            .await;
        match &result {
            Ok(_) => {
                tracker.finish();
                info!(flow = kind.as_str(), channel, "flow done");
            }
            Err(err) => {
                tracker.fail();
                warn!(
                    flow = kind.as_str(),
                    channel,
                    stage = %err.stage,
                    kind = %err.kind,
                    peer = err.peer.as_ref().map(PeerId::as_str),
                    "flow failed: {}",
                    err.message
                );
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        config: &GatewayConfig,
        kind: FlowKind,
        channel: &str,
        target: &PeerTarget,
        payload: &FlowPayload,
        cancel: &CancellationToken,
        tracker: &mut FlowTracker,
    ) -> Result<FlowOutcome, GatewayError> {
        payload.validate(channel)?;
        let peers = config.resolve_peers(channel, target)?;
        let proposal_channel = if kind.is_channel_less() { "" } else { channel };
        let proposal = payload.to_proposal(proposal_channel, config.identity())?;

        enter(tracker, Stage::Propose);
        if cancel.is_cancelled() {
            return Err(GatewayError::cancelled(Stage::Propose));
        }
        let outcomes = collect_responses(
            self.peers.as_ref(),
            &peers,
            &proposal,
            config.timeouts(),
            config.retry(),
            cancel,
        )
        .await?;

        enter(tracker, Stage::Aggregate);
        if !kind.commits() {
            let acks = per_peer_acks(outcomes);
            enter(tracker, Stage::Respond);
            return Ok(FlowOutcome::PerPeer(acks));
        }
        let envelope = aggregate(&proposal, &peers, outcomes, config.policy())?;

        enter(tracker, Stage::Submit);
        let transaction_id = envelope.transaction_id().to_string();
        let result = envelope.result().to_vec();
        let endorsements = self.submit(config, envelope, cancel).await?;

        enter(tracker, Stage::WaitCommit);
        let deadline = Instant::now() + config.timeouts().commit;
        let record = self
            .commit_waiter(config)
            .wait_for_commit(&transaction_id, channel, deadline, cancel)
            .await?;

        enter(tracker, Stage::Respond);
        if record.status() == TxStatus::Invalid {
            let code = record.validation_code().unwrap_or_default();
            return Err(GatewayError::new(
                ErrorKind::CommitInvalid,
                Stage::WaitCommit,
                format!("transaction {} invalidated with code {}", transaction_id, code),
            )
            .with_validation_code(code));
        }
        Ok(FlowOutcome::Committed {
            record,
            result,
            endorsements,
        })
    }

    /// Endorses a transaction without submitting it.
    pub async fn endorse(
        &self,
        config: &GatewayConfig,
        channel: &str,
        target: &PeerTarget,
        request: TransactionRequest,
        cancel: &CancellationToken,
    ) -> Result<EndorsedEnvelope, GatewayError> {
        let mut tracker = FlowTracker::endorse_only();
        let payload = FlowPayload::Transaction(request);
        payload.validate(channel)?;
        let peers = config.resolve_peers(channel, target)?;
        let proposal = payload.to_proposal(channel, config.identity())?;

        enter(&mut tracker, Stage::Propose);
        let outcomes = collect_responses(
            self.peers.as_ref(),
            &peers,
            &proposal,
            config.timeouts(),
            config.retry(),
            cancel,
        )
        .await;
        let envelope = outcomes.and_then(|outcomes| {
            enter(&mut tracker, Stage::Aggregate);
            aggregate(&proposal, &peers, outcomes, config.policy())
        });
        match &envelope {
            Ok(envelope) => {
                enter(&mut tracker, Stage::Respond);
                tracker.finish();
                info!(channel, tx_id = envelope.transaction_id(), "proposal endorsed");
            }
            Err(err) => {
                tracker.fail();
                warn!(
                    channel,
                    stage = %err.stage,
                    kind = %err.kind,
                    "endorsement failed: {}",
                    err.message
                );
            }
        }
        envelope
    }

    /// SUBMIT stage. Consumes the envelope and hands back its endorsements.
    async fn submit(
        &self,
        config: &GatewayConfig,
        envelope: EndorsedEnvelope,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProposalResponse>, GatewayError> {
        let timeout = config.timeouts().submit;
        let submission = with_retry(config.retry(), timeout, "submit", None, || {
            self.orderer.submit(&envelope, timeout)
        });
        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::cancelled(Stage::Submit)),
            submitted = submission => submitted,
        };
        match submitted {
            Ok(()) => {
                info!(
                    tx_id = envelope.transaction_id(),
                    channel = envelope.channel_name(),
                    "transaction accepted for ordering"
                );
                Ok(envelope.into_endorsements())
            }
            Err(err) => Err(GatewayError::from_client(
                err,
                Stage::Submit,
                None,
                ErrorKind::Transport,
            )),
        }
    }
}

fn enter(tracker: &mut FlowTracker, stage: Stage) {
    let moved = tracker.advance(stage);
    debug_assert!(moved, "illegal transition to {}", stage);
}

/// Install and join results. A refusal is the peer's own answer, so it is
/// reported as PEER_REJECTED at PROPOSE rather than as a disagreement.
fn per_peer_acks(outcomes: Vec<PeerOutcome>) -> BTreeMap<PeerId, Result<PeerAck, GatewayError>> {
    outcomes
        .into_iter()
        .map(|(peer, outcome)| {
            let ack = match outcome {
                Ok(response) if response.is_success() => Ok(PeerAck {
                    status: response.status,
                    message: response.message,
                }),
                Ok(response) => Err(peer_failure(
                    ClientError::Rejected {
                        status: response.status,
                        message: response.message,
                    },
                    &peer,
                )),
                Err(err) => Err(peer_failure(err, &peer)),
            };
            (peer, ack)
        })
        .collect()
}

fn peer_failure(err: ClientError, peer: &PeerId) -> GatewayError {
    match err {
        ClientError::Rejected { .. } => {
            GatewayError::new(ErrorKind::PeerRejected, Stage::Propose, err.to_string())
                .with_peer(peer.clone())
        }
        err => {
            GatewayError::from_client(err, Stage::Propose, Some(peer.clone()), ErrorKind::Transport)
        }
    }
}
