use futures_util::{StreamExt, stream::FuturesUnordered};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::{RetryPolicy, Timeouts},
    error::{BuilderError, ClientError, ErrorKind, GatewayError, ResponseSummary, Stage},
    identity::Identity,
    peer::{PeerClient, PeerId, PeerSet, ProposalResponse},
    retry::with_retry,
    transaction::Proposal,
};

/// How many endorsements a proposal needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quorum {
    /// Every targeted peer must endorse.
    All,
    AtLeast(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndorsementPolicy {
    pub quorum: Quorum,
    /// All endorsements must carry the same proposal response payload.
    pub require_payload_equality: bool,
}

impl Default for EndorsementPolicy {
    fn default() -> Self {
        EndorsementPolicy {
            quorum: Quorum::All,
            require_payload_equality: true,
        }
    }
}

impl EndorsementPolicy {
    pub fn new(quorum: Quorum, require_payload_equality: bool) -> Self {
        EndorsementPolicy {
            quorum,
            require_payload_equality,
        }
    }

    pub fn required(&self, targeted: usize) -> usize {
        match self.quorum {
            Quorum::All => targeted,
            Quorum::AtLeast(count) => count,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), BuilderError> {
        if self.quorum == Quorum::AtLeast(0) {
            return Err(BuilderError::InvalidParameter(
                "quorum must require at least one endorsement".into(),
            ));
        }
        Ok(())
    }
}

/// A proposal together with the endorsements that satisfied the policy.
///
/// Only [`aggregate`] creates envelopes. The SUBMIT stage consumes it.
#[derive(Debug, Clone)]
pub struct EndorsedEnvelope {
    proposal: Proposal,
    endorsements: Vec<ProposalResponse>,
    submitter: Identity,
}

impl EndorsedEnvelope {
    pub fn proposal(&self) -> &Proposal {
        &self.proposal
    }

    /// Endorsements in peer set order.
    pub fn endorsements(&self) -> &[ProposalResponse] {
        &self.endorsements
    }

    pub fn submitter(&self) -> &Identity {
        &self.submitter
    }

    pub fn transaction_id(&self) -> &str {
        self.proposal.transaction_id()
    }

    pub fn channel_name(&self) -> &str {
        self.proposal.channel_name()
    }

    /// Proposal response payload all endorsers agreed on.
    pub fn payload(&self) -> &[u8] {
        &self.endorsements[0].payload
    }

    /// Chaincode result of the simulation.
    pub fn result(&self) -> &[u8] {
        &self.endorsements[0].result
    }

    pub(crate) fn into_endorsements(self) -> Vec<ProposalResponse> {
        self.endorsements
    }
}

/// Outcome of one peer's proposal call.
pub type PeerOutcome = (PeerId, Result<ProposalResponse, ClientError>);

/// Sends `proposal` to every peer in parallel and waits for all of them or
/// for the collective endorsement timeout, whichever comes first.
///
/// Peers that have not answered by then are reported as transport failures.
/// Outcomes come back in peer set order.
pub async fn collect_responses(
    client: &dyn PeerClient,
    peers: &PeerSet,
    proposal: &Proposal,
    timeouts: &Timeouts,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Vec<PeerOutcome>, GatewayError> {
    let per_peer = timeouts.proposal;
    let mut pending: FuturesUnordered<_> = peers
        .iter()
        .map(|peer| async move {
            let result = with_retry(retry, per_peer, "propose", Some(peer), || {
                client.propose(peer, proposal, per_peer)
            })
            .await;
            (peer.clone(), result)
        })
        .collect();

    let deadline = tokio::time::sleep(timeouts.endorsement);
    tokio::pin!(deadline);

    let mut outcomes: Vec<PeerOutcome> = Vec::with_capacity(peers.len());
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(tx_id = proposal.transaction_id(), "proposal collection cancelled");
                return Err(GatewayError::cancelled(Stage::Propose));
            }
            _ = &mut deadline => {
                warn!(
                    tx_id = proposal.transaction_id(),
                    answered = outcomes.len(),
                    targeted = peers.len(),
                    "endorsement timeout elapsed"
                );
                break;
            }
            next = pending.next() => match next {
                Some((peer, result)) => {
                    match &result {
                        Ok(response) => {
                            debug!(%peer, status = response.status, "proposal response received")
                        }
                        Err(err) => warn!(%peer, error = %err, "proposal failed"),
                    }
                    outcomes.push((peer, result));
                }
                None => break,
            },
        }
    }
    drop(pending);

    for peer in peers.iter() {
        if !outcomes.iter().any(|(answered, _)| answered == peer) {
            outcomes.push((
                peer.clone(),
                Err(ClientError::Transport(
                    "no answer before the endorsement timeout".into(),
                )),
            ));
        }
    }
    outcomes.sort_by_key(|(peer, _)| peers.position(peer));
    Ok(outcomes)
}

/// Applies `policy` to the collected outcomes.
///
/// Any rejection or payload disagreement fails with ENDORSEMENT_MISMATCH;
/// there is no majority rule. Unanswered peers only count against the quorum.
pub fn aggregate(
    proposal: &Proposal,
    peers: &PeerSet,
    outcomes: Vec<PeerOutcome>,
    policy: &EndorsementPolicy,
) -> Result<EndorsedEnvelope, GatewayError> {
    let mut endorsements: Vec<ProposalResponse> = vec![];
    let mut rejected: Vec<ResponseSummary> = vec![];
    let mut unanswered: Vec<String> = vec![];

    for (peer, outcome) in outcomes {
        match outcome {
            Ok(response) if response.is_success() => {
                if response.endorsement.signature.is_empty()
                    || response.endorsement.endorser.is_empty()
                {
                    return Err(GatewayError::new(
                        ErrorKind::MalformedResponse,
                        Stage::Aggregate,
                        "successful response without endorsement signature",
                    )
                    .with_peer(peer));
                }
                endorsements.push(response);
            }
            Ok(response) => rejected.push(ResponseSummary {
                payload_hash: String::new(),
                ..response.summary()
            }),
            Err(ClientError::Rejected { status, message }) => rejected.push(ResponseSummary {
                peer,
                status,
                message,
                payload_hash: String::new(),
            }),
            Err(ClientError::NotFound(message)) => rejected.push(ResponseSummary {
                peer,
                status: 404,
                message,
                payload_hash: String::new(),
            }),
            Err(ClientError::Malformed(reason)) => {
                return Err(
                    GatewayError::new(ErrorKind::MalformedResponse, Stage::Aggregate, reason)
                        .with_peer(peer),
                );
            }
            Err(ClientError::Transport(reason)) => {
                unanswered.push(format!("{}: {}", peer, reason));
            }
        }
    }

    if !rejected.is_empty() {
        let first = rejected[0].peer.clone();
        let mut responses = rejected;
        responses.extend(endorsements.iter().map(ProposalResponse::summary));
        responses.sort_by_key(|summary| peers.position(&summary.peer));
        return Err(GatewayError::new(
            ErrorKind::EndorsementMismatch,
            Stage::Aggregate,
            "proposal rejected by at least one peer",
        )
        .with_peer(first)
        .with_responses(responses));
    }

    if policy.require_payload_equality
        && let Some(first) = endorsements.first()
    {
        let expected = first.payload_hash();
        if let Some(differing) = endorsements.iter().find(|r| r.payload_hash() != expected) {
            return Err(GatewayError::new(
                ErrorKind::EndorsementMismatch,
                Stage::Aggregate,
                "peers returned differing proposal response payloads",
            )
            .with_peer(differing.peer.clone())
            .with_responses(endorsements.iter().map(ProposalResponse::summary).collect()));
        }
    }

    let required = policy.required(peers.len());
    if endorsements.is_empty() || endorsements.len() < required {
        let mut message = format!(
            "{} of {} required endorsements collected",
            endorsements.len(),
            required.max(1)
        );
        if !unanswered.is_empty() {
            message.push_str(&format!(" (unanswered: {})", unanswered.join(", ")));
        }
        return Err(GatewayError::new(
            ErrorKind::InsufficientEndorsements,
            Stage::Aggregate,
            message,
        ));
    }

    debug!(
        tx_id = proposal.transaction_id(),
        endorsements = endorsements.len(),
        "endorsement policy satisfied"
    );
    Ok(EndorsedEnvelope {
        proposal: proposal.clone(),
        endorsements,
        submitter: proposal.creator().clone(),
    })
}
