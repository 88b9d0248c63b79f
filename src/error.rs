use std::fmt;

use serde::Serialize;

use crate::peer::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuilderError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Missing parameter: {0}")]
    MissingParameter(String),
}

/// Failure reported by a peer or orderer capability for a single call.
///
/// Only [`ClientError::Transport`] is ever retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("rejected with status {status}: {message}")]
    Rejected { status: i32, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

/// Machine readable failure class carried by every [`GatewayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Transport,
    EndorsementMismatch,
    InsufficientEndorsements,
    SubmitRejected,
    /// A single peer refused a per-peer operation such as install or join.
    PeerRejected,
    CommitInvalid,
    CommitTimeout,
    NotFound,
    Validation,
    UpstreamUnavailable,
    MalformedResponse,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::EndorsementMismatch => "ENDORSEMENT_MISMATCH",
            ErrorKind::InsufficientEndorsements => "INSUFFICIENT_ENDORSEMENTS",
            ErrorKind::SubmitRejected => "SUBMIT_REJECTED",
            ErrorKind::PeerRejected => "PEER_REJECTED",
            ErrorKind::CommitInvalid => "COMMIT_INVALID",
            ErrorKind::CommitTimeout => "COMMIT_TIMEOUT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorKind::MalformedResponse => "MALFORMED_RESPONSE",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage of a flow or query at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Validate,
    Propose,
    Aggregate,
    Submit,
    WaitCommit,
    Respond,
    Query,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validate => "VALIDATE",
            Stage::Propose => "PROPOSE",
            Stage::Aggregate => "AGGREGATE",
            Stage::Submit => "SUBMIT",
            Stage::WaitCommit => "WAIT_COMMIT",
            Stage::Respond => "RESPOND",
            Stage::Query => "QUERY",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One peer's answer as reported inside an endorsement mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseSummary {
    pub peer: PeerId,
    pub status: i32,
    pub message: String,
    /// Hex encoded SHA-256 of the proposal response payload, empty when the peer rejected.
    pub payload_hash: String,
}

/// Structured error returned by every gateway operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind} at {stage}{}: {message}", fmt_peer(.peer))]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerId>,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub responses: Vec<ResponseSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_code: Option<i32>,
}

fn fmt_peer(peer: &Option<PeerId>) -> String {
    match peer {
        Some(peer) => format!(" (peer {})", peer),
        None => String::new(),
    }
}

impl GatewayError {
    pub fn new(kind: ErrorKind, stage: Stage, message: impl Into<String>) -> Self {
        GatewayError {
            kind,
            stage,
            peer: None,
            message: message.into(),
            responses: vec![],
            validation_code: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, Stage::Validate, message)
    }

    pub fn cancelled(stage: Stage) -> Self {
        Self::new(ErrorKind::Cancelled, stage, "request cancelled by caller")
    }

    pub fn with_peer(mut self, peer: PeerId) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_responses(mut self, responses: Vec<ResponseSummary>) -> Self {
        self.responses = responses;
        self
    }

    pub fn with_validation_code(mut self, code: i32) -> Self {
        self.validation_code = Some(code);
        self
    }

    /// Maps a capability failure observed at `stage` on `peer`.
    ///
    /// Transport failures surface as `unreachable`, which lets queries report
    /// UPSTREAM_UNAVAILABLE while write flows report TRANSPORT.
    pub fn from_client(
        err: ClientError,
        stage: Stage,
        peer: Option<PeerId>,
        unreachable: ErrorKind,
    ) -> Self {
        let kind = match &err {
            ClientError::Transport(_) => unreachable,
            ClientError::Rejected { .. } => match stage {
                Stage::Submit => ErrorKind::SubmitRejected,
                Stage::Propose | Stage::Aggregate => ErrorKind::EndorsementMismatch,
                _ => ErrorKind::Transport,
            },
            ClientError::NotFound(_) => ErrorKind::NotFound,
            ClientError::Malformed(_) => ErrorKind::MalformedResponse,
        };
        let mut error = GatewayError::new(kind, stage, err.to_string());
        error.peer = peer;
        error
    }

    /// True when the outcome of the transaction is unknown rather than failed.
    pub fn is_indeterminate(&self) -> bool {
        self.kind == ErrorKind::CommitTimeout
    }
}

/// Builder failures surface while validating a request.
impl From<BuilderError> for GatewayError {
    fn from(err: BuilderError) -> Self {
        GatewayError::validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_kind_stage_and_peer() {
        let err = GatewayError::new(ErrorKind::Transport, Stage::Propose, "connection refused")
            .with_peer(PeerId::from("peer1"));
        assert_eq!(
            err.to_string(),
            "TRANSPORT at PROPOSE (peer peer1): connection refused"
        );
    }

    #[test]
    fn serializes_machine_readable_kind() {
        let err = GatewayError::validation("chaincode id cannot be empty");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "VALIDATION");
        assert_eq!(json["stage"], "VALIDATE");
        assert!(json.get("peer").is_none());
        assert!(json.get("responses").is_none());
    }

    #[test]
    fn rejected_submit_maps_to_submit_rejected() {
        let err = GatewayError::from_client(
            ClientError::Rejected {
                status: 400,
                message: "BAD_REQUEST".into(),
            },
            Stage::Submit,
            None,
            ErrorKind::Transport,
        );
        assert_eq!(err.kind, ErrorKind::SubmitRejected);
        assert!(!ClientError::NotFound("x".into()).is_retryable());
        assert!(ClientError::Transport("x".into()).is_retryable());
    }
}
