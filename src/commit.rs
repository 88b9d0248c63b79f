use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{
    StreamExt,
    future::BoxFuture,
    stream::BoxStream,
};
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ClientError, GatewayError, Stage};

/// `TxValidationCode::VALID` in Fabric's transaction protos.
pub const TX_VALIDATION_CODE_VALID: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Pending,
    Valid,
    Invalid,
    TimedOut,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxStatus::Pending)
    }
}

/// Ledger outcome of one transaction as reported by the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    pub transaction_id: String,
    pub block_number: u64,
    pub validation_code: i32,
}

/// Lifecycle of a submitted transaction.
///
/// Status only ever moves from PENDING to a terminal value; later updates are
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRecord {
    transaction_id: String,
    channel: String,
    status: TxStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    validation_code: Option<i32>,
}

impl TransactionRecord {
    pub fn pending(transaction_id: impl Into<String>, channel: impl Into<String>) -> Self {
        TransactionRecord {
            transaction_id: transaction_id.into(),
            channel: channel.into(),
            status: TxStatus::Pending,
            block_number: None,
            validation_code: None,
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn block_number(&self) -> Option<u64> {
        self.block_number
    }

    pub fn validation_code(&self) -> Option<i32> {
        self.validation_code
    }

    /// Applies a commit notification. Returns false when the event is for
    /// another transaction or the record is already terminal.
    pub fn apply(&mut self, event: &CommitEvent) -> bool {
        if self.status.is_terminal() || event.transaction_id != self.transaction_id {
            return false;
        }
        self.status = if event.validation_code == TX_VALIDATION_CODE_VALID {
            TxStatus::Valid
        } else {
            TxStatus::Invalid
        };
        self.block_number = Some(event.block_number);
        self.validation_code = Some(event.validation_code);
        true
    }

    /// Marks the record TIMED_OUT unless it is already terminal.
    pub fn time_out(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TxStatus::TimedOut;
        true
    }
}

pub type CommitStream = BoxStream<'static, CommitEvent>;

/// Where commit outcomes come from.
///
/// Sources without event support return `None` from `subscribe`; the waiter
/// then polls.
#[async_trait]
pub trait CommitSource: Send + Sync {
    fn subscribe(&self, _channel: &str) -> Option<CommitStream> {
        None
    }

    /// `Ok(None)` while the transaction is not on the ledger yet.
    async fn poll(
        &self,
        channel: &str,
        transaction_id: &str,
    ) -> Result<Option<CommitEvent>, ClientError>;
}

type PendingPoll<'a> = BoxFuture<'a, Result<Option<CommitEvent>, ClientError>>;

pub struct CommitWaiter {
    source: Arc<dyn CommitSource>,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl CommitWaiter {
    /// Each poll of `source` is abandoned after `poll_timeout`.
    pub fn new(
        source: Arc<dyn CommitSource>,
        poll_interval: Duration,
        poll_timeout: Duration,
    ) -> Self {
        CommitWaiter {
            source,
            poll_interval,
            poll_timeout,
        }
    }

    /// Waits until the transaction's ledger outcome is known or `deadline` passes.
    ///
    /// A deadline yields a TIMED_OUT record, not an error: the transaction
    /// may still commit later. Cancellation drops the subscription and any
    /// poll in flight.
    pub async fn wait_for_commit(
        &self,
        transaction_id: &str,
        channel: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<TransactionRecord, GatewayError> {
        let mut record = TransactionRecord::pending(transaction_id, channel);
        let mut events = self.source.subscribe(channel);
        if events.is_none() {
            debug!(channel, "no commit event support, polling");
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);
        let mut in_flight: Option<PendingPoll<'_>> = None;
        let mut polled = false;

        while !record.status().is_terminal() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(tx_id = transaction_id, "commit wait cancelled");
                    return Err(GatewayError::cancelled(Stage::WaitCommit));
                }
                _ = &mut expiry => {
                    record.time_out();
                }
                event = next_event(&mut events) => match event {
                    Some(event) => {
                        if record.apply(&event) {
                            debug!(
                                tx_id = transaction_id,
                                block = event.block_number,
                                "commit event received"
                            );
                        }
                    }
                    None => {
                        debug!(channel, "commit event stream ended, polling");
                        events = None;
                    }
                },
                answer = next_answer(&mut in_flight) => {
                    in_flight = None;
                    match answer {
                        Ok(Some(event)) => {
                            record.apply(&event);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(tx_id = transaction_id, error = %err, "commit status poll failed")
                        }
                    }
                }
                _ = ticker.tick(), if in_flight.is_none() && (events.is_none() || !polled) => {
                    polled = true;
                    let limit = deadline.min(Instant::now() + self.poll_timeout);
                    in_flight = Some(self.bounded_poll(channel, transaction_id, limit));
                }
            }
        }

        info!(
            tx_id = transaction_id,
            channel,
            status = ?record.status(),
            block = record.block_number(),
            "transaction resolved"
        );
        Ok(record)
    }

    /// One poll of the transaction's state, without waiting for the commit.
    pub async fn status(
        &self,
        transaction_id: &str,
        channel: &str,
        cancel: &CancellationToken,
    ) -> Result<TransactionRecord, GatewayError> {
        let mut record = TransactionRecord::pending(transaction_id, channel);
        let limit = Instant::now() + self.poll_timeout;
        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::cancelled(Stage::Query)),
            answer = self.bounded_poll(channel, transaction_id, limit) => answer,
        };
        match answer {
            Ok(Some(event)) => {
                record.apply(&event);
                Ok(record)
            }
            Ok(None) => Ok(record),
            Err(err) => Err(GatewayError::from_client(
                err,
                Stage::Query,
                None,
                crate::error::ErrorKind::UpstreamUnavailable,
            )),
        }
    }

    fn bounded_poll<'a>(
        &'a self,
        channel: &'a str,
        transaction_id: &'a str,
        limit: Instant,
    ) -> PendingPoll<'a> {
        Box::pin(async move {
            match tokio::time::timeout_at(limit, self.source.poll(channel, transaction_id)).await {
                Ok(answer) => answer,
                Err(_) => Err(ClientError::Transport(format!(
                    "commit status of {} not returned in time",
                    transaction_id
                ))),
            }
        })
    }
}

async fn next_event(events: &mut Option<CommitStream>) -> Option<CommitEvent> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn next_answer(
    in_flight: &mut Option<PendingPoll<'_>>,
) -> Result<Option<CommitEvent>, ClientError> {
    match in_flight {
        Some(poll) => poll.await,
        None => std::future::pending().await,
    }
}
