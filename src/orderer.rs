use std::time::Duration;

use async_trait::async_trait;

use crate::{aggregator::EndorsedEnvelope, error::ClientError};

/// Capability to hand endorsed transactions to the ordering service.
///
/// `Ok` means the orderer accepted the envelope for ordering, not that the
/// transaction committed.
#[async_trait]
pub trait OrdererClient: Send + Sync {
    async fn submit(
        &self,
        envelope: &EndorsedEnvelope,
        timeout: Duration,
    ) -> Result<(), ClientError>;
}
