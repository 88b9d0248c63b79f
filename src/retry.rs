use std::{future::Future, time::Duration};

use tracing::warn;

use crate::{config::RetryPolicy, error::ClientError, peer::PeerId};

/// Runs one logical capability call, retrying transport failures only.
///
/// Each attempt is bounded by `timeout`; an elapsed attempt counts as a
/// transport failure. Rejections, not-found and malformed answers return at
/// once.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    operation: &str,
    peer: Option<&PeerId>,
    mut call: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Transport(format!(
                "{} timed out after {:?}",
                operation, timeout
            ))),
        };
        match result {
            Err(err) if err.is_retryable() && attempt < policy.budget => {
                attempt += 1;
                warn!(
                    operation,
                    peer = peer.map(PeerId::as_str),
                    attempt,
                    error = %err,
                    "retrying after transport failure"
                );
                tokio::time::sleep(policy.backoff).await;
            }
            other => return other,
        }
    }
}
