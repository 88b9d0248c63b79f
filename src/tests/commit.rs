#[cfg(test)]
mod commit_waiter_test {
    use std::{sync::Arc, time::Duration};

    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use crate::{
        commit::{CommitEvent, CommitWaiter, TxStatus},
        error::{ErrorKind, Stage},
        tests::fakes::{FakeCommits, init_tracing},
    };

    fn event(tx: &str, code: i32) -> CommitEvent {
        CommitEvent {
            transaction_id: tx.into(),
            block_number: 12,
            validation_code: code,
        }
    }

    fn waiter(commits: &Arc<FakeCommits>, poll_interval_ms: u64) -> CommitWaiter {
        CommitWaiter::new(
            commits.clone(),
            Duration::from_millis(poll_interval_ms),
            Duration::from_secs(1),
        )
    }

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn commit_before_subscription_is_caught_by_first_poll() {
        init_tracing();
        let commits = FakeCommits::streaming();
        commits.publish(event("tx1", 0));
        let record = waiter(&commits, 50)
            .wait_for_commit("tx1", "mychannel", in_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.status(), TxStatus::Valid);
        assert_eq!(record.block_number(), Some(12));
        assert_eq!(commits.polls(), 1);
    }

    #[tokio::test]
    async fn streamed_event_resolves_without_further_polling() {
        init_tracing();
        let commits = FakeCommits::streaming();
        let publisher = commits.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            publisher.publish(event("tx-other", 0));
            publisher.publish(event("tx1", 11));
        });
        let record = waiter(&commits, 20)
            .wait_for_commit("tx1", "mychannel", in_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.status(), TxStatus::Invalid);
        assert_eq!(record.validation_code(), Some(11));
        assert_eq!(commits.polls(), 1);
    }

    #[tokio::test]
    async fn polling_source_is_polled_until_commit() {
        init_tracing();
        let commits = FakeCommits::polling();
        let publisher = commits.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            publisher.publish(event("tx1", 0));
        });
        let record = waiter(&commits, 20)
            .wait_for_commit("tx1", "mychannel", in_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.status(), TxStatus::Valid);
        assert!(commits.polls() > 1);
    }

    #[tokio::test]
    async fn ended_stream_falls_back_to_polling() {
        init_tracing();
        let commits = FakeCommits::streaming();
        let publisher = commits.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            publisher.end_streams();
            tokio::time::sleep(Duration::from_millis(60)).await;
            publisher.publish(event("tx1", 0));
        });
        let record = waiter(&commits, 20)
            .wait_for_commit("tx1", "mychannel", in_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.status(), TxStatus::Valid);
        assert!(commits.polls() > 1);
        assert_eq!(commits.open_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_yields_timed_out_record() {
        init_tracing();
        let commits = FakeCommits::streaming();
        let record = waiter(&commits, 100)
            .wait_for_commit("tx1", "mychannel", in_secs(60), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.status(), TxStatus::TimedOut);
        assert_eq!(record.block_number(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_poll_does_not_outlive_the_deadline() {
        init_tracing();
        let commits = FakeCommits::polling();
        commits.stall();
        let started = Instant::now();
        let w = waiter(&commits, 100);
        let cancel = CancellationToken::new();
        let waiting = w.wait_for_commit("tx1", "mychannel", in_secs(5), &cancel);
        let record = tokio::time::timeout(Duration::from_secs(600), waiting)
            .await
            .expect("commit wait never resolved")
            .unwrap();
        assert_eq!(record.status(), TxStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(6));
        assert!(commits.polls() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_poll_gives_way_to_cancellation() {
        init_tracing();
        let commits = FakeCommits::polling();
        commits.stall();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let w = waiter(&commits, 100);
        let waiting = w.wait_for_commit("tx1", "mychannel", in_secs(30), &cancel);
        let err = tokio::time::timeout(Duration::from_secs(600), waiting)
            .await
            .expect("commit wait never resolved")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert_eq!(err.stage, Stage::WaitCommit);
    }

    #[tokio::test]
    async fn cancellation_drops_the_subscription() {
        init_tracing();
        let commits = FakeCommits::streaming();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = waiter(&commits, 50)
            .wait_for_commit("tx1", "mychannel", in_secs(5), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert_eq!(err.stage, Stage::WaitCommit);
        assert_eq!(commits.open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn status_is_a_single_poll() {
        let commits = FakeCommits::polling();
        let waiter = waiter(&commits, 50);
        let cancel = CancellationToken::new();
        let record = waiter.status("tx1", "mychannel", &cancel).await.unwrap();
        assert_eq!(record.status(), TxStatus::Pending);
        commits.publish(event("tx1", 0));
        let record = waiter.status("tx1", "mychannel", &cancel).await.unwrap();
        assert_eq!(record.status(), TxStatus::Valid);
        assert_eq!(commits.polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_status_poll_is_upstream_unavailable() {
        let commits = FakeCommits::polling();
        commits.stall();
        let started = Instant::now();
        let err = waiter(&commits, 50)
            .status("tx1", "mychannel", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UpstreamUnavailable);
        assert_eq!(err.stage, Stage::Query);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
