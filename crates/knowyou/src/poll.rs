use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    /// Cycles that ran to completion.
    pub completed: u64,
    /// Cycles cancelled by the per-cycle timeout.
    pub timed_out: u64,
}

/// Run `cycle` every `interval` until `token` is cancelled.
///
/// The first cycle starts one interval after the call. The next wait only
/// begins once the previous cycle has finished, so cycles never overlap.
/// A cycle exceeding `cycle_timeout` is dropped and the loop moves on.
/// Cancellation also drops a cycle that is in flight.
pub async fn poll_until_cancelled<F, Fut>(
    interval: Duration,
    cycle_timeout: Option<Duration>,
    token: CancellationToken,
    mut cycle: F,
) -> PollStats
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut stats = PollStats::default();
    let mut n: u64 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        n += 1;
        let finished = tokio::select! {
            _ = token.cancelled() => break,
            finished = run_with_timeout(cycle_timeout, cycle(n)) => finished,
        };

        if finished {
            stats.completed += 1;
        } else {
            stats.timed_out += 1;
            tracing::warn!(cycle = n, timeout_ms = cycle_timeout.map(|d| d.as_millis() as u64), "cycle timed out");
        }
    }

    tracing::debug!(completed = stats.completed, timed_out = stats.timed_out, "poll loop stopped");
    stats
}

async fn run_with_timeout<Fut: Future<Output = ()>>(timeout: Option<Duration>, fut: Fut) -> bool {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.is_ok(),
        None => {
            fut.await;
            true
        }
    }
}
