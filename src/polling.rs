//! Generic collection cycle loop.
//!
//! Every upstream driver runs the same outer shape: prepare a cycle,
//! collect, sleep, repeat until shutdown. The loop keeps running when a
//! cycle fails: one bad upstream response must not kill a daemon that
//! has been polling for weeks. Every wait races the cancellation
//! token.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Result of a single collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Data was collected and forwarded.
    Collected,
    /// Nothing to do this cycle (e.g. the window was below the minimum
    /// span).
    Idle,
    /// Shutdown was observed mid-cycle.
    Shutdown,
}

/// Trait implemented by collection drivers.
///
/// A driver wires the walker, pool, retry, and cache into cycles for one
/// upstream source; the loop below supplies the daemon shape around it.
#[async_trait]
pub trait PollingCollector {
    /// The state type prepared for each cycle.
    type State: Send;
    /// The driver's error type.
    type Error: std::error::Error + Send;

    /// Name used in cycle logs.
    fn name(&self) -> &str;

    /// Prepare state for one cycle; `None` when there is nothing to do.
    ///
    /// `cold_start` is true on the first cycle after process start, for
    /// recovery work that only makes sense once (e.g. adopting on-disk
    /// cache entries, probing the checkpoint store).
    async fn prepare(&mut self, cold_start: bool) -> Result<Option<Self::State>, Self::Error>;

    /// Run the cycle.
    async fn collect(&mut self, state: Self::State) -> Result<CycleOutcome, Self::Error>;
}

/// Run collection cycles separated by `delay` until shutdown.
///
/// A zero delay runs a single cycle and returns. A failed cycle is
/// logged and the loop continues; drivers abort permanently by
/// cancelling the token themselves (fatal configuration problems should
/// be caught before this loop starts).
pub async fn run_collection_loop<C: PollingCollector>(
    collector: &mut C,
    delay: Duration,
    token: CancellationToken,
) {
    let mut first_cycle = true;

    loop {
        if token.is_cancelled() {
            break;
        }

        // Race preparation against shutdown.
        let prepared = tokio::select! {
            biased;

            _ = token.cancelled() => {
                info!("{}: shutdown requested during preparation", collector.name());
                break;
            }

            result = async {
                let cold_start = first_cycle;
                first_cycle = false;
                collector.prepare(cold_start).await
            } => match result {
                Ok(state) => state,
                Err(e) => {
                    error!("{}: cycle preparation failed: {}", collector.name(), e);
                    None
                }
            },
        };

        let outcome = match prepared {
            Some(state) => match collector.collect(state).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("{}: cycle failed: {}", collector.name(), e);
                    CycleOutcome::Idle
                }
            },
            None => CycleOutcome::Idle,
        };

        match outcome {
            CycleOutcome::Shutdown => break,
            CycleOutcome::Collected => {
                info!("{}: cycle complete", collector.name());
            }
            CycleOutcome::Idle => {
                info!("{}: nothing to collect", collector.name());
            }
        }

        if delay.is_zero() {
            break;
        }

        info!(
            "{}: sleeping {}s until next cycle",
            collector.name(),
            delay.as_secs()
        );
        tokio::select! {
            _ = token.cancelled() => {
                info!("{}: shutdown requested during cycle delay", collector.name());
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct CycleFailed;

    impl fmt::Display for CycleFailed {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "cycle failed")
        }
    }

    impl std::error::Error for CycleFailed {}

    struct CountingCollector {
        cycles: u32,
        cold_starts: u32,
        fail_on: Option<u32>,
        shutdown_after: Option<u32>,
    }

    impl CountingCollector {
        fn new() -> Self {
            Self {
                cycles: 0,
                cold_starts: 0,
                fail_on: None,
                shutdown_after: None,
            }
        }
    }

    #[async_trait]
    impl PollingCollector for CountingCollector {
        type State = ();
        type Error = CycleFailed;

        fn name(&self) -> &str {
            "counting"
        }

        async fn prepare(&mut self, cold_start: bool) -> Result<Option<()>, CycleFailed> {
            if cold_start {
                self.cold_starts += 1;
            }
            Ok(Some(()))
        }

        async fn collect(&mut self, _state: ()) -> Result<CycleOutcome, CycleFailed> {
            self.cycles += 1;
            if self.fail_on == Some(self.cycles) {
                return Err(CycleFailed);
            }
            if self.shutdown_after == Some(self.cycles) {
                return Ok(CycleOutcome::Shutdown);
            }
            Ok(CycleOutcome::Collected)
        }
    }

    #[tokio::test]
    async fn test_zero_delay_runs_once() {
        let mut collector = CountingCollector::new();
        run_collection_loop(&mut collector, Duration::ZERO, CancellationToken::new()).await;
        assert_eq!(collector.cycles, 1);
        assert_eq!(collector.cold_starts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_does_not_stop_loop() {
        let mut collector = CountingCollector::new();
        collector.fail_on = Some(1);
        collector.shutdown_after = Some(3);

        run_collection_loop(
            &mut collector,
            Duration::from_secs(60),
            CancellationToken::new(),
        )
        .await;

        // Cycle 1 failed, cycles 2 and 3 still ran.
        assert_eq!(collector.cycles, 3);
        // cold_start was only set on the first cycle.
        assert_eq!(collector.cold_starts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_loop_during_delay() {
        let mut collector = CountingCollector::new();
        let token = CancellationToken::new();

        tokio::spawn({
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                token.cancel();
            }
        });

        run_collection_loop(&mut collector, Duration::from_secs(3600), token).await;
        assert_eq!(collector.cycles, 1);
    }

    #[tokio::test]
    async fn test_shutdown_outcome_stops_loop() {
        let mut collector = CountingCollector::new();
        collector.shutdown_after = Some(1);

        run_collection_loop(
            &mut collector,
            Duration::from_secs(3600),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(collector.cycles, 1);
    }
}
