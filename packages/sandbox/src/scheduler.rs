// ABOUTME: Periodic background task runner shared by the GC, sync and metrics loops
// ABOUTME: Runs once immediately, then on every tick until the root token is cancelled

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shortest period a loop may run at; `tokio::time::interval` rejects zero
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Spawn `run` every `period`. Cancellation stops scheduling new passes but never
/// interrupts a pass that is already running.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut run: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = if period < MIN_PERIOD {
        warn!(
            "Interval of {} task is {:?}, using {:?} instead",
            name, period, MIN_PERIOD
        );
        MIN_PERIOD
    } else {
        period
    };

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("Started {} task (interval: {:?})", name, period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            run().await;
        }

        info!("Stopped {} task", name);
    })
}
