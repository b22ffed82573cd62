use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, warn};

/// Drive one pipeline: tick, wait out the remainder of the interval,
/// repeat. Ticks never overlap because the loop is sequential, and a
/// tick that outruns its budget is cancelled so the next one starts on
/// time. A failed tick is logged and never blocks the next.
pub async fn run_pipeline<F, Fut>(
    name: &'static str,
    interval: Duration,
    tick_budget: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    loop {
        let started = tokio::time::Instant::now();

        tokio::select! {
            result = tokio::time::timeout(tick_budget, tick()) => match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} tick failed: {:#}", name, e),
                Err(_) => warn!("{} tick exceeded its {:?} budget — cancelled", name, tick_budget),
            },
            _ = shutdown.changed() => return,
        }

        let sleep = interval.saturating_sub(started.elapsed());
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = shutdown.changed() => return,
        }
    }
}
