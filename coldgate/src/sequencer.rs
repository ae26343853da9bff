use std::future::Future;
use std::sync::Arc;

use tokio::time::{interval, Duration, MissedTickBehavior};

/// Something that eventually reports it can serve table updates.
pub trait ReadyProbe: Send + Sync {
    fn is_ready(&self) -> bool;
}

/// Wait until `probe` reports ready, checking every `poll`, then run `connect`.
///
/// `connect` is not even constructed before readiness, so nothing it captures
/// can observe a half-initialised filter.
pub async fn connect_when_ready<P, C, Fut, T>(probe: Arc<P>, poll: Duration, connect: C) -> T
where
    P: ReadyProbe + ?Sized,
    C: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let mut ticker = interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut polls: u64 = 0;
    loop {
        ticker.tick().await;
        if probe.is_ready() {
            break;
        }
        polls += 1;
        if polls % 50 == 0 {
            tracing::info!("Still waiting for capture filter ({} polls)", polls);
        }
    }
    tracing::debug!("Capture filter ready, connecting to coordinator");
    connect().await
}
