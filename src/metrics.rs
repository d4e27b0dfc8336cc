use crate::resilience::CircuitBreaker;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, trace};

// Trace-backed counters; the Prometheus recorder in main renders whatever is registered.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "realty.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "realty.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

fn breaker_event(breaker: &'static str, event: &'static str) {
    trace!(
        target = "realty.metrics",
        breaker = breaker,
        event = event,
        "breaker_event"
    );
}

pub fn asset_batch(uploaded: usize, total: usize) {
    trace!(
        target = "realty.metrics",
        uploaded = uploaded as u64,
        total = total as u64,
        "asset_batch_ratio"
    );
}

/// Feeds a breaker's lifecycle stream into `breaker_event`. The task ends
/// when the breaker is dropped.
pub fn watch_breaker(breaker: &CircuitBreaker) -> JoinHandle<()> {
    let name = breaker.name();
    let mut events = breaker.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => breaker_event(name, event.as_str()),
                Err(RecvError::Lagged(skipped)) => debug!(
                    target = "realty.metrics",
                    breaker = name,
                    skipped = skipped,
                    "breaker_events_lagged"
                ),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::BreakerConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn watcher_stops_with_its_breaker() {
        let breaker = CircuitBreaker::new(BreakerConfig::new("watched"));
        let watcher = watch_breaker(&breaker);
        breaker.reset();
        drop(breaker);
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .expect("watcher finished")
            .expect("watcher did not panic");
    }
}
