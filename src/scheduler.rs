//! Timer-driven background refresh, independent of request traffic.

use crate::engine::AggregationEngine;
use crate::upstream::UpstreamClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Trigger a full refresh immediately, then once per `period`, forever.
///
/// Triggers that land while a pass is still running are dropped by the
/// engine's single-flight guard, so a slow upstream cannot pile up passes.
pub async fn run<U: UpstreamClient>(engine: Arc<AggregationEngine<U>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        info!("triggering scheduled refresh");
        engine.refresh_all().await;
    }
}
