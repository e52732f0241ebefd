//! Tracker wired to scripted transport and snapshot source.

use std::sync::Arc;
use std::time::Duration;

use execution_tracker::{
    ExecutionId, ExecutionTracker, ExecutionView, TestSnapshotSource, TestTransport,
    TrackerConfig, TrackerHandle, ViewSubscription,
};

use super::EXECUTION_ID;

pub struct TestHarness {
    pub transport: Arc<TestTransport>,
    pub snapshots: Arc<TestSnapshotSource>,
    pub tracker: ExecutionTracker,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: TrackerConfig) -> Self {
        let transport = Arc::new(TestTransport::new());
        let snapshots = Arc::new(TestSnapshotSource::new());
        let tracker = ExecutionTracker::new(config, transport.clone(), snapshots.clone())
            .expect("valid test config");

        Self {
            transport,
            snapshots,
            tracker,
        }
    }

    pub async fn attach(&self) -> TrackerHandle {
        self.tracker.attach(ExecutionId::new(EXECUTION_ID)).await
    }
}

/// Short delays so paused-time tests advance quickly.
pub fn test_config() -> TrackerConfig {
    TrackerConfig::default()
        .with_reconnect(3, 100, 1_000)
        .with_snapshot_interval_ms(5_000)
        .with_fallback_after_ms(2_000)
        .with_log_retention(50)
}

/// Wait (in virtual time) for a published view matching `predicate`.
pub async fn wait_for<F>(sub: &mut ViewSubscription, mut predicate: F) -> Arc<ExecutionView>
where
    F: FnMut(&ExecutionView) -> bool,
{
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let view = sub.next().await.expect("tracker stopped while waiting");
            if predicate(&view) {
                return view;
            }
        }
    })
    .await
    .expect("timed out waiting for view")
}

/// Let spawned tasks run until the runtime goes idle.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
