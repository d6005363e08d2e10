use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::error::EngineError;
use crate::models::TelemetrySnapshot;

/// Source of device context for movement events. `collect` may block; it is always run on
/// a blocking worker with a timeout.
pub trait TelemetryProvider: Send + Sync {
    fn collect(&self) -> Result<TelemetrySnapshot>;
}

/// Provider for hosts without sensors. Every field stays empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTelemetry;

impl TelemetryProvider for NoTelemetry {
    fn collect(&self) -> Result<TelemetrySnapshot> {
        Ok(TelemetrySnapshot::default())
    }
}

pub async fn collect_with_timeout(
    provider: Arc<dyn TelemetryProvider>,
    timeout: Duration,
) -> Result<TelemetrySnapshot, EngineError> {
    let task = tokio::task::spawn_blocking(move || provider.collect());
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(snapshot))) => Ok(snapshot),
        Ok(Ok(Err(err))) => Err(EngineError::TelemetryUnavailable(format!("{err:#}"))),
        Ok(Err(join_err)) => Err(EngineError::TelemetryUnavailable(format!(
            "collector worker failed: {join_err}"
        ))),
        Err(_) => Err(EngineError::TelemetryUnavailable(format!(
            "collection timed out after {} ms",
            timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceState;

    struct Slow;

    impl TelemetryProvider for Slow {
        fn collect(&self) -> Result<TelemetrySnapshot> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(TelemetrySnapshot::default())
        }
    }

    struct Battery;

    impl TelemetryProvider for Battery {
        fn collect(&self) -> Result<TelemetrySnapshot> {
            Ok(TelemetrySnapshot {
                sensors: None,
                device: Some(DeviceState {
                    battery_level: Some(0.5),
                    ..DeviceState::default()
                }),
            })
        }
    }

    #[tokio::test]
    async fn slow_collectors_time_out() {
        let result = collect_with_timeout(Arc::new(Slow), Duration::from_millis(20)).await;
        assert!(matches!(result, Err(EngineError::TelemetryUnavailable(_))));
    }

    #[tokio::test]
    async fn snapshot_is_returned_within_the_timeout() {
        let snapshot = collect_with_timeout(Arc::new(Battery), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(snapshot.device.unwrap().battery_level, Some(0.5));
    }
}
