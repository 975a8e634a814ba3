//! Session supervisor
//!
//! Owns the two single-instance pipeline slots and the probe entry point.
//! A single control thread is the expected caller, but every slot sits
//! behind a mutex so concurrent callers cannot double-start a pipeline.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::device::{self, CameraDescriptor};
use super::pipeline::{PreviewPipeline, StreamConfig, StreamingPipeline};
use crate::error::Result;
use crate::events::{ControlEvent, EventBus};

/// Settle delay between stopping a pipeline and restarting it with a new
/// configuration; cameras misbehave when reopened immediately.
const RECONFIGURE_SETTLE: Duration = Duration::from_millis(500);

/// What slot bookkeeping needs from a pipeline instance.
trait ManagedPipeline: Send {
    async fn wait_until_started(&mut self) -> Result<()>;
    async fn stop(self);
}

impl ManagedPipeline for PreviewPipeline {
    async fn wait_until_started(&mut self) -> Result<()> {
        PreviewPipeline::wait_until_started(self).await
    }

    async fn stop(self) {
        PreviewPipeline::stop(self).await;
    }
}

impl ManagedPipeline for StreamingPipeline {
    async fn wait_until_started(&mut self) -> Result<()> {
        StreamingPipeline::wait_until_started(self).await
    }

    async fn stop(self) {
        StreamingPipeline::stop(self).await;
    }
}

/// Fill an empty slot with a freshly spawned pipeline. An occupied slot
/// makes this a no-op that never constructs a second instance; a pipeline
/// that fails to start is reaped and never stored.
async fn start_slot<P: ManagedPipeline>(
    slot: &Mutex<Option<P>>,
    spawn: impl FnOnce() -> P,
) -> Result<()> {
    let mut guard = slot.lock().await;
    if guard.is_some() {
        debug!("Pipeline already active, ignoring start");
        return Ok(());
    }

    let mut pipeline = spawn();
    match pipeline.wait_until_started().await {
        Ok(()) => {
            *guard = Some(pipeline);
            Ok(())
        }
        Err(e) => {
            // The loop already published Failed; just reap the task
            pipeline.stop().await;
            Err(e)
        }
    }
}

/// Take and stop whatever the slot holds. No-op when it is empty.
async fn drain_slot<P: ManagedPipeline>(slot: &Mutex<Option<P>>) {
    match slot.lock().await.take() {
        Some(pipeline) => pipeline.stop().await,
        None => debug!("No pipeline to stop"),
    }
}

/// Coordinates preview, streaming and probing over one event bus.
///
/// Starts are idempotent (a second start of an active slot is a no-op), as
/// are stops of an empty slot. Configuration is validated before any device
/// resource is acquired; validation failures leave no partial state.
pub struct SessionSupervisor {
    bus: Arc<EventBus>,
    preview: Mutex<Option<PreviewPipeline>>,
    stream: Mutex<Option<StreamingPipeline>>,
}

impl SessionSupervisor {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            preview: Mutex::new(None),
            stream: Mutex::new(None),
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Probe for cameras and publish the result as a `DeviceList` event.
    pub async fn refresh_devices(&self) -> Result<Vec<CameraDescriptor>> {
        let cameras = tokio::task::spawn_blocking(device::probe_cameras)
            .await
            .map_err(|e| crate::error::AppError::ReadFailed(format!("probe task: {}", e)))?;
        self.bus.publish(ControlEvent::DeviceList {
            cameras: cameras.clone(),
        });
        Ok(cameras)
    }

    /// Start the preview pipeline. No-op when one is already active.
    pub async fn start_preview(&self, config: StreamConfig, viewport: (u32, u32)) -> Result<()> {
        if let Err(e) = config.validate() {
            self.publish_error("preview", &e);
            return Err(e);
        }

        let bus = self.bus.clone();
        start_slot(&self.preview, move || {
            PreviewPipeline::start(config, viewport, bus)
        })
        .await
    }

    /// Stop the preview pipeline. No-op when none is active.
    pub async fn stop_preview(&self) {
        drain_slot(&self.preview).await;
    }

    /// Full-restart reconfiguration of the preview.
    pub async fn reconfigure_preview(
        &self,
        config: StreamConfig,
        viewport: (u32, u32),
    ) -> Result<()> {
        self.stop_preview().await;
        tokio::time::sleep(RECONFIGURE_SETTLE).await;
        self.start_preview(config, viewport).await
    }

    /// Start the streaming pipeline. No-op when one is already active.
    pub async fn start_stream(&self, config: StreamConfig) -> Result<()> {
        if let Err(e) = config.validate().and_then(|_| config.validate_sink()) {
            self.publish_error("streaming", &e);
            return Err(e);
        }

        let bus = self.bus.clone();
        start_slot(&self.stream, move || StreamingPipeline::start(config, bus)).await
    }

    /// Stop the streaming pipeline. No-op when none is active.
    pub async fn stop_stream(&self) {
        drain_slot(&self.stream).await;
    }

    /// Full-restart reconfiguration of the stream.
    pub async fn reconfigure_stream(&self, config: StreamConfig) -> Result<()> {
        self.stop_stream().await;
        tokio::time::sleep(RECONFIGURE_SETTLE).await;
        self.start_stream(config).await
    }

    /// Stop both pipelines unconditionally.
    pub async fn shutdown(&self) {
        info!("Supervisor shutting down");
        self.stop_preview().await;
        self.stop_stream().await;
    }

    fn publish_error(&self, module: &str, err: &crate::error::AppError) {
        warn!("{} start rejected: {}", module, err);
        self.bus.publish(ControlEvent::ErrorOccurred {
            module: module.to_string(),
            message: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::video::format::Resolution;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn supervisor() -> Arc<SessionSupervisor> {
        SessionSupervisor::new(Arc::new(EventBus::new()))
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_any_device_access() {
        let sup = supervisor();
        let config = StreamConfig {
            fps: 24,
            ..StreamConfig::default()
        };

        let err = sup.start_preview(config, (640, 480)).await.unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        // Slot stays empty: stop is a no-op rather than a hang
        sup.stop_preview().await;
    }

    #[tokio::test]
    async fn test_empty_sink_url_rejected() {
        let sup = supervisor();
        let config = StreamConfig {
            resolution: Resolution::HD720,
            fps: 25,
            sink_url: String::new(),
            ..StreamConfig::default()
        };

        let err = sup.start_stream(config).await.unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_config_rejection_publishes_error_event() {
        let sup = supervisor();
        let mut rx = sup.events().subscribe();

        let config = StreamConfig {
            resolution: Resolution::new(111, 222),
            ..StreamConfig::default()
        };
        let _ = sup.start_preview(config, (640, 480)).await;

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ControlEvent::ErrorOccurred { .. }));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let sup = supervisor();
        sup.stop_preview().await;
        sup.stop_stream().await;
        sup.shutdown().await;
    }

    struct FakePipeline {
        fail_start: bool,
        stops: Arc<AtomicU32>,
    }

    impl ManagedPipeline for FakePipeline {
        async fn wait_until_started(&mut self) -> Result<()> {
            if self.fail_start {
                Err(AppError::DeviceUnavailable {
                    index: 0,
                    reason: "no frames".into(),
                })
            } else {
                Ok(())
            }
        }

        async fn stop(self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_second_start_of_occupied_slot_is_noop() {
        let slot = Mutex::new(None);
        let stops = Arc::new(AtomicU32::new(0));
        let spawned = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let stops = stops.clone();
            let spawned = spawned.clone();
            let result = start_slot(&slot, move || {
                spawned.fetch_add(1, Ordering::SeqCst);
                FakePipeline {
                    fail_start: false,
                    stops,
                }
            })
            .await;
            assert!(result.is_ok());
        }

        // Only the first start builds a pipeline; the second is absorbed
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        assert!(slot.lock().await.is_some());
    }

    #[tokio::test]
    async fn test_failed_start_leaves_slot_empty_and_reaps_instance() {
        let slot = Mutex::new(None);
        let stops = Arc::new(AtomicU32::new(0));

        let result = {
            let stops = stops.clone();
            start_slot(&slot, move || FakePipeline {
                fail_start: true,
                stops,
            })
            .await
        };

        assert!(matches!(result, Err(AppError::DeviceUnavailable { .. })));
        assert!(slot.lock().await.is_none());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_stops_exactly_once() {
        let slot = Mutex::new(None);
        let stops = Arc::new(AtomicU32::new(0));

        {
            let stops = stops.clone();
            start_slot(&slot, move || FakePipeline {
                fail_start: false,
                stops,
            })
            .await
            .unwrap();
        }

        drain_slot(&slot).await;
        assert!(slot.lock().await.is_none());
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        // Draining an already-empty slot touches nothing
        drain_slot(&slot).await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
