use crate::camera::{SimCameraHardware, SimCameraModel};
use crate::common::{ErrorConfig, MockMode, SimOp};
use anyhow::Result;
use astro_core::connection::HardwareLink;
use async_trait::async_trait;

/// How to open one simulated camera.
pub struct SimCameraLink {
    identity: String,
    model: SimCameraModel,
    mode: MockMode,
    errors: ErrorConfig,
    seed: Option<u64>,
}

impl SimCameraLink {
    /// `identity` is the bus position (or configured name) the camera was found at.
    pub fn new(identity: impl std::fmt::Display, model: SimCameraModel) -> Self {
        Self {
            identity: format!("sim-camera-{identity}"),
            model,
            mode: MockMode::default(),
            errors: ErrorConfig::none(),
            seed: None,
        }
    }

    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn model(&self) -> &SimCameraModel {
        &self.model
    }
}

#[async_trait]
impl HardwareLink for SimCameraLink {
    type Handle = SimCameraHardware;

    fn identity(&self) -> String {
        self.identity.clone()
    }

    async fn open(&self) -> Result<SimCameraHardware> {
        self.errors.check(SimOp::Open)?;
        tracing::info!(identity = %self.identity, model = %self.model.name, mode = ?self.mode, "sim camera opened");
        Ok(SimCameraHardware::new(
            self.model.clone(),
            self.mode,
            self.errors.clone(),
            self.seed,
        ))
    }

    async fn safe_state(&self, handle: &SimCameraHardware) -> Result<()> {
        handle.shutdown();
        Ok(())
    }

    async fn close(&self, _handle: &SimCameraHardware) -> Result<()> {
        tracing::info!(identity = %self.identity, "sim camera closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorScenario;
    use astro_core::connection::SharedDevice;

    #[tokio::test]
    async fn siblings_share_one_open_device() {
        let dir = tempfile::tempdir().unwrap();
        let device = SharedDevice::new(SimCameraLink::new("1-2", SimCameraModel::default()))
            .with_lock_dir(dir.path());
        assert_eq!(device.link().identity(), "sim-camera-1-2");

        let a = device.acquire().await.unwrap();
        let b = device.acquire().await.unwrap();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
        assert_eq!(device.ref_count().await, 2);

        device.release().await;
        assert!(device.handle().await.is_some());
        device.release().await;
        assert!(device.handle().await.is_none());
    }

    #[tokio::test]
    async fn open_failure_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let link = SimCameraLink::new("1-3", SimCameraModel::default())
            .with_errors(ErrorConfig::scenario(ErrorScenario::CommunicationLoss));
        let device = SharedDevice::new(link).with_lock_dir(dir.path());

        assert!(device.acquire().await.is_err());
        assert_eq!(device.ref_count().await, 0);
        assert!(device.handle().await.is_none());
    }
}
