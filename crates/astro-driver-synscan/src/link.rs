//! [`HardwareLink`] for a SynScan controller, shared by the mount and guider
//! endpoints through one `SharedDevice`.

use crate::controller::MotorController;
use crate::protocol::Axis;
use crate::simulator::SimulatorConfig;
use crate::transport::{PortSpec, SynscanPort, TransportConfig};
use anyhow::Result;
use astro_core::connection::HardwareLink;
use async_trait::async_trait;
use tracing::instrument;

pub struct SynscanLink {
    spec: PortSpec,
    transport: TransportConfig,
    simulator: SimulatorConfig,
}

impl SynscanLink {
    pub fn new(spec: PortSpec, transport: TransportConfig) -> Self {
        Self {
            spec,
            transport,
            simulator: SimulatorConfig::default(),
        }
    }

    /// Controller settings used when the port is `sim://`.
    pub fn with_simulator(mut self, simulator: SimulatorConfig) -> Self {
        self.simulator = simulator;
        self
    }

    pub fn spec(&self) -> &PortSpec {
        &self.spec
    }
}

#[async_trait]
impl HardwareLink for SynscanLink {
    type Handle = MotorController;

    fn identity(&self) -> String {
        self.spec.identity()
    }

    #[instrument(skip(self), fields(port = %self.spec), err)]
    async fn open(&self) -> Result<MotorController> {
        let stream = self.spec.open(&self.simulator).await?;
        Ok(MotorController::new(SynscanPort::new(stream, self.transport)))
    }

    async fn initialize(&self, controller: &MotorController) -> Result<()> {
        controller.configure().await.map(drop)
    }

    async fn safe_state(&self, controller: &MotorController) -> Result<()> {
        for axis in Axis::BOTH {
            controller.stop(axis).await?;
        }
        Ok(())
    }

    async fn close(&self, _controller: &MotorController) -> Result<()> {
        tracing::debug!(port = %self.spec, "closing SynScan port");
        Ok(())
    }
}
