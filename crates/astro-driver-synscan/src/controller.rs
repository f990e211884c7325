//! Typed commands of one SynScan motor controller.

use crate::coordinates::AxisGeometry;
use crate::protocol::{
    decode_hex, decode_u24, Axis, Command, Direction, MotorStatus, ProtocolError, SpeedMode,
    HOME_POSITION,
};
use crate::transport::SynscanPort;
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::instrument;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Gearing and timing of one axis, read at connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AxisParameters {
    pub total_steps: u32,
    pub worm_steps: u32,
    pub timer_frequency: u32,
    pub high_speed_ratio: u32,
}

impl AxisParameters {
    pub fn geometry(&self) -> AxisGeometry {
        AxisGeometry::new(self.total_steps)
    }
}

/// Everything learnt from the controller during the connect sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountConfiguration {
    pub firmware: u32,
    pub ra: AxisParameters,
    pub dec: AxisParameters,
    pub polarscope: bool,
}

impl MountConfiguration {
    pub fn axis(&self, axis: Axis) -> &AxisParameters {
        match axis {
            Axis::Ra => &self.ra,
            Axis::Dec => &self.dec,
        }
    }
}

/// Open controller. Every command goes through the port's transaction lock.
pub struct MotorController {
    port: SynscanPort,
    session: u64,
    configuration: parking_lot::RwLock<Option<MountConfiguration>>,
}

impl MotorController {
    pub fn new(port: SynscanPort) -> Self {
        Self {
            port,
            session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            configuration: parking_lot::RwLock::new(None),
        }
    }

    /// Distinguishes this open from earlier opens of the same mount.
    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn configuration(&self) -> Option<MountConfiguration> {
        *self.configuration.read()
    }

    async fn value(&self, command: Command) -> Result<u32, ProtocolError> {
        decode_u24(&self.port.transact(command).await?)
    }

    async fn execute(&self, command: Command) -> Result<(), ProtocolError> {
        self.port.transact(command).await.map(drop)
    }

    pub async fn firmware(&self) -> Result<u32, ProtocolError> {
        self.value(Command::Firmware).await
    }

    pub async fn status(&self, axis: Axis) -> Result<MotorStatus, ProtocolError> {
        let payload = self.port.transact(Command::Status(axis)).await?;
        Ok(MotorStatus::from_bits_truncate(decode_hex(&payload)?))
    }

    pub async fn position(&self, axis: Axis) -> Result<i64, ProtocolError> {
        self.value(Command::Position(axis)).await.map(i64::from)
    }

    pub async fn set_position(&self, axis: Axis, steps: i64) -> Result<(), ProtocolError> {
        self.execute(Command::SetPosition(axis, clamp_u24(steps))).await
    }

    pub async fn initialize(&self, axis: Axis) -> Result<(), ProtocolError> {
        self.execute(Command::Initialize(axis)).await
    }

    pub async fn stop(&self, axis: Axis) -> Result<(), ProtocolError> {
        self.execute(Command::Stop(axis)).await
    }

    pub async fn instant_stop(&self, axis: Axis) -> Result<(), ProtocolError> {
        self.execute(Command::InstantStop(axis)).await
    }

    pub async fn set_gearing(
        &self,
        axis: Axis,
        speed: SpeedMode,
        direction: Direction,
    ) -> Result<(), ProtocolError> {
        self.execute(Command::SetGearing(axis, speed, direction)).await
    }

    pub async fn set_step_count(&self, axis: Axis, steps: i64) -> Result<(), ProtocolError> {
        self.execute(Command::SetStepCount(axis, clamp_u24(steps))).await
    }

    pub async fn set_rate_code(&self, axis: Axis, code: u32) -> Result<(), ProtocolError> {
        self.execute(Command::SetRateCode(axis, code)).await
    }

    pub async fn set_slowdown(&self, axis: Axis, steps: i64) -> Result<(), ProtocolError> {
        self.execute(Command::SetSlowdown(axis, clamp_u24(steps))).await
    }

    pub async fn start(&self, axis: Axis) -> Result<(), ProtocolError> {
        self.execute(Command::Start(axis)).await
    }

    pub async fn set_polarscope(&self, level: u8) -> Result<(), ProtocolError> {
        self.execute(Command::Polarscope(level)).await
    }

    pub async fn set_st4_rate(&self, code: u8) -> Result<(), ProtocolError> {
        self.execute(Command::St4Rate(Axis::Ra, code)).await
    }

    async fn axis_parameters(&self, axis: Axis) -> Result<AxisParameters, ProtocolError> {
        Ok(AxisParameters {
            total_steps: self.value(Command::TotalSteps(axis)).await?,
            worm_steps: self.value(Command::WormSteps(axis)).await?,
            timer_frequency: self.value(Command::TimerFrequency(axis)).await?,
            high_speed_ratio: self.value(Command::HighSpeedRatio(axis)).await?,
        })
    }

    /// Connect sequence: stop running motors, read axis parameters, probe the
    /// polarscope LED and initialize motors that lack the init bit.
    #[instrument(skip(self), fields(session = self.session), err)]
    pub async fn configure(&self) -> Result<MountConfiguration> {
        let firmware = self.firmware().await.context("firmware query failed")?;
        tracing::info!(
            firmware = %crate::protocol::format_firmware(firmware),
            model = crate::protocol::mount_model(firmware),
            "SynScan controller found"
        );

        let mut statuses = [MotorStatus::empty(); 2];
        for (i, axis) in Axis::BOTH.into_iter().enumerate() {
            statuses[i] = self
                .status(axis)
                .await
                .with_context(|| format!("{axis} status query failed"))?;
            if statuses[i].is_running() {
                tracing::info!(%axis, "stopping running motor");
                self.stop(axis).await?;
            }
        }

        let ra = self.axis_parameters(Axis::Ra).await.context("RA parameters")?;
        let dec = self.axis_parameters(Axis::Dec).await.context("DEC parameters")?;
        if ra.total_steps == 0 || dec.total_steps == 0 || ra.timer_frequency == 0 || dec.timer_frequency == 0 {
            bail!("controller reported zero axis steps or timer frequency");
        }

        let polarscope = self.set_polarscope(0).await.is_ok();

        for (i, axis) in Axis::BOTH.into_iter().enumerate() {
            if statuses[i].is_initialized() {
                continue;
            }
            self.initialize(axis).await?;
            let status = self.status(axis).await?;
            if !status.is_initialized() {
                tracing::error!(%axis, "motor will not initialize");
                bail!("{axis} motor will not initialize");
            }
            self.set_position(axis, i64::from(HOME_POSITION)).await?;
        }

        let configuration = MountConfiguration {
            firmware,
            ra,
            dec,
            polarscope,
        };
        *self.configuration.write() = Some(configuration);
        Ok(configuration)
    }
}

fn clamp_u24(value: i64) -> u32 {
    value.clamp(0, 0xFF_FFFF) as u32
}
