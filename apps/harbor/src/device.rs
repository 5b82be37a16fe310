use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use harbor_proto::{ControlCommand, MotorDirection, Movement};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::DeviceError;
use crate::relay::CommandRelay;

/// Who issued a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOrigin {
    pub correlation_id: String,
    /// Present when the command came from a viewer connection
    pub viewer_id: Option<String>,
}

/// Executes control commands against boat hardware (pins, motors).
///
/// The control channel relays whatever this returns, so an absent or broken
/// backend only ever shows up as a failed command.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        origin: &CommandOrigin,
        command: &ControlCommand,
    ) -> Result<Value, DeviceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceMode {
    /// In-memory pins and motors (demo mode)
    Simulated,
    /// Forward each viewer command to the boat the viewer is watching
    Boat,
    /// No hardware attached; every command fails
    None,
}

pub fn build_backend(mode: DeviceMode, relay: &CommandRelay) -> Arc<dyn DeviceBackend> {
    match mode {
        DeviceMode::Simulated => Arc::new(SimulatedDevice::new()),
        DeviceMode::Boat => Arc::new(relay.clone()),
        DeviceMode::None => Arc::new(UnavailableDevice),
    }
}

pub struct UnavailableDevice;

#[async_trait]
impl DeviceBackend for UnavailableDevice {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn execute(
        &self,
        _origin: &CommandOrigin,
        _command: &ControlCommand,
    ) -> Result<Value, DeviceError> {
        Err(DeviceError::Unavailable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MotorStatus {
    pub direction: MotorDirection,
    pub speed: u8,
}

impl MotorStatus {
    const STOPPED: MotorStatus = MotorStatus {
        direction: MotorDirection::Stop,
        speed: 0,
    };
}

const LEFT: &str = "left";
const RIGHT: &str = "right";

/// Pin and motor state kept in memory; a boat without GPIO still answers
/// commands with plausible telemetry.
pub struct SimulatedDevice {
    state: Mutex<SimulatedState>,
}

#[derive(Default)]
struct SimulatedState {
    pins: BTreeMap<u8, bool>,
    motors: BTreeMap<String, MotorStatus>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        let mut motors = BTreeMap::new();
        motors.insert(LEFT.to_string(), MotorStatus::STOPPED);
        motors.insert(RIGHT.to_string(), MotorStatus::STOPPED);
        Self {
            state: Mutex::new(SimulatedState {
                pins: BTreeMap::new(),
                motors,
            }),
        }
    }

    pub fn pin(&self, pin: u8) -> Option<bool> {
        self.state.lock().pins.get(&pin).copied()
    }

    pub fn motor(&self, motor_id: &str) -> Option<MotorStatus> {
        self.state.lock().motors.get(motor_id).copied()
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedState {
    fn set_motor(
        &mut self,
        motor_id: &str,
        direction: MotorDirection,
        speed: u8,
    ) -> Result<(), DeviceError> {
        let motor = self
            .motors
            .get_mut(motor_id)
            .ok_or_else(|| DeviceError::UnknownMotor(motor_id.to_string()))?;
        *motor = match direction {
            MotorDirection::Stop => MotorStatus::STOPPED,
            direction => MotorStatus { direction, speed },
        };
        Ok(())
    }

    fn drive(
        &mut self,
        left: (MotorDirection, u8),
        right: (MotorDirection, u8),
    ) -> Result<(), DeviceError> {
        self.set_motor(LEFT, left.0, left.1)?;
        self.set_motor(RIGHT, right.0, right.1)
    }

    fn stop_all(&mut self) {
        for motor in self.motors.values_mut() {
            *motor = MotorStatus::STOPPED;
        }
    }

    fn telemetry(&self) -> Value {
        let pins: BTreeMap<String, bool> = self
            .pins
            .iter()
            .map(|(pin, on)| (pin.to_string(), *on))
            .collect();
        json!({ "pins": pins, "motors": self.motors })
    }
}

#[async_trait]
impl DeviceBackend for SimulatedDevice {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn execute(
        &self,
        _origin: &CommandOrigin,
        command: &ControlCommand,
    ) -> Result<Value, DeviceError> {
        self.apply(command)
    }
}

impl SimulatedDevice {
    /// Apply `command` to the in-memory state and report the result.
    pub fn apply(&self, command: &ControlCommand) -> Result<Value, DeviceError> {
        use MotorDirection::{Backward, Forward, Stop};

        let mut state = self.state.lock();
        match command {
            ControlCommand::SetPin { pin, state: on } => {
                state.pins.insert(*pin, *on);
                debug!(pin, on, "simulated pin set");
                Ok(json!({ "pin": pin, "state": on }))
            }
            ControlCommand::SetMotor {
                motor_id,
                direction,
                speed,
            } => {
                state.set_motor(motor_id, *direction, *speed)?;
                Ok(json!({ "motor_id": motor_id, "motor": state.motors.get(motor_id.as_str()) }))
            }
            ControlCommand::Move { movement, speed } => {
                let s = *speed;
                match movement {
                    Movement::Forward => state.drive((Forward, s), (Forward, s))?,
                    Movement::Backward => state.drive((Backward, s), (Backward, s))?,
                    Movement::Left => state.drive((Stop, 0), (Forward, s))?,
                    Movement::Right => state.drive((Forward, s), (Stop, 0))?,
                    Movement::SpinLeft => state.drive((Backward, s), (Forward, s))?,
                    Movement::SpinRight => state.drive((Forward, s), (Backward, s))?,
                    Movement::Stop => state.stop_all(),
                }
                Ok(state.telemetry())
            }
            ControlCommand::StopMotors => {
                state.stop_all();
                Ok(state.telemetry())
            }
            ControlCommand::Status => Ok(state.telemetry()),
            ControlCommand::Ping { .. } => Err(DeviceError::Io(
                "ping is answered by the control channel".to_string(),
            )),
        }
    }
}
