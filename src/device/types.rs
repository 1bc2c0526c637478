use futures::channel::oneshot;
use uuid::Uuid;

use crate::device::samples::SampleLog;
use crate::error::DeviceError;

/// Semantic meaning of a peripheral attribute. Exactly one attribute per
/// role is bound while a session is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    CurrentTint,
    GoalTint,
    DriveState,
    AutoMode,
    MotorOpen,
    GoalMotorOpen,
    Temperature,
    Humidity,
    AmbientLight,
    Acceleration,
}

/// What the window's electrochromic drive is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    Idle,
    Tinting,
    Bleaching,
    Working,
}

impl std::fmt::Display for DriveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            DriveState::Idle => "idle",
            DriveState::Tinting => "tinting",
            DriveState::Bleaching => "bleaching",
            DriveState::Working => "working",
        };

        write!(f, "{}", result)
    }
}

/// Connection lifecycle of the single active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            Phase::Idle => "idle",
            Phase::Scanning => "scanning",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Disconnected => "disconnected",
            Phase::Failed => "failed",
        };

        write!(f, "{}", result)
    }
}

/// A window seen during a scan. The id is the platform peripheral
/// identifier and stays stable across reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// A bound peripheral attribute. Valid only while the session is
/// connected; the session drops all handles on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeHandle {
    pub uuid: Uuid,
}

/// Temperature in signed tenths of a degree Celsius, as carried on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Temperature(pub i32);

impl Temperature {
    pub fn tenths(self) -> i32 {
        self.0
    }

    pub fn celsius(self) -> f32 {
        self.0 as f32 / 10.0
    }
}

/// The three illuminance readings reported by the ambient light
/// attribute, in fixed-point units of 0.01.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightLevels {
    pub interior: f32,
    pub exterior: f32,
    pub exterior_tinted: f32,
}

impl LightLevels {
    /// Optic transmission of the pane in percent, rounded to one decimal.
    /// None when there is no exterior light to compare against.
    pub fn transmission(&self) -> Option<f32> {
        if self.exterior == 0.0 {
            return None;
        }
        let x = (self.exterior_tinted / self.exterior) * 1000.0;
        Some(x.round() / 10.0)
    }
}

/// The externally observable session state. Published as a whole through
/// a watch channel, so readers never see a half-applied update.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub phase: Phase,
    pub scanning: bool,
    pub devices: Vec<DeviceDescriptor>,
    pub connected: Option<String>,
    pub tint: Option<u8>,
    pub goal_tint: Option<u8>,
    pub drive_state: Option<DriveState>,
    pub auto_mode: Option<u8>,
    pub motor_open: Option<u8>,
    pub goal_motor_open: Option<u8>,
    pub temperature: Option<Temperature>,
    pub humidity: Option<u8>,
    pub light: Option<LightLevels>,
    pub acceleration: Option<Vec<u8>>,
    pub history: SampleLog,
}

/// Everything the transport reports back to the session loop. The loop
/// is the only consumer; all session state mutates on its task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    DeviceDiscovered(DeviceDescriptor),
    ScanStopped,
    Connected { id: String },
    ConnectFailed { id: String, reason: String },
    AttributesBound(Vec<(Role, AttributeHandle)>),
    Notification { role: Role, payload: Vec<u8> },
    WriteAck { result: Result<(), String> },
    Disconnected,
}

/// Requests issued through a [`SessionHandle`](crate::device::session::SessionHandle).
#[derive(Debug)]
pub enum Request {
    StartScan,
    StopScan,
    Connect(String),
    Disconnect,
    Reconnect,
    RemoveDevice(String),
    Write {
        role: Role,
        value: u8,
        done: oneshot::Sender<Result<(), DeviceError>>,
    },
}
