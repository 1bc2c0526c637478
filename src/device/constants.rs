use uuid::Uuid;

/**
 * Advertised names containing this fragment (case-insensitive) are treated
 * as tint windows during a scan.
 */
pub const DEVICE_NAME_FRAGMENT: &str = "tynt";

/**
 * How long (seconds) a scan runs before it stops by itself. Deployments
 * that want an open-ended scan clear this in their config.
 */
pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 10;

/**
 * How long (seconds) a pending write waits for its hardware
 * acknowledgment before it is failed, so an unresponsive peripheral
 * cannot block the command channel until disconnect.
 */
pub const WRITE_TIMEOUT_SECS: u64 = 10;

/**
 * Minimum age (seconds) of the newest retained sample before another
 * sample is accepted into a sensor history channel.
 */
pub const SAMPLE_INTERVAL_SECS: u64 = 5;

/**
 * How many samples a sensor history channel retains.
 */
pub const SAMPLE_CAPACITY: usize = 10;

// Attribute UUIDs use a fixed base with the group nibble encoding the
// service (0x1xxx control, 0x2xxx sensor).
const fn tynt_uuid(short: u128) -> Uuid {
    Uuid::from_u128(0x54796e74_0000_47a1_b8a2_d7e9c0a1fb3c | (short << 80))
}

/**
 * The service group carrying tint and motor control attributes.
 */
pub const CONTROL_SERVICE: Uuid = tynt_uuid(0x1000);

pub const CHAR_CURRENT_TINT: Uuid = tynt_uuid(0x1001);
pub const CHAR_GOAL_TINT: Uuid = tynt_uuid(0x1002);
pub const CHAR_DRIVE_STATE: Uuid = tynt_uuid(0x1003);
pub const CHAR_AUTO_MODE: Uuid = tynt_uuid(0x1004);
pub const CHAR_MOTOR_OPEN: Uuid = tynt_uuid(0x1005);
pub const CHAR_GOAL_MOTOR_OPEN: Uuid = tynt_uuid(0x1006);

/**
 * The service group carrying environment sensor attributes.
 */
pub const SENSOR_SERVICE: Uuid = tynt_uuid(0x2000);

pub const CHAR_TEMPERATURE: Uuid = tynt_uuid(0x2001);
pub const CHAR_HUMIDITY: Uuid = tynt_uuid(0x2002);
pub const CHAR_AMBIENT_LIGHT: Uuid = tynt_uuid(0x2003);
pub const CHAR_ACCELERATION: Uuid = tynt_uuid(0x2004);

/**
 * The two service groups discovery walks. Attributes outside these are
 * never bound.
 */
pub const KNOWN_SERVICES: [Uuid; 2] = [CONTROL_SERVICE, SENSOR_SERVICE];
