//! Static mapping between protocol attribute identifiers and their
//! semantic roles. Discovery walks the two known service groups and binds
//! every attribute that maps to a role; anything else is logged and
//! skipped.

use uuid::Uuid;

use crate::device::constants::{
    CHAR_ACCELERATION, CHAR_AMBIENT_LIGHT, CHAR_AUTO_MODE, CHAR_CURRENT_TINT, CHAR_DRIVE_STATE,
    CHAR_GOAL_MOTOR_OPEN, CHAR_GOAL_TINT, CHAR_HUMIDITY, CHAR_MOTOR_OPEN, CHAR_TEMPERATURE,
};
use crate::device::types::Role;

impl Role {
    pub fn from_uuid(uuid: Uuid) -> Option<Role> {
        match uuid {
            u if u == CHAR_CURRENT_TINT => Some(Role::CurrentTint),
            u if u == CHAR_GOAL_TINT => Some(Role::GoalTint),
            u if u == CHAR_DRIVE_STATE => Some(Role::DriveState),
            u if u == CHAR_AUTO_MODE => Some(Role::AutoMode),
            u if u == CHAR_MOTOR_OPEN => Some(Role::MotorOpen),
            u if u == CHAR_GOAL_MOTOR_OPEN => Some(Role::GoalMotorOpen),
            u if u == CHAR_TEMPERATURE => Some(Role::Temperature),
            u if u == CHAR_HUMIDITY => Some(Role::Humidity),
            u if u == CHAR_AMBIENT_LIGHT => Some(Role::AmbientLight),
            u if u == CHAR_ACCELERATION => Some(Role::Acceleration),
            _ => None,
        }
    }

    pub fn uuid(self) -> Uuid {
        match self {
            Role::CurrentTint => CHAR_CURRENT_TINT,
            Role::GoalTint => CHAR_GOAL_TINT,
            Role::DriveState => CHAR_DRIVE_STATE,
            Role::AutoMode => CHAR_AUTO_MODE,
            Role::MotorOpen => CHAR_MOTOR_OPEN,
            Role::GoalMotorOpen => CHAR_GOAL_MOTOR_OPEN,
            Role::Temperature => CHAR_TEMPERATURE,
            Role::Humidity => CHAR_HUMIDITY,
            Role::AmbientLight => CHAR_AMBIENT_LIGHT,
            Role::Acceleration => CHAR_ACCELERATION,
        }
    }

    /// Roles a tint command may be written to.
    pub fn is_writable(self) -> bool {
        matches!(self, Role::GoalTint | Role::GoalMotorOpen | Role::AutoMode)
    }

    pub fn all() -> [Role; 10] {
        [
            Role::CurrentTint,
            Role::GoalTint,
            Role::DriveState,
            Role::AutoMode,
            Role::MotorOpen,
            Role::GoalMotorOpen,
            Role::Temperature,
            Role::Humidity,
            Role::AmbientLight,
            Role::Acceleration,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn every_role_round_trips_through_its_uuid() {
        for role in Role::all() {
            assert_eq!(Role::from_uuid(role.uuid()), Some(role));
        }
    }

    #[test]
    fn unknown_uuid_maps_to_no_role() {
        let battery_level = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
        assert_eq!(Role::from_uuid(battery_level), None);
    }

    #[test]
    fn role_uuids_are_distinct() {
        let roles = Role::all();
        for (i, a) in roles.iter().enumerate() {
            for b in &roles[i + 1..] {
                assert_ne!(a.uuid(), b.uuid());
            }
        }
    }
}
