//! Wire codec for attribute payloads.
//!
//! The peripheral's wire format is fixed-width little-endian integers with
//! no tags or self-describing lengths, so an exact length check is the
//! only structural validation available. Anything else is treated as a
//! corrupt payload and dropped.

use crate::device::types::{DriveState, LightLevels, Role, Temperature};
use crate::error::DecodeError;

fn single_byte(role: Role, bytes: &[u8]) -> Result<u8, DecodeError> {
    if bytes.len() != 1 {
        return Err(DecodeError::Length { role, got: bytes.len(), expected: 1 });
    }
    Ok(bytes[0])
}

/// Tint level as a raw percentage byte. Values above 100 are passed
/// through unchanged; the display layer clamps.
pub fn decode_tint(role: Role, bytes: &[u8]) -> Result<u8, DecodeError> {
    single_byte(role, bytes)
}

pub fn decode_humidity(bytes: &[u8]) -> Result<u8, DecodeError> {
    single_byte(Role::Humidity, bytes)
}

/// Motor positions and the auto-mode flag share the tint wire format: a
/// single raw byte.
pub fn decode_percent(role: Role, bytes: &[u8]) -> Result<u8, DecodeError> {
    single_byte(role, bytes)
}

/// Temperature as a 16-bit little-endian value in tenths of a degree,
/// with raw values above 32768 read as two's-complement negatives.
pub fn decode_temperature(bytes: &[u8]) -> Result<Temperature, DecodeError> {
    if bytes.len() != 2 {
        return Err(DecodeError::Length {
            role: Role::Temperature,
            got: bytes.len(),
            expected: 2,
        });
    }

    let raw = bytes[0] as u32 | ((bytes[1] as u32) << 8);
    if raw > 32768 {
        Ok(Temperature(-(65536 - raw as i32)))
    } else {
        Ok(Temperature(raw as i32))
    }
}

/// Inverse of [`decode_temperature`], for values within the representable
/// 16-bit range.
pub fn encode_temperature(temperature: Temperature) -> [u8; 2] {
    let raw = if temperature.0 < 0 {
        (65536 + temperature.0) as u16
    } else {
        temperature.0 as u16
    };

    [(raw & 0xff) as u8, (raw >> 8) as u8]
}

/// The ambient light attribute packs three 32-bit little-endian counts,
/// each in hundredths: interior, exterior, exterior-tinted.
pub fn decode_illuminance(bytes: &[u8]) -> Result<LightLevels, DecodeError> {
    if bytes.len() != 12 {
        return Err(DecodeError::Length {
            role: Role::AmbientLight,
            got: bytes.len(),
            expected: 12,
        });
    }

    let word = |offset: usize| -> f32 {
        let raw = bytes[offset] as u32
            | ((bytes[offset + 1] as u32) << 8)
            | ((bytes[offset + 2] as u32) << 16)
            | ((bytes[offset + 3] as u32) << 24);
        raw as f32 / 100.0
    };

    Ok(LightLevels {
        interior: word(0),
        exterior: word(4),
        exterior_tinted: word(8),
    })
}

pub fn decode_drive_state(bytes: &[u8]) -> Result<DriveState, DecodeError> {
    let value = single_byte(Role::DriveState, bytes)?;
    match value {
        0x00 => Ok(DriveState::Idle),
        0x01 => Ok(DriveState::Tinting),
        0x02 => Ok(DriveState::Bleaching),
        0x03 => Ok(DriveState::Working),
        other => Err(DecodeError::UnknownDriveState(other)),
    }
}

/// Truncates to an 8-bit unsigned value for outgoing tint/motor commands.
/// Callers pre-validate the 0-100 domain.
pub fn encode_byte(value: i64) -> [u8; 1] {
    [(value & 0xff) as u8]
}
