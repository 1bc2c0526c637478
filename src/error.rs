use std::io;
use thiserror::Error;
use std::str::Utf8Error;
use btleplug;
use serde_json;

use crate::device::types::Role;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

/// Failures surfaced by the byte codec. A payload whose length does not
/// match the wire format for its role is dropped, never partially applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unexpected payload length for {role:?}: got {got} bytes, expected {expected}")]
    Length { role: Role, got: usize, expected: usize },

    #[error("Unknown drive state byte: {0:#04x}")]
    UnknownDriveState(u8),
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No device connected, or no attribute bound for the requested role")]
    NotConnected,

    #[error("A write is already pending; wait for its acknowledgment")]
    WriteRejected,

    #[error("Attribute role {0:?} is not writable")]
    NotWritable(Role),

    #[error("The device did not acknowledge the write in time")]
    WriteTimeout,

    #[error("Failed to decode attribute payload: {source}")]
    Decode { #[from] source: DecodeError },

    #[error("Transport failure: {reason}")]
    Transport { reason: String },

    #[error("Unknown device id: {0}")]
    UnknownDevice(String),

    #[error("The session task is no longer running")]
    SessionClosed,
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (device): {source}")]
    DeviceError { #[from] source: DeviceError },
}
