//! Message and control-code enumerations with stable wire integers.
//!
//! The integer values are shared with existing peers on the bus (the
//! camera processes and the results listener) and must not be renumbered.
//! Integer 3 is reserved by an older request-for-test-image message that no
//! longer exists.

use std::collections::BTreeMap;
use std::fmt;

use lmon_utils::BgrFrame;

/// Wire-stable message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    Unknown = 0,
    RequestForCameraImage = 1,
    CameraImage = 2,
    Results = 4,
    Shutdown = 5,
    CameraPreImage = 6,
    Control = 7,
}

impl MessageType {
    pub fn from_wire(value: i32) -> Self {
        match value {
            1 => Self::RequestForCameraImage,
            2 => Self::CameraImage,
            4 => Self::Results,
            5 => Self::Shutdown,
            6 => Self::CameraPreImage,
            7 => Self::Control,
            _ => Self::Unknown,
        }
    }

    pub fn as_wire(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::RequestForCameraImage => "RequestForCameraImage",
            Self::CameraImage => "CameraImage",
            Self::Results => "Results",
            Self::Shutdown => "Shutdown",
            Self::CameraPreImage => "CameraPreImage",
            Self::Control => "Control",
        };
        f.write_str(name)
    }
}

/// Control instructions carried by control messages. The enumeration is
/// extensible; unknown wire values are preserved for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    Unknown,
    ClubChangeToPutter,
    ClubChangeToDriver,
    /// A wire value this build does not know about.
    Other(i32),
}

impl ControlCode {
    pub fn from_wire(value: i32) -> Self {
        match value {
            1 => Self::ClubChangeToPutter,
            2 => Self::ClubChangeToDriver,
            0 => Self::Unknown,
            other => Self::Other(other),
        }
    }

    pub fn as_wire(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::ClubChangeToPutter => 1,
            Self::ClubChangeToDriver => 2,
            Self::Other(value) => value,
        }
    }
}

/// A decoded application message, owned by whoever holds it.
///
/// Decoding hands the message to the dispatcher by value; every dispatch
/// path, early returns included, drops it deterministically.
#[derive(Debug, Clone, PartialEq)]
pub enum IpcMessage {
    CameraImage(BgrFrame),
    CameraPreImage(BgrFrame),
    Shutdown,
    RequestForCameraImage,
    Results(BTreeMap<String, String>),
    Control(ControlCode),
    Unknown,
}

impl IpcMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::CameraImage(_) => MessageType::CameraImage,
            Self::CameraPreImage(_) => MessageType::CameraPreImage,
            Self::Shutdown => MessageType::Shutdown,
            Self::RequestForCameraImage => MessageType::RequestForCameraImage,
            Self::Results(_) => MessageType::Results,
            Self::Control(_) => MessageType::Control,
            Self::Unknown => MessageType::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_wire_values_are_stable() {
        assert_eq!(MessageType::Unknown.as_wire(), 0);
        assert_eq!(MessageType::RequestForCameraImage.as_wire(), 1);
        assert_eq!(MessageType::CameraImage.as_wire(), 2);
        assert_eq!(MessageType::Results.as_wire(), 4);
        assert_eq!(MessageType::Shutdown.as_wire(), 5);
        assert_eq!(MessageType::CameraPreImage.as_wire(), 6);
        assert_eq!(MessageType::Control.as_wire(), 7);
    }

    #[test]
    fn reserved_and_unknown_integers_map_to_unknown() {
        assert_eq!(MessageType::from_wire(3), MessageType::Unknown);
        assert_eq!(MessageType::from_wire(-1), MessageType::Unknown);
        assert_eq!(MessageType::from_wire(99), MessageType::Unknown);
    }

    #[test]
    fn control_codes_round_trip_including_unknown_values() {
        for code in [
            ControlCode::Unknown,
            ControlCode::ClubChangeToPutter,
            ControlCode::ClubChangeToDriver,
            ControlCode::Other(42),
        ] {
            assert_eq!(ControlCode::from_wire(code.as_wire()), code);
        }
    }
}
