use crate::error::{ErgError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Upper bound for target power in watts
pub const MAX_TARGET_WATTS: u16 = 2500;

/// Fitness machine control point opcodes
///
/// All commands are single-byte opcodes, optionally followed by a
/// little-endian parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Acquire control of the machine
    RequestControl = 0x00,
    /// Reset the machine to its initial state
    Reset = 0x01,
    /// Set target power (`i16` watts)
    SetTargetPower = 0x05,
    /// Start or resume the session
    StartOrResume = 0x07,
    /// Stop or pause the session
    StopOrPause = 0x08,
    /// Envelope opcode of control point responses
    Response = 0x80,
}

impl OpCode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x01 => Some(Self::Reset),
            0x05 => Some(Self::SetTargetPower),
            0x07 => Some(Self::StartOrResume),
            0x08 => Some(Self::StopOrPause),
            0x80 => Some(Self::Response),
            _ => None,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestControl => write!(f, "request control"),
            Self::Reset => write!(f, "reset"),
            Self::SetTargetPower => write!(f, "set target power"),
            Self::StartOrResume => write!(f, "start or resume"),
            Self::StopOrPause => write!(f, "stop or pause"),
            Self::Response => write!(f, "response"),
        }
    }
}

/// Result codes carried by control point responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Command accepted
    Success,
    /// Opcode not supported by the machine
    NotSupported,
    /// Parameter out of range
    InvalidParameter,
    /// Machine failed to execute the command
    OperationFailed,
    /// Control has not been granted
    ControlNotPermitted,
    /// Code outside the known set
    Other(u8),
}

impl ResultCode {
    /// Raw wire value
    #[must_use]
    pub const fn raw(self) -> u8 {
        match self {
            Self::Success => 0x01,
            Self::NotSupported => 0x02,
            Self::InvalidParameter => 0x03,
            Self::OperationFailed => 0x04,
            Self::ControlNotPermitted => 0x05,
            Self::Other(value) => value,
        }
    }
}

impl From<u8> for ResultCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Success,
            0x02 => Self::NotSupported,
            0x03 => Self::InvalidParameter,
            0x04 => Self::OperationFailed,
            0x05 => Self::ControlNotPermitted,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::NotSupported => write!(f, "not supported"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::OperationFailed => write!(f, "operation failed"),
            Self::ControlNotPermitted => write!(f, "control not permitted"),
            Self::Other(_) => write!(f, "unknown result"),
        }
    }
}

/// Command written to the control point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    /// Opcode
    pub opcode: OpCode,
    /// Parameter bytes
    pub payload: Vec<u8>,
}

impl ControlCommand {
    /// Create a command without parameter
    #[must_use]
    pub const fn new(opcode: OpCode) -> Self {
        Self {
            opcode,
            payload: Vec::new(),
        }
    }

    /// Create request-control command
    #[must_use]
    pub const fn request_control() -> Self {
        Self::new(OpCode::RequestControl)
    }

    /// Create reset command
    #[must_use]
    pub const fn reset() -> Self {
        Self::new(OpCode::Reset)
    }

    /// Create start-or-resume command
    #[must_use]
    pub const fn start_or_resume() -> Self {
        Self::new(OpCode::StartOrResume)
    }

    /// Create stop-or-pause command
    #[must_use]
    pub const fn stop_or_pause() -> Self {
        Self::new(OpCode::StopOrPause)
    }

    /// Create set-target-power command
    ///
    /// Values above [`MAX_TARGET_WATTS`] are clamped before encoding.
    #[must_use]
    pub fn set_target_power(watts: u16) -> Self {
        let watts = i16::try_from(watts.min(MAX_TARGET_WATTS)).unwrap_or(i16::MAX);
        Self {
            opcode: OpCode::SetTargetPower,
            payload: watts.to_le_bytes().to_vec(),
        }
    }

    /// Target power carried by a set-target-power command
    #[must_use]
    pub fn target_power(&self) -> Option<i16> {
        if self.opcode != OpCode::SetTargetPower || self.payload.len() < 2 {
            return None;
        }
        let mut buf = &self.payload[..];
        Some(buf.get_i16_le())
    }

    /// Serialize command to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.opcode as u8);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse command from bytes
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::ParseError`] for an empty buffer or unknown opcode.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (&first, rest) = data
            .split_first()
            .ok_or_else(|| ErgError::ParseError("Empty control point write".to_string()))?;
        let opcode = OpCode::from_u8(first)
            .ok_or_else(|| ErgError::ParseError(format!("Unknown opcode: {first:02X}")))?;
        Ok(Self {
            opcode,
            payload: rest.to_vec(),
        })
    }
}

/// Acknowledgment notification from the control point
///
/// Layout: `[0x80, request opcode, result code, ...]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlResponse {
    /// Raw opcode being acknowledged
    pub request: u8,
    /// Result code
    pub result: ResultCode,
}

impl ControlResponse {
    /// Parse a control point notification
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::ParseError`] when the buffer is short or does not
    /// carry the response envelope.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 3 {
            return Err(ErgError::ParseError(format!(
                "Response too short: {} bytes, expected 3",
                data.len()
            )));
        }

        let mut buf = data;
        let envelope = buf.get_u8();
        if envelope != OpCode::Response as u8 {
            return Err(ErgError::ParseError(format!(
                "Not a response envelope: {envelope:02X}"
            )));
        }
        let request = buf.get_u8();
        let result = ResultCode::from(buf.get_u8());

        Ok(Self { request, result })
    }

    /// Whether the device accepted the command
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result == ResultCode::Success
    }

    /// Acknowledged opcode, if known
    #[must_use]
    pub const fn request_opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.request)
    }

    /// Convert a rejection into an error
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::CommandRejected`] when the result is not success.
    pub fn into_result(self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(ErgError::CommandRejected {
                opcode: self.request,
                result: self.result.raw(),
            })
        }
    }

    /// Human-readable description of a rejection
    #[must_use]
    pub fn describe(&self) -> String {
        let name = self
            .request_opcode()
            .map_or_else(|| "unknown command".to_string(), |op| op.to_string());
        match self.into_result() {
            Ok(()) => format!("{name} (0x{:02X}) accepted", self.request),
            Err(e) => format!("{name}: {e} ({})", self.result),
        }
    }
}

/// Device-initiated event from the machine status channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    /// Machine was reset
    Reset,
    /// Stopped by the user
    StoppedByUser,
    /// Paused by the user
    PausedByUser,
    /// Stopped by the safety key
    StoppedBySafetyKey,
    /// Started or resumed by the user
    StartedOrResumed,
    /// Target power change acknowledged
    TargetPowerChanged(i16),
    /// Another client took control
    ControlPermissionLost,
    /// Event not interpreted by this crate
    Other(u8),
}

impl MachineStatus {
    /// Parse a machine status notification
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::ParseError`] for an empty buffer or a truncated
    /// parameter.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if !buf.has_remaining() {
            return Err(ErgError::ParseError("Empty machine status".to_string()));
        }

        let status = match buf.get_u8() {
            0x01 => Self::Reset,
            0x02 => match buf.has_remaining().then(|| buf.get_u8()) {
                Some(0x02) => Self::PausedByUser,
                _ => Self::StoppedByUser,
            },
            0x03 => Self::StoppedBySafetyKey,
            0x04 => Self::StartedOrResumed,
            0x08 => {
                if buf.remaining() < 2 {
                    return Err(ErgError::ParseError(
                        "Target power status too short".to_string(),
                    ));
                }
                Self::TargetPowerChanged(buf.get_i16_le())
            }
            0xFF => Self::ControlPermissionLost,
            other => Self::Other(other),
        };

        Ok(status)
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset => write!(f, "Device status 0x01: reset"),
            Self::StoppedByUser => write!(f, "Device status 0x02: stopped by user"),
            Self::PausedByUser => write!(f, "Device status 0x02: paused by user"),
            Self::StoppedBySafetyKey => write!(f, "Device status 0x03: stopped by safety key"),
            Self::StartedOrResumed => write!(f, "Device status 0x04: started or resumed"),
            Self::TargetPowerChanged(watts) => {
                write!(f, "Device status 0x08: target power changed to {watts} W")
            }
            Self::ControlPermissionLost => write!(f, "Device status 0xFF: control permission lost"),
            Self::Other(code) => write!(f, "Device status 0x{code:02X}"),
        }
    }
}

/// Clamp a requested target to the accepted range
///
/// `clamp(w) = max(0, min(round(w), 2500))`; NaN maps to 0.
#[must_use]
pub fn clamp_watts(watts: f64) -> u16 {
    if watts.is_nan() {
        return 0;
    }
    let clamped = watts.round().clamp(0.0, f64::from(MAX_TARGET_WATTS));
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let watts = clamped as u16;
    watts
}
