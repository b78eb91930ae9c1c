//! Parameter envelope — the 8-byte request/response wire format.
//!
//! Every parameter read/write, regardless of channel (internal, serial,
//! external CAN), travels as this payload on the parameter's own message ID:
//!
//! ```text
//! byte 0     operation
//! bytes 1..5 value (f32, little-endian)
//! byte 5     source channel
//! byte 6     request id (1..=255, 0 = unsolicited)
//! byte 7     reserved
//! ```

use crate::msg::CanMessage;

/// Envelope length on the wire.
pub const PARAM_MSG_LEN: usize = 8;

static_assertions::const_assert_eq!(PARAM_MSG_LEN, 8);

// ─── Operations ─────────────────────────────────────────────────────

/// Parameter envelope operation byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ParamOperation {
    /// Unsolicited value broadcast.
    StatusBroadcast = 0,
    /// Read the current value.
    ReadRequest = 1,
    /// Write a new value.
    WriteRequest = 2,
    /// Response carrying the current value.
    ReadResponse = 3,
    /// Acknowledgement carrying the written value.
    WriteAck = 4,
    /// Error response; the error code travels in `value`.
    Error = 5,
}

impl ParamOperation {
    /// Decode an operation byte.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::StatusBroadcast),
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::ReadResponse),
            4 => Some(Self::WriteAck),
            5 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error codes carried in the `value` field of an `Error` envelope.
pub const PARAM_ERROR_INVALID_OPERATION: f32 = 1.0;
pub const PARAM_ERROR_READ_ONLY: f32 = 2.0;
pub const PARAM_ERROR_OUT_OF_RANGE: f32 = 3.0;

// ─── Channels ───────────────────────────────────────────────────────

/// Source channel of a parameter request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    Internal = 0,
    SerialUsb = 1,
    Serial1 = 2,
    Serial2 = 3,
    CanBus = 4,
}

impl Channel {
    /// Decode a channel byte; unknown values fall back to `Internal`.
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::SerialUsb,
            2 => Self::Serial1,
            3 => Self::Serial2,
            4 => Self::CanBus,
            _ => Self::Internal,
        }
    }
}

// ─── Envelope ───────────────────────────────────────────────────────

/// Decoded parameter envelope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamMsg {
    pub operation: ParamOperation,
    pub value: f32,
    pub source_channel: u8,
    pub request_id: u8,
}

impl ParamMsg {
    /// Encode into the 8-byte wire payload.
    pub fn to_bytes(&self) -> [u8; PARAM_MSG_LEN] {
        let mut out = [0u8; PARAM_MSG_LEN];
        out[0] = self.operation as u8;
        out[1..5].copy_from_slice(&self.value.to_le_bytes());
        out[5] = self.source_channel;
        out[6] = self.request_id;
        out
    }

    /// Decode from a full 8-byte payload.
    ///
    /// Returns `None` when the payload is short or the operation byte is
    /// outside the defined set — callers answer the latter with an
    /// invalid-operation error using [`raw_operation`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PARAM_MSG_LEN {
            return None;
        }
        let operation = ParamOperation::from_u8(bytes[0])?;
        let mut v = [0u8; 4];
        v.copy_from_slice(&bytes[1..5]);
        Some(Self {
            operation,
            value: f32::from_le_bytes(v),
            source_channel: bytes[5],
            request_id: bytes[6],
        })
    }

    /// Decode from a bus message; requires an exact 8-byte payload.
    pub fn from_msg(msg: &CanMessage) -> Option<Self> {
        if msg.len as usize != PARAM_MSG_LEN {
            return None;
        }
        Self::from_bytes(&msg.buf)
    }

    /// Build a response envelope echoing a request's correlation fields.
    pub fn response(operation: ParamOperation, value: f32, request: &ParamMsg) -> Self {
        Self {
            operation,
            value,
            source_channel: request.source_channel,
            request_id: request.request_id,
        }
    }
}

/// Raw operation byte of an 8-byte payload (valid or not).
pub fn raw_operation(msg: &CanMessage) -> Option<u8> {
    if msg.len as usize == PARAM_MSG_LEN {
        Some(msg.buf[0])
    } else {
        None
    }
}

/// Extract correlation fields from an 8-byte payload whose operation byte
/// may be invalid, so errors can still echo channel and request id.
pub fn raw_correlation(msg: &CanMessage) -> Option<(u8, u8)> {
    if msg.len as usize == PARAM_MSG_LEN {
        Some((msg.buf[5], msg.buf[6]))
    } else {
        None
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let param = ParamMsg {
            operation: ParamOperation::ReadRequest,
            value: 42.5,
            source_channel: Channel::SerialUsb as u8,
            request_id: 7,
        };
        let bytes = param.to_bytes();
        assert_eq!(bytes[0], 1);
        let decoded = ParamMsg::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, param);
    }

    #[test]
    fn invalid_operation_byte_rejected() {
        let mut bytes = [0u8; 8];
        bytes[0] = 0xEE;
        assert!(ParamMsg::from_bytes(&bytes).is_none());
    }

    #[test]
    fn short_payload_rejected() {
        let msg = CanMessage::from_float(0x1000, 1.0);
        assert!(ParamMsg::from_msg(&msg).is_none());
        assert!(raw_operation(&msg).is_none());
    }

    #[test]
    fn response_echoes_correlation() {
        let request = ParamMsg {
            operation: ParamOperation::WriteRequest,
            value: 99.0,
            source_channel: Channel::CanBus as u8,
            request_id: 200,
        };
        let ack = ParamMsg::response(ParamOperation::WriteAck, 99.0, &request);
        assert_eq!(ack.source_channel, Channel::CanBus as u8);
        assert_eq!(ack.request_id, 200);
        assert_eq!(ack.operation, ParamOperation::WriteAck);
    }

    #[test]
    fn raw_correlation_survives_bad_operation() {
        let mut bytes = [0u8; 8];
        bytes[0] = 0x77; // undefined operation
        bytes[5] = 3;
        bytes[6] = 12;
        let msg = CanMessage::new(0x1000, &bytes);
        assert_eq!(raw_correlation(&msg), Some((3, 12)));
        assert_eq!(raw_operation(&msg), Some(0x77));
    }

    #[test]
    fn channel_round_trips() {
        for ch in [
            Channel::Internal,
            Channel::SerialUsb,
            Channel::Serial1,
            Channel::Serial2,
            Channel::CanBus,
        ] {
            assert_eq!(Channel::from_u8(ch as u8), ch);
        }
        assert_eq!(Channel::from_u8(0xFF), Channel::Internal);
    }
}
