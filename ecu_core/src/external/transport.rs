//! Physical-layer seams for the external gateways.
//!
//! The CAN peripheral and USB/UART drivers are external collaborators;
//! the gateways only see these traits. The mock implementations back
//! tests and simulation runs with injection/inspection queues.

use std::collections::VecDeque;

use ecu_common::msg::CanMessage;

// ─── CAN ────────────────────────────────────────────────────────────

/// Frame-level access to the external CAN controller.
pub trait CanTransport {
    /// Pop the next received frame, if any.
    fn receive(&mut self) -> Option<CanMessage>;
    /// Queue a frame for transmission. False when the controller is
    /// saturated; the caller counts and drops.
    fn transmit(&mut self, msg: &CanMessage) -> bool;
}

/// Software CAN controller for tests and simulation.
#[derive(Default)]
pub struct MockCanTransport {
    rx: VecDeque<CanMessage>,
    /// Every frame the gateway transmitted.
    pub tx: Vec<CanMessage>,
    /// When set, `transmit` reports a saturated controller.
    pub fail_transmit: bool,
}

impl MockCanTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a frame as if it arrived from the wire.
    pub fn inject(&mut self, msg: CanMessage) {
        self.rx.push_back(msg);
    }

    /// Inject a raw id + payload.
    pub fn inject_frame(&mut self, id: u32, data: &[u8]) {
        self.rx.push_back(CanMessage::new(id, data));
    }
}

impl CanTransport for MockCanTransport {
    fn receive(&mut self) -> Option<CanMessage> {
        self.rx.pop_front()
    }

    fn transmit(&mut self, msg: &CanMessage) -> bool {
        if self.fail_transmit {
            return false;
        }
        self.tx.push(*msg);
        true
    }
}

// ─── Serial ─────────────────────────────────────────────────────────

/// Byte-level access to a point-to-point serial link.
pub trait SerialPort {
    /// Pop the next received byte, if any.
    fn read_byte(&mut self) -> Option<u8>;
    /// Write bytes; returns how many were accepted.
    fn write(&mut self, data: &[u8]) -> usize;
}

/// Software serial port for tests and simulation.
#[derive(Default)]
pub struct MockSerialPort {
    rx: VecDeque<u8>,
    /// Every byte the gateway wrote.
    pub tx: Vec<u8>,
    /// When set, `write` accepts nothing (saturated link).
    pub fail_writes: bool,
}

impl MockSerialPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject bytes as if they arrived from the wire.
    pub fn inject(&mut self, data: &[u8]) {
        self.rx.extend(data.iter().copied());
    }

    pub fn clear_tx(&mut self) {
        self.tx.clear();
    }
}

impl SerialPort for MockSerialPort {
    fn read_byte(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn write(&mut self, data: &[u8]) -> usize {
        if self.fail_writes {
            return 0;
        }
        self.tx.extend_from_slice(data);
        data.len()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_mock_queues_fifo() {
        let mut can = MockCanTransport::new();
        can.inject_frame(0x7DF, &[0x02, 0x01, 0x0C]);
        can.inject_frame(0x7DF, &[0x02, 0x01, 0x0D]);
        assert_eq!(can.receive().unwrap().buf[2], 0x0C);
        assert_eq!(can.receive().unwrap().buf[2], 0x0D);
        assert!(can.receive().is_none());
    }

    #[test]
    fn can_mock_records_tx() {
        let mut can = MockCanTransport::new();
        let msg = CanMessage::new(0x7E8, &[0x04, 0x41, 0x0C, 0x32, 0x00]);
        assert!(can.transmit(&msg));
        assert_eq!(can.tx.len(), 1);
        can.fail_transmit = true;
        assert!(!can.transmit(&msg));
    }

    #[test]
    fn serial_mock_byte_stream() {
        let mut port = MockSerialPort::new();
        port.inject(&[0xAA, 0x01]);
        assert_eq!(port.read_byte(), Some(0xAA));
        assert_eq!(port.read_byte(), Some(0x01));
        assert_eq!(port.read_byte(), None);
        assert_eq!(port.write(&[1, 2, 3]), 3);
        assert_eq!(port.tx, vec![1, 2, 3]);
    }
}
