//! Control setup packet codec
//!
//! OS-backend transfers carry the 8-byte setup packet at the head of the
//! transfer buffer, little-endian, followed by the data stage.

use crate::types::TransferSetup;
use byteorder::{ByteOrder, LittleEndian};

/// Size of a control setup packet
pub const SETUP_PACKET_SIZE: usize = 8;

/// Decoded setup packet including `wLength`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub setup: TransferSetup,
    pub w_length: u16,
}

impl SetupPacket {
    /// Decode the setup packet at the start of `buffer`
    ///
    /// Returns `None` when the buffer is shorter than a setup packet.
    pub fn decode(buffer: &[u8]) -> Option<Self> {
        if buffer.len() < SETUP_PACKET_SIZE {
            return None;
        }

        Some(Self {
            setup: TransferSetup {
                bm_request_type: buffer[0],
                b_request: buffer[1],
                w_value: LittleEndian::read_u16(&buffer[2..4]),
                w_index: LittleEndian::read_u16(&buffer[4..6]),
            },
            w_length: LittleEndian::read_u16(&buffer[6..8]),
        })
    }

    /// Encode into the 8-byte wire form
    pub fn encode(&self) -> [u8; SETUP_PACKET_SIZE] {
        let mut packet = [0u8; SETUP_PACKET_SIZE];
        packet[0] = self.setup.bm_request_type;
        packet[1] = self.setup.b_request;
        LittleEndian::write_u16(&mut packet[2..4], self.setup.w_value);
        LittleEndian::write_u16(&mut packet[4..6], self.setup.w_index);
        LittleEndian::write_u16(&mut packet[6..8], self.w_length);
        packet
    }
}
