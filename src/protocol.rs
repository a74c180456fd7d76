//! Wire format of the ST-Link bootloader protocol.
//!
//! Every transfer from the host starts with a 16-byte frame. Multi-byte
//! fields are little-endian.
//!
//! ```text
//!  0       1       2..4      4..6      6..8     8..16
//! +-------+-------+---------+---------+--------+----------+
//! |opcode |sub-op | sequence| checksum| length | reserved |
//! +-------+-------+---------+---------+--------+----------+
//! ```
//!
//! Only program-data frames (`F3 01`) use the sequence, checksum and
//! length fields; they are followed by `length` payload bytes.

/// Size of a command frame.
pub const FRAME_SIZE: usize = 16;

/// Maximum payload carried by one program-data command.
pub const COMMAND_CAPACITY: usize = 1024;

/// Largest immediate reply (chip info is 20 bytes, calibration block 22).
pub const REPLY_CAPACITY: usize = 32;

/// Sequence bits that mark a payload as encrypted.
pub const SEQUENCE_PROTECTED: u16 = 0x0006;

const OP_GET_VERSION: u8 = 0xf1;
const OP_DFU: u8 = 0xf3;
const OP_CAPABILITIES: u8 = 0xf5;

const DFU_EXIT: u8 = 0x07;
const DFU_PROGRAM: u8 = 0x01;
const DFU_STATUS: u8 = 0x03;
const DFU_CHIP_INFO: u8 = 0x08;
const DFU_CALIBRATION: u8 = 0x09;
const DFU_PIN_STATE: u8 = 0x0a;

const VERSION_APIV: u8 = 0x80;
const CALIBRATION_LENGTH: u8 = 0x16;

/// Sub-command byte of a `sequence == 0, length == 5` program-data payload.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LocationCommand {
    /// Set flash target address.
    SetAddress = 0x21,
    /// Set flash target address and erase the page at it.
    ErasePage = 0x41,
}

impl LocationCommand {
    /// Decode a sub-command byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x21 => Some(LocationCommand::SetAddress),
            0x41 => Some(LocationCommand::ErasePage),
            _ => None,
        }
    }
}

/// A received 16-byte frame.
///
/// Short transfers are zero-padded, bytes beyond [`FRAME_SIZE`] are dropped.
/// The number of bytes actually received is kept because some commands
/// are only valid as complete 16-byte transfers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Frame {
    bytes: [u8; FRAME_SIZE],
    received: usize,
}

/// Decoded meaning of a frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Request {
    /// `F1 80`: firmware version, VID and PID.
    Identify,
    /// `F5 00`: capability probe.
    Capabilities,
    /// `F3 08`: chip info with the unique device id.
    ChipInfo,
    /// `F3 0A`: strap pin state.
    PinState,
    /// `F3 03 00 00`: status query.
    Status,
    /// `F3 01`: program-data command, `length` payload bytes follow.
    ProgramData {
        /// Number of payload bytes that follow the frame.
        length: u16,
    },
    /// `F3 09 16`: read calibration block of `length` bytes.
    Calibration {
        /// Number of bytes to return.
        length: u8,
    },
    /// `F3 07 00 00`: leave the programmer and reset.
    Exit,
}

impl Frame {
    /// Build a frame from a received transfer.
    pub fn new(data: &[u8]) -> Self {
        let mut bytes = [0u8; FRAME_SIZE];
        let n = data.len().min(FRAME_SIZE);
        bytes[..n].copy_from_slice(&data[..n]);
        Self {
            bytes,
            received: data.len(),
        }
    }

    /// Raw header bytes.
    pub fn bytes(&self) -> &[u8; FRAME_SIZE] {
        &self.bytes
    }

    /// Sequence field, bytes 2-3.
    pub fn sequence(&self) -> u16 {
        u16::from_le_bytes([self.bytes[2], self.bytes[3]])
    }

    /// Checksum field, bytes 4-5.
    pub fn checksum(&self) -> u16 {
        u16::from_le_bytes([self.bytes[4], self.bytes[5]])
    }

    /// Payload length field, bytes 6-7.
    pub fn length(&self) -> u16 {
        u16::from_le_bytes([self.bytes[6], self.bytes[7]])
    }

    fn is_complete(&self) -> bool {
        self.received == FRAME_SIZE
    }

    // opcode, sub-opcode and the rest of the frame all zero
    fn matches(&self, prefix: &[u8]) -> bool {
        self.bytes[..prefix.len()] == *prefix && self.bytes[prefix.len()..].iter().all(|b| *b == 0)
    }

    /// Decode the frame. Returns `None` for frames the programmer ignores.
    pub fn request(&self) -> Option<Request> {
        let b = &self.bytes;

        if self.matches(&[OP_GET_VERSION, VERSION_APIV]) {
            Some(Request::Identify)
        } else if self.matches(&[OP_CAPABILITIES]) {
            Some(Request::Capabilities)
        } else if self.matches(&[OP_DFU, DFU_CHIP_INFO]) {
            Some(Request::ChipInfo)
        } else if self.matches(&[OP_DFU, DFU_PIN_STATE]) {
            Some(Request::PinState)
        } else if b[..4] == [OP_DFU, DFU_STATUS, 0, 0] && self.is_complete() {
            Some(Request::Status)
        } else if b[0] == OP_DFU && b[1] == DFU_PROGRAM {
            Some(Request::ProgramData {
                length: self.length(),
            })
        } else if self.matches(&[OP_DFU, DFU_CALIBRATION, CALIBRATION_LENGTH]) {
            Some(Request::Calibration { length: b[2] })
        } else if b[..4] == [OP_DFU, DFU_EXIT, 0, 0] && self.is_complete() {
            Some(Request::Exit)
        } else {
            None
        }
    }
}

/// 16-bit wrapping sum of all bytes, as carried in the checksum field.
pub fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, b| acc.wrapping_add(*b as u16))
}
