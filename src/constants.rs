
/// Every wire unit is exactly one 64-byte packet, matching the HID report
/// size and the UART frame length of the vendor bootloaders.
pub const MAX_PACKET_SIZE: usize = 64;

/// Packet header: cmd(1) + status(1) + seq(2 LE) + checksum(2 LE).
pub const HEADER_SIZE: usize = 6;

/// Payload capacity of a single packet.
pub const MAX_PAYLOAD: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Data bytes carried by the first packet of a program transfer,
/// after the addr(4) + total_len(4) payload fields.
pub const FIRST_CHUNK: usize = MAX_PAYLOAD - 8;

/// Bootloader version reported by `Connect`.
pub const FIRMWARE_VERSION: u32 = 0x0000_0100;

pub mod offsets {
    pub const CMD: usize = 0;
    pub const STATUS: usize = 1;
    pub const SEQ: usize = 2;
    pub const CHECKSUM: usize = 4;
    pub const PAYLOAD: usize = 6;
}

pub mod commands {
    /// Data phase of an in-progress program or read transfer.
    pub const CONTINUE: u8 = 0x00;
    pub const PROGRAM: u8 = 0xa0;
    pub const WRITE_CONFIG: u8 = 0xa1;
    pub const READ_CONFIG: u8 = 0xa2;
    pub const ERASE: u8 = 0xa3;
    pub const READ: u8 = 0xa5;
    pub const RESET_OR_RUN: u8 = 0xab;
    pub const CONNECT: u8 = 0xae;
}

pub mod status {
    pub const OK: u8 = 0x00;
    pub const UNKNOWN_COMMAND: u8 = 0x01;
    pub const OUT_OF_RANGE: u8 = 0x02;
    pub const FLASH_FAILED: u8 = 0x03;
    pub const CHECKSUM_MISMATCH: u8 = 0x04;
    pub const TRANSPORT_TIMEOUT: u8 = 0x05;
}
