//! Checksum algorithms used across the vendor protocols.

use crc::{Crc, CRC_16_MODBUS, CRC_16_XMODEM, CRC_32_ISO_HDLC};

const MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);
const XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-16/Modbus: polynomial 0xA001 reflected, initial 0xFFFF. Naviset
/// frames and command envelopes.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    MODBUS.checksum(data)
}

/// CRC-16/XMODEM variant used by the Galileo trailer.
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    XMODEM.checksum(data)
}

/// CRC-32 trailer of Teltonika data frames.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// One-byte sum modulo 256 (Autolink sub-packets).
pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_modbus_known_vector() {
        // standard check value for "123456789"
        assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_crc16_xmodem_known_vector() {
        assert_eq!(crc16_xmodem(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_crc32_known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_sum8_wraps() {
        assert_eq!(sum8(&[0xFF, 0x01]), 0x00);
        assert_eq!(sum8(&[0x10, 0x20, 0x30]), 0x60);
        assert_eq!(sum8(&[]), 0);
    }
}
