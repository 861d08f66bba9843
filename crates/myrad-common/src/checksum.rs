// checksum.rs — CRC-32 over file and packet payloads

use crc::{Crc, CRC_32_ISO_HDLC};

const CRC_CALC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Compute the CRC-32 of an entire block of data.
pub fn crc_block(data: &[u8]) -> u32 {
    CRC_CALC.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_value() {
        // Standard CRC-32 check value
        assert_eq!(crc_block(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_consistency() {
        let data = b"lighting payload";
        assert_eq!(crc_block(data), crc_block(data));
        assert_ne!(crc_block(data), crc_block(b"lighting payloae"));
    }
}
