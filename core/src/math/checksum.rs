/// CRC-32 (ISO 3309, reflected polynomial 0xEDB88320) used to validate
/// capture payloads.
pub struct Crc32;

const POLY: u32 = 0xEDB8_8320;

const TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

impl Crc32 {
    pub fn checksum(data: &[u8]) -> u32 {
        let crc = data.iter().fold(0xFFFF_FFFFu32, |crc, &byte| {
            TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8)
        });
        crc ^ 0xFFFF_FFFF
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_reference_vectors() {
        assert_eq!(Crc32::checksum(b""), 0);
        assert_eq!(Crc32::checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn detects_single_bit_flip() {
        let mut data = vec![0x5Au8; 64];
        let reference = Crc32::checksum(&data);
        data[17] ^= 0x04;
        assert_ne!(Crc32::checksum(&data), reference);
    }
}
