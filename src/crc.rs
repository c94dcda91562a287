//! Table driven CRC-7 used to protect command frames.

/// CRC-7 polynomial `x^7 + x^3 + 1`, with the implicit top bit.
pub const CRC7_POLY: u8 = 0x89;

/// Lookup table, built at compile time.
static CRC7_TABLE: [u8; 256] = build_table();

/// Builds the 256 entry CRC-7 lookup table.
pub const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut entry = i as u8;
        if entry & 0x80 != 0 {
            entry ^= CRC7_POLY;
        }
        let mut bit = 1;
        while bit < 8 {
            entry <<= 1;
            if entry & 0x80 != 0 {
                entry ^= CRC7_POLY;
            }
            bit += 1;
        }
        table[i] = entry;
        i += 1;
    }
    table
}

/// Folds one more byte into a running CRC-7.
#[inline]
pub fn fold(crc: u8, byte: u8) -> u8 {
    CRC7_TABLE[usize::from((crc << 1) ^ byte)]
}

/// CRC-7 calculation.
pub fn crc7(data: &[u8]) -> u8 {
    data.iter().fold(0, |crc, &byte| fold(crc, byte))
}
