//! CRC16 used by EPDI framing
//!
//! Polynomial 0x8005, MSB-first, initial value 0, no reflection and no final XOR.
//! The lookup table is built at compile time.

const POLY: u16 = 0x8005;

static TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut fcs = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            fcs = if fcs & 0x8000 != 0 {
                (fcs << 1) ^ POLY
            } else {
                fcs << 1
            };
            bit += 1;
        }
        table[i] = fcs;
        i += 1;
    }
    table
}

/// Calculate the CRC16 of `data`
pub fn calculate(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        TABLE[((crc >> 8) as u8 ^ byte) as usize] ^ (crc << 8)
    })
}
