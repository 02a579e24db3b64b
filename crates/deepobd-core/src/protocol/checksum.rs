//! BMW-FAST checksum
//!
//! The checksum is the plain byte sum of every preceding byte, truncated to 8 bits.

/// Sum of all bytes, modulo 256
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Check that the last byte of `frame` is the checksum of the bytes before it
pub fn verify(frame: &[u8]) -> bool {
    match frame.split_last() {
        Some((last, body)) => checksum(body) == *last,
        None => false,
    }
}

/// Append the checksum of `data` to it
pub fn append(data: &mut Vec<u8>) {
    let cs = checksum(data);
    data.push(cs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identification_probe_checksum() {
        // 82 F1 F1 FD FD -> 5E
        assert_eq!(checksum(&[0x82, 0xF1, 0xF1, 0xFD, 0xFD]), 0x5E);
        assert!(verify(&[0x82, 0xF1, 0xF1, 0xFD, 0xFD, 0x5E]));
    }

    #[test]
    fn test_empty() {
        assert_eq!(checksum(&[]), 0);
        assert!(!verify(&[]));
    }

    #[test]
    fn test_append() {
        let mut data = vec![0xFF, 0x02];
        append(&mut data);
        assert_eq!(data, vec![0xFF, 0x02, 0x01]);
    }
}
