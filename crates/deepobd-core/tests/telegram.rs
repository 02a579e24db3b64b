//! BMW-FAST telegram framing properties

use deepobd_core::protocol::checksum;
use deepobd_core::protocol::{ProtocolError, Telegram, TelegramBuilder, TelegramHeader};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

#[test]
fn test_header_forms_by_length() {
    let short = Telegram::new(0x12, 0xF1, vec![0x3E]).to_bytes();
    assert_eq!(short, vec![0x81, 0x12, 0xF1, 0x3E, 0xC2]);

    let medium = Telegram::new(0x12, 0xF1, vec![0; 0x40]).to_bytes();
    assert_eq!(medium[..4].to_vec(), vec![0x80, 0x12, 0xF1, 0x40]);

    let long = Telegram::new(0x12, 0xF1, vec![0; 0x123]).to_bytes();
    assert_eq!(long[..6].to_vec(), vec![0x80, 0x12, 0xF1, 0x00, 0x01, 0x23]);
    assert_eq!(TelegramHeader::parse(&long).unwrap().total_len(), long.len());
}

#[test]
fn test_builder_matches_constructor() {
    let built = TelegramBuilder::new(0x12, 0xF1)
        .byte(0x22)
        .u16_be(0xF190)
        .build();
    assert_eq!(built, Telegram::new(0x12, 0xF1, vec![0x22, 0xF1, 0x90]));
}

#[test]
fn test_truncated_telegram_rejected() {
    let bytes = Telegram::new(0x12, 0xF1, vec![0x22, 0xF1, 0x90]).to_bytes();
    assert!(matches!(
        Telegram::from_bytes(&bytes[..bytes.len() - 1]),
        Err(ProtocolError::InvalidFrame(_))
    ));
    assert!(matches!(
        TelegramHeader::parse(&bytes[..4]),
        Err(ProtocolError::InvalidFrame(_))
    ));
}

proptest! {
    #[test]
    fn prop_appended_checksum_verifies(mut data in proptest::collection::vec(any::<u8>(), 0..300)) {
        checksum::append(&mut data);
        prop_assert!(checksum::verify(&data));
    }

    #[test]
    fn prop_encoded_telegram_decodes(
        target in any::<u8>(),
        source in any::<u8>(),
        payload in proptest::collection::vec(any::<u8>(), 0..600),
    ) {
        let tel = Telegram::new(target, source, payload);
        let bytes = tel.to_bytes();
        prop_assert_eq!(bytes.len(), tel.encoded_size());
        prop_assert_eq!(TelegramHeader::parse(&bytes).unwrap().total_len(), bytes.len());
        prop_assert_eq!(Telegram::from_bytes(&bytes).unwrap(), tel);
    }

    #[test]
    fn prop_corrupted_payload_fails_checksum(
        payload in proptest::collection::vec(any::<u8>(), 1..60),
        index in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let mut bytes = Telegram::new(0x12, 0xF1, payload).to_bytes();
        // payload or checksum byte, never the header
        let position = 3 + index.index(bytes.len() - 3);
        bytes[position] ^= mask;
        let result = Telegram::from_bytes(&bytes);
        prop_assert!(
            matches!(result, Err(ProtocolError::ChecksumMismatch { .. })),
            "unexpected {:?}",
            result
        );
    }
}
