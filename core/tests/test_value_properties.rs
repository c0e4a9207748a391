//! Property tests for the value codec.

use blegate_core::normalize;
use blegate_core::value::{decode, decode_with, encode, parse, DecodePolicy};
use proptest::prelude::*;

proptest! {
    /// One-byte integers read back unsigned with the same low byte.
    #[test]
    fn one_byte_integers_round_trip(value in -128i64..=255) {
        let bytes = encode(Some(&format!(".1.{}", value))).unwrap();
        prop_assert_eq!(bytes.len(), 1);
        let expected = value.rem_euclid(256);
        let decoded = decode(&bytes);
        if expected == 0 {
            prop_assert_eq!(decoded.num, None, "zero omits num");
        } else {
            prop_assert_eq!(decoded.num, Some(expected));
        }
    }

    /// Two-byte integers read back as i16.
    #[test]
    fn two_byte_integers_round_trip(value in i16::MIN as i64..=u16::MAX as i64) {
        let bytes = encode(Some(&format!(".2.{}", value))).unwrap();
        prop_assert_eq!(bytes.len(), 2);
        let expected = i64::from(value as u16 as i16);
        let decoded = decode_with(&bytes, DecodePolicy::corrected());
        prop_assert_eq!(decoded.num, Some(expected));
        prop_assert_eq!(decode(&bytes).num, (expected != 0).then_some(expected));
    }

    /// Four-byte integers read back as i32.
    #[test]
    fn four_byte_integers_round_trip(value in any::<i32>()) {
        let bytes = encode(Some(&format!(".4.{}", value))).unwrap();
        prop_assert_eq!(&bytes, &value.to_le_bytes().to_vec());
        let decoded = decode(&bytes);
        prop_assert_eq!(decoded.len, 4);
        prop_assert_eq!(decoded.num, (value != 0).then_some(i64::from(value)));
    }

    /// Hex input comes back lowercased.
    #[test]
    fn hex_round_trip(bytes in proptest::collection::vec(any::<u8>(), 1..64), upper in any::<bool>()) {
        let text = if upper {
            hex::encode_upper(&bytes)
        } else {
            hex::encode(&bytes)
        };
        let decoded = decode(&encode(Some(&text)).unwrap());
        prop_assert_eq!(decoded.hex, text.to_lowercase());
        prop_assert_eq!(decoded.len, bytes.len());
    }

    /// Tilde strings write exactly their printable body.
    #[test]
    fn ascii_round_trip(body in "[ -~]{1,40}") {
        let bytes = parse(&format!("~{}", body)).unwrap();
        prop_assert_eq!(&bytes, &body.as_bytes().to_vec());
        let decoded = decode_with(&bytes, DecodePolicy::corrected());
        prop_assert_eq!(decoded.text, Some(body));
    }

    /// Odd-length strings that are neither tilde nor dot prefixed never
    /// encode.
    #[test]
    fn odd_length_hex_is_rejected(text in "[0-9a-fA-F]{1}([0-9a-fA-F]{2}){0,10}") {
        prop_assert!(encode(Some(&text)).is_none());
    }

    /// A non-printable byte anywhere in a tilde string rejects it.
    #[test]
    fn control_characters_are_rejected(prefix in "[a-z]{0,5}", control in 0u8..0x20) {
        let text = format!("~{}{}", prefix, control as char);
        prop_assert!(encode(Some(&text)).is_none());
    }

    /// Address equality ignores separators and case.
    #[test]
    fn address_equality(bytes in proptest::array::uniform6(any::<u8>())) {
        let plain = hex::encode(bytes);
        let colons = bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        prop_assert!(normalize::equal(&plain, &colons));
        prop_assert!(normalize::equal(&colons, &plain));
        prop_assert_eq!(normalize::normalize(&colons), plain);
    }
}
