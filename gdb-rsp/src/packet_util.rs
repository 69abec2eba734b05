//! Whole-message envelope helpers.
//!
//! [`add_envelope`] is the emission path: escape, checksum, wrap. Run-length
//! compression is never applied on emission; [`remove_envelope`] (built on the
//! incremental framer) still accepts it.

use crate::blob::Blob;
use crate::packetizer::{PacketConsumer, Packetizer};

/// Bytes that may not appear raw inside a packet body.
fn needs_escape(byte: u8) -> bool {
    matches!(byte, b'$' | b'#' | b'*' | b'}' | 0x03) || byte > 126
}

/// Wraps `body` as `$<escaped body>#<checksum>`.
pub fn add_envelope(body: &Blob) -> Blob {
    let mut escaped = Blob::new();
    for byte in body.iter() {
        if needs_escape(byte) {
            escaped.push_back(b'}');
            escaped.push_back(byte ^ 0x20);
        } else {
            escaped.push_back(byte);
        }
    }

    let checksum: u32 = escaped.iter().fold(0, |sum, b| (sum + u32::from(b)) % 256);

    escaped.push_front(b'$');
    escaped.push_back(b'#');
    escaped.push_back(hex_digit(checksum >> 4));
    escaped.push_back(hex_digit(checksum & 0xf));
    escaped
}

/// Unwraps one complete wire message, returning the body if the checksum
/// matched. Incomplete or corrupt input yields `None`.
pub fn remove_envelope(wire: &Blob) -> Option<Blob> {
    struct Collector {
        body: Option<Blob>,
    }

    impl PacketConsumer for Collector {
        fn on_packet(&mut self, body: Blob, valid_checksum: bool) {
            if valid_checksum {
                self.body = Some(body);
            }
        }

        fn on_unexpected_byte(&mut self, _byte: u8) {}

        fn on_break(&mut self) {}
    }

    let mut collector = Collector { body: None };
    Packetizer::new().on_data(&wire.to_vec(), &mut collector);
    collector.body
}

fn hex_digit(nibble: u32) -> u8 {
    char::from_digit(nibble, 16).unwrap() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trips(body: &[u8]) {
        let blob = Blob::from(body);
        let wire = add_envelope(&blob);
        assert_eq!(Some(blob), remove_envelope(&wire));
    }

    #[test]
    fn plain_body_round_trips() {
        round_trips(b"qSupported:xmlRegisters=i386");
    }

    #[test]
    fn empty_body_round_trips() {
        let wire = add_envelope(&Blob::new());
        assert_eq!("$#00", wire.to_text());
        assert_eq!(Some(Blob::new()), remove_envelope(&wire));
    }

    #[test]
    fn reserved_bytes_are_escaped() {
        let body = Blob::from(&b"$#*}\x03"[..]);
        let wire = add_envelope(&body);
        // No unescaped occurrence of a reserved byte inside the wire body.
        let inner = wire.to_vec();
        let inner = &inner[1..inner.len() - 3];
        let mut previous_was_escape = false;
        for &b in inner {
            if !previous_was_escape {
                assert!(!matches!(b, b'$' | b'#' | b'*' | 0x03), "raw 0x{b:02x} on the wire");
            }
            previous_was_escape = b == b'}' && !previous_was_escape;
        }
        assert_eq!(Some(body), remove_envelope(&wire));
    }

    #[test]
    fn high_bytes_are_escaped() {
        round_trips(&[0x7f, 0x80, 0xff, 0x00]);
    }

    #[test]
    fn every_byte_value_round_trips() {
        let body: Vec<u8> = (0..=255).collect();
        round_trips(&body);
    }

    #[test]
    fn corrupt_checksum_is_rejected() {
        let mut wire = add_envelope(&Blob::from("m20080,1"));
        wire.pop_back();
        wire.push_back(b'0');
        assert_eq!(None, remove_envelope(&wire));
    }

    #[test]
    fn run_length_is_accepted_on_receipt() {
        assert_eq!(
            Some(Blob::from("0000000")),
            remove_envelope(&Blob::from("$0*##7d"))
        );
    }
}
