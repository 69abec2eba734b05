//! Incremental RSP stream framer.
//!
//! Removes the wire envelope (`$body#cs`), undoes `}`-escapes, expands
//! run-length repeats and verifies the modular-256 checksum. Bytes arrive in
//! arbitrary chunks; complete packets are delivered through [`PacketConsumer`].

use log::debug;

use crate::blob::Blob;

/// Sink for the framer's output.
pub trait PacketConsumer {
    /// A complete packet body, with `valid_checksum` telling whether the
    /// received checksum matched the computed one.
    fn on_packet(&mut self, body: Blob, valid_checksum: bool);

    /// A byte that is not meaningful between packets.
    fn on_unexpected_byte(&mut self, byte: u8);

    /// `0x03` outside a packet: the client requests a break.
    fn on_break(&mut self);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    /// Between packets.
    Idle,
    /// Inside `$...`, accumulating body bytes.
    Body,
    /// Just saw the escape byte `}`.
    Escape,
    /// Just saw `*`; the next byte is the repeat count.
    RunLength,
    /// Just saw `#`; expecting the first checksum digit.
    End,
    /// Expecting the second checksum digit.
    Checksum,
}

pub struct Packetizer {
    state: State,
    body: Blob,
    computed_checksum: u32,
    first_checksum_digit: u32,
}

impl Default for Packetizer {
    fn default() -> Self {
        Packetizer::new()
    }
}

impl Packetizer {
    pub fn new() -> Self {
        Packetizer {
            state: State::Idle,
            body: Blob::new(),
            computed_checksum: 0,
            first_checksum_digit: 0,
        }
    }

    /// Drops buffered state and returns to `Idle`.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.body.clear();
        self.computed_checksum = 0;
        self.first_checksum_digit = 0;
    }

    pub fn on_data(&mut self, data: &[u8], consumer: &mut dyn PacketConsumer) {
        for &byte in data {
            self.on_byte(byte, consumer);
        }
    }

    fn on_byte(&mut self, byte: u8, consumer: &mut dyn PacketConsumer) {
        match self.state {
            State::Idle => match byte {
                0x03 => consumer.on_break(),
                b'+' | b'-' => {} // transmission acks, consumed silently
                b'$' => {
                    self.body.clear();
                    self.computed_checksum = 0;
                    self.state = State::Body;
                }
                other => consumer.on_unexpected_byte(other),
            },
            State::Body => match byte {
                b'}' => {
                    self.count(byte);
                    self.state = State::Escape;
                }
                b'#' => self.state = State::End,
                b'*' => {
                    self.count(byte);
                    self.state = State::RunLength;
                }
                b if b > 126 => {
                    consumer.on_unexpected_byte(b);
                    self.reset();
                }
                b => {
                    self.count(b);
                    self.body.push_back(b);
                }
            },
            State::Escape => {
                self.count(byte);
                self.body.push_back(byte ^ 0x20);
                self.state = State::Body;
            }
            State::RunLength => {
                self.count(byte);
                let repeats = usize::from(byte).saturating_sub(29);
                match self.body.back() {
                    Some(last) => {
                        for _ in 0..repeats {
                            self.body.push_back(last);
                        }
                    }
                    // Run-length with no preceding byte is a protocol
                    // violation; expand to zero repeats.
                    None => debug!("run-length marker with empty body"),
                }
                self.state = State::Body;
            }
            State::End => match hex_value(byte) {
                Some(digit) => {
                    self.first_checksum_digit = digit;
                    self.state = State::Checksum;
                }
                None => {
                    debug!("bad checksum digit 0x{byte:02x}");
                    self.reset();
                }
            },
            State::Checksum => match hex_value(byte) {
                Some(digit) => {
                    let received = self.first_checksum_digit * 16 + digit;
                    let valid = received == self.computed_checksum % 256;
                    let body = std::mem::take(&mut self.body);
                    self.reset();
                    consumer.on_packet(body, valid);
                }
                None => {
                    debug!("bad checksum digit 0x{byte:02x}");
                    self.reset();
                }
            },
        }
    }

    fn count(&mut self, byte: u8) {
        self.computed_checksum = (self.computed_checksum + u32::from(byte)) % 256;
    }
}

fn hex_value(c: u8) -> Option<u32> {
    (c as char).to_digit(16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestConsumer {
        packets: Vec<(Blob, bool)>,
        unexpected: Vec<u8>,
        breaks: usize,
    }

    impl PacketConsumer for TestConsumer {
        fn on_packet(&mut self, body: Blob, valid_checksum: bool) {
            self.packets.push((body, valid_checksum));
        }

        fn on_unexpected_byte(&mut self, byte: u8) {
            self.unexpected.push(byte);
        }

        fn on_break(&mut self) {
            self.breaks += 1;
        }
    }

    fn feed(data: &str) -> TestConsumer {
        let mut consumer = TestConsumer::default();
        Packetizer::new().on_data(data.as_bytes(), &mut consumer);
        consumer
    }

    #[test]
    fn break_request() {
        let consumer = feed("\x03");
        assert_eq!(1, consumer.breaks);
        assert!(consumer.packets.is_empty());
    }

    #[test]
    fn empty_packet() {
        let consumer = feed("$#00");
        assert_eq!(1, consumer.packets.len());
        assert!(consumer.packets[0].0.is_empty());
        assert!(consumer.packets[0].1);
    }

    #[test]
    fn empty_packet_bad_checksum() {
        let consumer = feed("$#02");
        assert_eq!(1, consumer.packets.len());
        assert!(!consumer.packets[0].1);
    }

    #[test]
    fn simple_packet() {
        let consumer = feed("$123456#35");
        assert_eq!("123456", consumer.packets[0].0.to_text());
        assert!(consumer.packets[0].1);
    }

    #[test]
    fn spaces_survive() {
        let consumer = feed("$  #40");
        assert_eq!("  ", consumer.packets[0].0.to_text());
        assert!(consumer.packets[0].1);
    }

    #[test]
    fn escaped_byte() {
        // "}]" decodes to '}' (0x5d ^ 0x20 == 0x7d).
        let consumer = feed("$}]aa#9c");
        assert_eq!("}aa", consumer.packets[0].0.to_text());
        assert!(consumer.packets[0].1);
    }

    #[test]
    fn run_length_expansion() {
        // '#' after '*' is the count byte: 35 - 29 = 6 extra repeats of '0'.
        let consumer = feed("$0*##7d");
        assert_eq!("0000000", consumer.packets[0].0.to_text());
        assert!(consumer.packets[0].1);
    }

    #[test]
    fn run_length_with_empty_body_expands_to_nothing() {
        // '*' as the first body byte has nothing to repeat; 'J' is the count.
        let consumer = feed("$*J#74");
        assert_eq!(1, consumer.packets.len());
        assert_eq!("", consumer.packets[0].0.to_text());
    }

    #[test]
    fn unexpected_byte_in_idle() {
        let consumer = feed("#");
        assert_eq!(vec![b'#'], consumer.unexpected);
        assert!(consumer.packets.is_empty());
    }

    #[test]
    fn acks_are_consumed_silently() {
        let consumer = feed("+-$qC#b4");
        assert!(consumer.unexpected.is_empty());
        assert_eq!("qC", consumer.packets[0].0.to_text());
    }

    #[test]
    fn packets_may_arrive_in_fragments() {
        let mut consumer = TestConsumer::default();
        let mut packetizer = Packetizer::new();
        packetizer.on_data(b"$12", &mut consumer);
        packetizer.on_data(b"3456#3", &mut consumer);
        assert!(consumer.packets.is_empty());
        packetizer.on_data(b"5", &mut consumer);
        assert_eq!("123456", consumer.packets[0].0.to_text());
        assert!(consumer.packets[0].1);
    }

    #[test]
    fn byte_above_126_resets_to_idle() {
        let mut consumer = TestConsumer::default();
        let mut packetizer = Packetizer::new();
        packetizer.on_data(&[b'$', b'a', 0x80], &mut consumer);
        assert_eq!(vec![0x80], consumer.unexpected);
        // The framer must have recovered: the next packet parses cleanly.
        packetizer.on_data(b"$qC#b4", &mut consumer);
        assert_eq!("qC", consumer.packets[0].0.to_text());
    }
}
