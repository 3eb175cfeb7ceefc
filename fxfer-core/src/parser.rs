//! Byte-stream parser: finds the preamble, reads and checks one packet, hands it out.
//! Each `step` does one unit of work and may block on the reader.

use std::io::{self, Read};

use crate::integrity;
use crate::protocol::{
    MessageId, CRC_LEN, HEADER_LEN, LEN_FIELD_LEN, MSG_ID_LEN, PREAMBLE, PREAMBLE_LEN,
};
use crate::wire::{self, FrameBuffer, FrameEncodeError};

const PREAMBLE_BYTES: [u8; 4] = PREAMBLE.to_le_bytes();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    WaitPreamble,
    WaitBody,
    ProcessMessage,
}

/// Framing failure. The parser is back in `WaitPreamble` whenever one is reported.
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    #[error("transport read failed: {0}")]
    Read(#[source] io::Error),
    #[error("packet needs {needed} bytes, {available} left in receive buffer")]
    NoMemory { needed: usize, available: usize },
    #[error("wrong crc: given {given:#010x}, computed {computed:#010x}")]
    BadCrc { given: u32, computed: u32 },
    #[error("unrecognized message id {0}")]
    UnknownId(u8),
}

/// Result of one parser step.
#[derive(Debug)]
pub enum Step<'a> {
    /// Input consumed, no complete packet yet.
    Advanced,
    /// A checked packet with a known id. The payload borrows the receive buffer.
    Packet { kind: MessageId, payload: &'a [u8] },
    Fault(Fault),
}

pub struct Parser {
    state: ParseState,
    /// Preamble bytes matched so far.
    matched: usize,
    rx: FrameBuffer,
}

impl Parser {
    /// Parser whose receive buffer accepts payloads up to `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: ParseState::WaitPreamble,
            matched: 0,
            rx: FrameBuffer::for_payload(max_payload),
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn rx_capacity(&self) -> usize {
        self.rx.capacity()
    }

    pub fn step<R: Read>(&mut self, reader: &mut R) -> Step<'_> {
        match self.state {
            ParseState::WaitPreamble => self.wait_preamble(reader),
            ParseState::WaitBody => self.wait_body(reader),
            ParseState::ProcessMessage => self.process_message(),
        }
    }

    fn wait_preamble<R: Read>(&mut self, reader: &mut R) -> Step<'_> {
        let mut byte = [0u8; 1];
        if let Err(e) = reader.read_exact(&mut byte) {
            return self.fail(Fault::Read(e));
        }
        if byte[0] != PREAMBLE_BYTES[self.matched] {
            // The mismatched byte may itself start a new preamble.
            self.matched = usize::from(byte[0] == PREAMBLE_BYTES[0]);
            return Step::Advanced;
        }
        self.matched += 1;
        if self.matched < PREAMBLE_BYTES.len() {
            return Step::Advanced;
        }
        self.matched = 0;
        self.rx.clear();
        if let Err(e) = self.rx.extend(&PREAMBLE_BYTES) {
            return self.fail(buffer_fault(e));
        }
        self.state = ParseState::WaitBody;
        Step::Advanced
    }

    fn wait_body<R: Read>(&mut self, reader: &mut R) -> Step<'_> {
        if let Err(e) = self.rx.fill_from(reader, MSG_ID_LEN + LEN_FIELD_LEN) {
            return self.fail(buffer_fault(e));
        }
        let needed = wire::declared_len(self.rx.as_slice()) + CRC_LEN;
        let available = self.rx.remaining();
        if needed > available {
            return self.fail(Fault::NoMemory { needed, available });
        }
        if let Err(e) = self.rx.fill_from(reader, needed) {
            return self.fail(buffer_fault(e));
        }
        let (body, crc) = self.rx.as_slice().split_at(self.rx.len() - CRC_LEN);
        let given = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        let computed = integrity::checksum(body);
        if given != computed {
            return self.fail(Fault::BadCrc { given, computed });
        }
        self.state = ParseState::ProcessMessage;
        Step::Advanced
    }

    fn process_message(&mut self) -> Step<'_> {
        let id = self.rx.as_slice()[PREAMBLE_LEN];
        let Some(kind) = MessageId::from_byte(id) else {
            return self.fail(Fault::UnknownId(id));
        };
        self.state = ParseState::WaitPreamble;
        let end = self.rx.len() - CRC_LEN;
        Step::Packet {
            kind,
            payload: &self.rx.as_slice()[HEADER_LEN..end],
        }
    }

    fn fail(&mut self, fault: Fault) -> Step<'_> {
        self.state = ParseState::WaitPreamble;
        self.matched = 0;
        Step::Fault(fault)
    }
}

fn buffer_fault(e: FrameEncodeError) -> Fault {
    match e {
        FrameEncodeError::Fill(e) => Fault::Read(e),
        FrameEncodeError::TooLarge { needed, capacity } => Fault::NoMemory {
            needed,
            available: capacity,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, PACKET_OVERHEAD};
    use crate::wire::encode_packet;
    use rand::{Rng, SeedableRng};

    fn frame(msg: &Message<'_>) -> Vec<u8> {
        let mut buf = FrameBuffer::for_payload(512);
        encode_packet(&mut buf, msg).unwrap().to_vec()
    }

    /// Step until something other than `Advanced` happens.
    fn next_event(parser: &mut Parser, input: &mut &[u8]) -> String {
        loop {
            match parser.step(input) {
                Step::Advanced => continue,
                Step::Packet { kind, payload } => return format!("{:?}:{}", kind, payload.len()),
                Step::Fault(f) => return format!("fault:{}", fault_name(&f)),
            }
        }
    }

    fn fault_name(f: &Fault) -> &'static str {
        match f {
            Fault::Read(_) => "read",
            Fault::NoMemory { .. } => "nomem",
            Fault::BadCrc { .. } => "crc",
            Fault::UnknownId(_) => "id",
        }
    }

    #[test]
    fn clean_packet_takes_six_steps() {
        let bytes = frame(&Message::HandshakeReq { window: 256 });
        let mut input: &[u8] = &bytes;
        let mut parser = Parser::new(256);
        for _ in 0..3 {
            assert!(matches!(parser.step(&mut input), Step::Advanced));
            assert_eq!(parser.state(), ParseState::WaitPreamble);
        }
        assert!(matches!(parser.step(&mut input), Step::Advanced));
        assert_eq!(parser.state(), ParseState::WaitBody);
        assert!(matches!(parser.step(&mut input), Step::Advanced));
        assert_eq!(parser.state(), ParseState::ProcessMessage);
        match parser.step(&mut input) {
            Step::Packet { kind, payload } => {
                assert_eq!(kind, MessageId::HandshakeReq);
                assert_eq!(payload, &256u16.to_le_bytes());
            }
            other => panic!("expected packet, got {:?}", other),
        }
        assert_eq!(parser.state(), ParseState::WaitPreamble);
        assert!(input.is_empty());
    }

    #[test]
    fn resync_after_garbage() {
        let mut bytes = vec![0x00, 0xEF, 0xBE, 0x13, 0xDE, 0xAD];
        bytes.extend(frame(&Message::Ack));
        let mut input: &[u8] = &bytes;
        let mut parser = Parser::new(64);
        assert_eq!(next_event(&mut parser, &mut input), "Ack:0");
    }

    #[test]
    fn resync_retests_mismatched_byte() {
        // A stray 0xEF right before the real preamble must not hide it.
        let mut bytes = vec![0xEF];
        bytes.extend(frame(&Message::FilesListReq));
        let mut input: &[u8] = &bytes;
        let mut parser = Parser::new(64);
        assert_eq!(next_event(&mut parser, &mut input), "FilesListReq:0");

        let mut bytes = vec![0xEF, 0xBE];
        bytes.extend(frame(&Message::Ack));
        let mut input: &[u8] = &bytes;
        assert_eq!(next_event(&mut parser, &mut input), "Ack:0");
    }

    #[test]
    fn corrupted_crc_is_reported_and_parser_recovers() {
        let mut bad = frame(&Message::FileHashReq { name: "x.txt" });
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        bad.extend(frame(&Message::Ack));
        let mut input: &[u8] = &bad;
        let mut parser = Parser::new(64);
        assert_eq!(next_event(&mut parser, &mut input), "fault:crc");
        assert_eq!(parser.state(), ParseState::WaitPreamble);
        assert_eq!(next_event(&mut parser, &mut input), "Ack:0");
    }

    #[test]
    fn oversized_length_is_no_memory() {
        let data = [0u8; 300];
        let big = frame(&Message::FileData {
            segment: 0,
            data: &data,
        });
        let mut input: &[u8] = &big;
        let mut parser = Parser::new(256);
        assert_eq!(next_event(&mut parser, &mut input), "fault:nomem");
        assert_eq!(parser.state(), ParseState::WaitPreamble);
        assert!(parser.rx.len() <= parser.rx_capacity());
        // The rest of the oversized packet is skipped as noise.
        let mut tail = input.to_vec();
        tail.extend(frame(&Message::Ack));
        let mut input: &[u8] = &tail;
        assert_eq!(next_event(&mut parser, &mut input), "Ack:0");
    }

    #[test]
    fn payload_at_capacity_fits() {
        let data = [0xA5u8; 254];
        let bytes = frame(&Message::FileData {
            segment: 1,
            data: &data,
        });
        assert_eq!(bytes.len(), PACKET_OVERHEAD + 256);
        let mut input: &[u8] = &bytes;
        let mut parser = Parser::new(256);
        assert_eq!(next_event(&mut parser, &mut input), "FileData:256");
    }

    #[test]
    fn unknown_ids_reset_to_wait_preamble() {
        for id in [0u8, 12, 200] {
            let mut bytes = frame(&Message::Ack);
            bytes[4] = id;
            let crc_at = bytes.len() - CRC_LEN;
            let crc = integrity::checksum(&bytes[..crc_at]);
            bytes[crc_at..].copy_from_slice(&crc.to_le_bytes());
            let mut input: &[u8] = &bytes;
            let mut parser = Parser::new(64);
            assert_eq!(next_event(&mut parser, &mut input), "fault:id");
            assert_eq!(parser.state(), ParseState::WaitPreamble);
        }
    }

    #[test]
    fn short_read_is_read_fault() {
        let bytes = frame(&Message::HandshakeRes { window: 64 });
        let mut input: &[u8] = &bytes[..bytes.len() - 2];
        let mut parser = Parser::new(64);
        assert_eq!(next_event(&mut parser, &mut input), "fault:read");
        assert_eq!(parser.state(), ParseState::WaitPreamble);

        let mut empty: &[u8] = &[];
        assert_eq!(next_event(&mut parser, &mut empty), "fault:read");
    }

    #[test]
    fn random_noise_never_panics() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);
        let mut parser = Parser::new(128);
        for _ in 0..200 {
            let len = rng.gen_range(0..400);
            let mut noise: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            // Sprinkle preambles so the body path is exercised too.
            if len > 8 && rng.gen_bool(0.5) {
                let at = rng.gen_range(0..len - 4);
                noise[at..at + 4].copy_from_slice(&PREAMBLE_BYTES);
            }
            noise.extend(frame(&Message::Ack));
            let mut input: &[u8] = &noise;
            loop {
                match parser.step(&mut input) {
                    Step::Advanced | Step::Packet { .. } => {}
                    Step::Fault(Fault::Read(_)) => break,
                    Step::Fault(_) => {}
                }
                assert!(parser.rx.len() <= parser.rx_capacity());
            }
            assert_eq!(parser.state(), ParseState::WaitPreamble);
        }
    }
}
