//! Splits the raw serial byte stream into text lines and binary frames.
//!
//! The CS1237 firmware interleaves its menu text with two frame dialects, both
//! starting with `AA 55` and ending with `0D 0A`:
//!
//! ```text
//! variable: AA 55 | LEN | CMD | DATA (LEN-1) | XOR(LEN..DATA) | 0D 0A   (6 + LEN bytes)
//! voltage:  AA 55 | VOLTAGE (f32 LE) | PGA (u16 LE)             | 0D 0A   (10 bytes)
//! ```
//!
//! Anything that is not a validated frame is text. A head that fails validation
//! gives up exactly one byte to the text accumulator and decoding resumes at the
//! next byte, so the decoder always re-locks onto the frame stream after noise.
//!
//! Decoding only ever waits while the buffered bytes are still a valid prefix of
//! some frame, which makes the emitted events independent of how the transport
//! fragmented the stream.

use std::time::Instant;

use log::debug;

use crate::buffer::ByteRingBuffer;
use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Frame start marker
pub const FRAME_HEAD: [u8; 2] = [0xAA, 0x55];
/// Frame end marker
pub const FRAME_TAIL: [u8; 2] = [0x0D, 0x0A];

/// Total length of a voltage frame
pub const VOLTAGE_FRAME_LEN: usize = 10;
/// Pseudo command id assigned to voltage frames
pub const VOLTAGE_FRAME_CMD: u8 = 0xFF;

/// Largest LEN field accepted for a variable frame
pub const MAX_PAYLOAD_LEN: usize = 64;
/// Largest frame of either dialect
pub const MAX_FRAME_LEN: usize = 6 + MAX_PAYLOAD_LEN;

/// Text without a terminator is force-emitted at this length
pub const MAX_TEXT_LINE: usize = 512;

/// PGA factors a voltage frame may carry
pub const VALID_PGA: [u16; 4] = [1, 2, 64, 128];

// ============================================================================
// Data Types
// ============================================================================

/// Which frame layout produced a [`BinaryFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Variable,
    Voltage,
}

/// A validated binary frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryFrame {
    /// Command id (`0xFF` for voltage frames)
    pub cmd: u8,
    /// Frame data without LEN/CMD/checksum. Voltage frames carry the 4 voltage
    /// bytes followed by the 2 PGA bytes.
    pub payload: Vec<u8>,
    /// When the read that completed the frame's decoding arrived
    pub arrival: Instant,
    pub dialect: Dialect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    TextLine(String),
    BinaryFrame(BinaryFrame),
}

/// Running totals kept by the decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames: u64,
    pub text_lines: u64,
    /// Head bytes given up after a failed frame validation
    pub resync_discards: u64,
}

/// How far the decoder may go with bytes that could still grow into a longer frame.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Resolve {
    /// More bytes are on the way
    Streaming,
    /// The transport went quiet: settle frames that only wait on the longer reading
    Idle,
    /// No more bytes will arrive
    End,
}

enum Attempt {
    Frame(BinaryFrame, usize),
    NeedMore,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Candidate {
    Valid,
    Possible,
    Impossible,
}

// ============================================================================
// Decoder
// ============================================================================

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: ByteRingBuffer,
    text: Vec<u8>,
    stats: DecoderStats,
    last_arrival: Option<Instant>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: ByteRingBuffer::with_capacity(MAX_FRAME_LEN * 4),
            text: Vec::with_capacity(128),
            stats: DecoderStats::default(),
            last_arrival: None,
        }
    }

    /// Feed freshly read bytes, stamping frames with the current instant.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<DecodedEvent> {
        self.feed_at(bytes, Instant::now())
    }

    /// Feed bytes that arrived at `arrival`.
    pub fn feed_at(&mut self, bytes: &[u8], arrival: Instant) -> Vec<DecodedEvent> {
        self.buffer.extend(bytes);
        self.last_arrival = Some(arrival);
        self.drain(arrival, Resolve::Streaming)
    }

    /// The transport has gone quiet: emit a complete voltage frame that was only
    /// held back because its bytes could still start a longer variable frame.
    ///
    /// Frames settled here carry the arrival of the last read.
    pub fn settle(&mut self) -> Vec<DecodedEvent> {
        let arrival = self.last_arrival.unwrap_or_else(Instant::now);
        self.drain(arrival, Resolve::Idle)
    }

    /// End of stream: resolve whatever is still buffered and emit trailing text.
    pub fn finish(&mut self) -> Vec<DecodedEvent> {
        let mut events = self.drain(Instant::now(), Resolve::End);
        let rest = std::mem::take(&mut self.text);
        self.emit_line(&rest, &mut events);
        events
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Bytes held back waiting for a frame to complete.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn drain(&mut self, arrival: Instant, mode: Resolve) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        let mut discarded = 0u64;

        loop {
            let data = self.buffer.as_slice();
            if data.is_empty() {
                break;
            }

            if data[0] != FRAME_HEAD[0] {
                let run = data
                    .iter()
                    .position(|&b| b == FRAME_HEAD[0])
                    .unwrap_or(data.len());
                let chunk = data[..run].to_vec();
                self.buffer.consume(run);
                self.push_text(&chunk, &mut events);
                continue;
            }

            match try_frame(data, arrival, mode) {
                Attempt::Frame(frame, len) => {
                    self.buffer.consume(len);
                    self.stats.frames += 1;
                    events.push(DecodedEvent::BinaryFrame(frame));
                }
                Attempt::NeedMore => break,
                Attempt::Invalid => {
                    self.buffer.consume(1);
                    discarded += 1;
                    self.push_text(&[FRAME_HEAD[0]], &mut events);
                }
            }
        }

        if discarded > 0 {
            self.stats.resync_discards += discarded;
            debug!(
                "Resynchronized frame stream: {} head byte(s) discarded (total {})",
                discarded, self.stats.resync_discards
            );
        }
        events
    }

    fn push_text(&mut self, bytes: &[u8], events: &mut Vec<DecodedEvent>) {
        for &byte in bytes {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.text);
                self.emit_line(&line, events);
                continue;
            }
            self.text.push(byte);
            if self.text.len() >= MAX_TEXT_LINE {
                let line = std::mem::take(&mut self.text);
                self.emit_line(&line, events);
            }
        }
    }

    fn emit_line(&mut self, raw: &[u8], events: &mut Vec<DecodedEvent>) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if !line.is_empty() {
            self.stats.text_lines += 1;
            events.push(DecodedEvent::TextLine(line.to_string()));
        }
    }
}

/// Attempt to decode a frame at the start of `data` (which begins with `0xAA`).
///
/// When the same bytes validate under both dialects the variable frame wins,
/// since its checksum is the stronger check.
fn try_frame(data: &[u8], arrival: Instant, mode: Resolve) -> Attempt {
    if data.len() < 2 {
        return if mode == Resolve::End {
            Attempt::Invalid
        } else {
            Attempt::NeedMore
        };
    }
    if data[1] != FRAME_HEAD[1] {
        return Attempt::Invalid;
    }

    match (voltage_candidate(data), variable_candidate(data)) {
        (_, Candidate::Valid) => variable_frame(data, arrival),
        (Candidate::Valid, Candidate::Impossible) => voltage_frame(data, arrival),
        // The variable reading is still incomplete
        (Candidate::Valid, Candidate::Possible) => match mode {
            Resolve::Streaming => Attempt::NeedMore,
            Resolve::Idle | Resolve::End => voltage_frame(data, arrival),
        },
        (Candidate::Impossible, Candidate::Impossible) => Attempt::Invalid,
        _ if mode == Resolve::End => Attempt::Invalid,
        _ if data.len() >= MAX_FRAME_LEN => Attempt::Invalid,
        _ => Attempt::NeedMore,
    }
}

fn voltage_frame(data: &[u8], arrival: Instant) -> Attempt {
    Attempt::Frame(
        BinaryFrame {
            cmd: VOLTAGE_FRAME_CMD,
            payload: data[2..8].to_vec(),
            arrival,
            dialect: Dialect::Voltage,
        },
        VOLTAGE_FRAME_LEN,
    )
}

fn variable_frame(data: &[u8], arrival: Instant) -> Attempt {
    let total = 6 + data[2] as usize;
    Attempt::Frame(
        BinaryFrame {
            cmd: data[3],
            payload: data[4..total - 3].to_vec(),
            arrival,
            dialect: Dialect::Variable,
        },
        total,
    )
}

fn voltage_candidate(data: &[u8]) -> Candidate {
    if data.len() >= VOLTAGE_FRAME_LEN {
        let frame = &data[..VOLTAGE_FRAME_LEN];
        let pga = u16::from_le_bytes([frame[6], frame[7]]);
        let volts = f32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
        return if frame[8..] == FRAME_TAIL && VALID_PGA.contains(&pga) && volts.is_finite() {
            Candidate::Valid
        } else {
            Candidate::Impossible
        };
    }

    // Partial frame: every byte seen so far must still fit
    if data.len() >= 6 {
        let volts = f32::from_le_bytes([data[2], data[3], data[4], data[5]]);
        if !volts.is_finite() {
            return Candidate::Impossible;
        }
    }
    if data.len() > 6 && !VALID_PGA.iter().any(|&p| p.to_le_bytes()[0] == data[6]) {
        return Candidate::Impossible;
    }
    if data.len() > 7 && data[7] != 0 {
        return Candidate::Impossible;
    }
    if data.len() > 8 && data[8] != FRAME_TAIL[0] {
        return Candidate::Impossible;
    }
    Candidate::Possible
}

fn variable_candidate(data: &[u8]) -> Candidate {
    if data.len() < 3 {
        return Candidate::Possible;
    }
    let len = data[2] as usize;
    if len == 0 || len > MAX_PAYLOAD_LEN {
        return Candidate::Impossible;
    }
    let total = 6 + len;
    if data.len() < total {
        return Candidate::Possible;
    }

    let frame = &data[..total];
    if frame[total - 2..] != FRAME_TAIL {
        return Candidate::Impossible;
    }
    let checksum = frame[2..total - 3].iter().fold(0u8, |acc, b| acc ^ b);
    if checksum != frame[total - 3] {
        return Candidate::Impossible;
    }
    Candidate::Valid
}

// ============================================================================
// Encoding
// ============================================================================

/// Build a variable-length frame around `cmd` and `data`.
pub fn encode_variable_frame(cmd: u8, data: &[u8]) -> Result<Vec<u8>> {
    let len = data.len() + 1;
    if len > MAX_PAYLOAD_LEN {
        return Err(DriverError::Config(format!(
            "frame data of {} bytes exceeds the {} byte limit",
            data.len(),
            MAX_PAYLOAD_LEN - 1
        )));
    }

    let mut frame = Vec::with_capacity(6 + len);
    frame.extend_from_slice(&FRAME_HEAD);
    frame.push(len as u8);
    frame.push(cmd);
    frame.extend_from_slice(data);
    let checksum = frame[2..].iter().fold(0u8, |acc, b| acc ^ b);
    frame.push(checksum);
    frame.extend_from_slice(&FRAME_TAIL);
    Ok(frame)
}

/// Build a 10-byte voltage frame.
pub fn encode_voltage_frame(volts: f32, pga: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(VOLTAGE_FRAME_LEN);
    frame.extend_from_slice(&FRAME_HEAD);
    frame.extend_from_slice(&volts.to_le_bytes());
    frame.extend_from_slice(&pga.to_le_bytes());
    frame.extend_from_slice(&FRAME_TAIL);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(events: &[DecodedEvent]) -> Vec<&BinaryFrame> {
        events
            .iter()
            .filter_map(|e| match e {
                DecodedEvent::BinaryFrame(f) => Some(f),
                DecodedEvent::TextLine(_) => None,
            })
            .collect()
    }

    fn lines(events: &[DecodedEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                DecodedEvent::TextLine(l) => Some(l.as_str()),
                DecodedEvent::BinaryFrame(_) => None,
            })
            .collect()
    }

    fn mixed_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"CS1237 ready\r\n");
        stream.extend(encode_variable_frame(0x01, &[0x00, 0x01, 0x86, 0xA0]).unwrap());
        stream.extend_from_slice("配置模式\r\n".as_bytes());
        stream.extend(encode_voltage_frame(1.25, 128));
        // truncated frame, then garbage
        stream.extend_from_slice(&[0xAA, 0x55, 0x05, 0x01, 0x00]);
        stream.extend_from_slice(&[0xAA, 0x13, 0x37]);
        stream.extend(encode_variable_frame(0x04, &[3, 0, 0, 0, 0, 0, 42]).unwrap());
        stream.extend_from_slice(b"\n");
        stream.extend(encode_voltage_frame(-0.5, 1));
        stream.extend_from_slice(b"tail text\n");
        stream
    }

    #[test]
    fn variable_frame_round_trip() {
        let mut decoder = FrameDecoder::new();
        let wire = encode_variable_frame(0x01, &[0x00, 0x00, 0x10, 0x00]).unwrap();
        assert_eq!(wire.len(), 6 + 5);

        let events = decoder.feed(&wire);
        let got = frames(&events);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].cmd, 0x01);
        assert_eq!(got[0].payload, vec![0x00, 0x00, 0x10, 0x00]);
        assert_eq!(got[0].dialect, Dialect::Variable);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn voltage_frame_round_trip() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(&encode_voltage_frame(2.5, 64));
        let got = frames(&events);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].cmd, VOLTAGE_FRAME_CMD);
        assert_eq!(got[0].dialect, Dialect::Voltage);
        let volts = f32::from_le_bytes([
            got[0].payload[0],
            got[0].payload[1],
            got[0].payload[2],
            got[0].payload[3],
        ]);
        assert_eq!(volts, 2.5);
        assert_eq!(u16::from_le_bytes([got[0].payload[4], got[0].payload[5]]), 64);
    }

    #[test]
    fn bad_checksum_is_resynchronized() {
        let mut decoder = FrameDecoder::new();
        let mut wire = encode_variable_frame(0x01, &[1, 2, 3, 4]).unwrap();
        let ck = wire.len() - 3;
        wire[ck] ^= 0xFF;
        wire.extend(encode_variable_frame(0x01, &[5, 6, 7, 8]).unwrap());

        let events = decoder.feed(&wire);
        let got = frames(&events);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, vec![5, 6, 7, 8]);
        assert!(decoder.stats().resync_discards >= 1);
    }

    #[test]
    fn head_noise_terminates_and_stays_bounded() {
        let mut decoder = FrameDecoder::new();
        let noise: Vec<u8> = FRAME_HEAD.iter().copied().cycle().take(400).collect();
        let events = decoder.feed(&noise);
        assert!(frames(&events).is_empty());
        assert!(decoder.buffered() <= MAX_FRAME_LEN);

        let events = decoder.feed(&encode_voltage_frame(0.75, 2));
        assert_eq!(frames(&events).len(), 1);
    }

    #[test]
    fn lone_head_byte_waits_for_more() {
        let mut decoder = FrameDecoder::new();
        let wire = encode_variable_frame(0x04, &[1, 2, 0, 0, 0, 0, 9]).unwrap();
        assert!(decoder.feed(&wire[..1]).is_empty());
        assert_eq!(decoder.buffered(), 1);
        let events = decoder.feed(&wire[1..]);
        assert_eq!(frames(&events).len(), 1);
    }

    #[test]
    fn bytes_valid_in_both_dialects_decode_as_variable_frame() {
        // Status frame whose counter bytes 00 0D 0A also form a voltage frame with PGA 2
        let wire = encode_variable_frame(0x04, &[0, 0, 2, 0x00, 0x0D, 0x0A, 0x05]).unwrap();
        assert_eq!(&wire[8..10], &FRAME_TAIL);

        for chunk_size in [1usize, 4, 10, wire.len()] {
            let mut decoder = FrameDecoder::new();
            let mut events = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                events.extend(decoder.feed(chunk));
            }
            let got = frames(&events);
            assert_eq!(got.len(), 1, "chunk size {chunk_size}");
            assert_eq!(got[0].dialect, Dialect::Variable);
            assert_eq!(got[0].cmd, 0x04);
            assert_eq!(got[0].payload, vec![0, 0, 2, 0x00, 0x0D, 0x0A, 0x05]);
            assert!(lines(&events).is_empty());
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn settle_releases_voltage_frame_held_for_longer_reading() {
        let wire = encode_voltage_frame(0.101, 1);
        // first voltage byte doubles as a plausible LEN field
        assert!((1..=MAX_PAYLOAD_LEN).contains(&(wire[2] as usize)));

        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&wire).is_empty());
        assert_eq!(decoder.buffered(), VOLTAGE_FRAME_LEN);

        let events = decoder.settle();
        let got = frames(&events);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].dialect, Dialect::Voltage);
        assert_eq!(decoder.buffered(), 0);
        assert!(decoder.settle().is_empty());
    }

    #[test]
    fn settle_keeps_an_incomplete_frame() {
        let wire = encode_variable_frame(0x01, &[0, 0, 0x10, 0]).unwrap();
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&wire[..6]).is_empty());
        assert!(decoder.settle().is_empty());
        assert_eq!(frames(&decoder.feed(&wire[6..])).len(), 1);
    }

    #[test]
    fn event_stream_is_independent_of_fragmentation() {
        let stream = mixed_stream();
        let at = Instant::now();

        let mut whole = FrameDecoder::new();
        let mut expected = whole.feed_at(&stream, at);
        expected.extend(whole.finish());

        for chunk_size in [1usize, 2, 3, 7, 11, 64] {
            let mut decoder = FrameDecoder::new();
            let mut events = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                events.extend(decoder.feed_at(chunk, at));
            }
            events.extend(decoder.finish());
            assert_eq!(events, expected, "chunk size {chunk_size}");
        }

        assert_eq!(frames(&expected).len(), 4);
        assert_eq!(lines(&expected)[0], "CS1237 ready");
        assert_eq!(lines(&expected)[1], "配置模式");
        assert_eq!(*lines(&expected).last().unwrap(), "tail text");
    }

    #[test]
    fn text_lines_are_trimmed_and_blank_lines_skipped() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(b"\r\n\r\n  hello  \r\n\n");
        assert_eq!(lines(&events), vec!["hello"]);
        assert_eq!(decoder.stats().text_lines, 1);
    }

    #[test]
    fn overlong_text_is_force_emitted() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(&[b'x'; 600]);
        let got = lines(&events);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].len(), MAX_TEXT_LINE);

        let rest = decoder.finish();
        assert_eq!(lines(&rest), vec!["x".repeat(600 - MAX_TEXT_LINE).as_str()]);
    }

    #[test]
    fn finish_flushes_partial_text_and_frames() {
        let mut decoder = FrameDecoder::new();
        let wire = encode_variable_frame(0x03, &[1]).unwrap();
        let mut bytes = b"partial".to_vec();
        bytes.extend(&wire[..4]);
        assert!(decoder.feed(&bytes).is_empty());

        let events = decoder.finish();
        assert!(frames(&events).is_empty());
        assert_eq!(lines(&events).len(), 1);
        assert!(lines(&events)[0].starts_with("partial"));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert!(encode_variable_frame(0x01, &[0u8; MAX_PAYLOAD_LEN]).is_err());
        assert!(encode_variable_frame(0x01, &[0u8; MAX_PAYLOAD_LEN - 1]).is_ok());
    }
}
