//! Stream framing for the TCP API
//!
//! Wire format:
//! - Bytes 0-1: Magic (`0x94 0xC3`)
//! - Bytes 2-3: Length (big-endian u16)
//! - Bytes 4+: Payload, exactly `length` bytes
//!
//! There is no checksum. The decoder finds frame boundaries by scanning for
//! the magic pair one byte at a time.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::config::{FRAME_HEADER_LEN, FRAME_MAGIC, MAX_FRAME_PAYLOAD};
use crate::error::{LinkError, Result};

const INITIAL_CAPACITY: usize = 1024;

/// Frame a payload with the magic/length header
///
/// Payloads longer than the 16-bit length field are rejected before any
/// bytes are produced.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(LinkError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_slice(&FRAME_MAGIC);
    frame.put_u16(payload.len() as u16);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Looking for the first magic byte
    SeekMagic,
    /// First magic byte seen, the next byte decides
    SeekSecondMagic,
    /// Magic matched, waiting for the length field
    Length,
    /// Waiting for this many payload bytes
    Payload(usize),
}

/// Incremental frame decoder
///
/// Bytes may arrive in arbitrary pieces; a partial header or payload simply
/// waits for more input.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: DecodeState,
    discarded: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            state: DecodeState::SeekMagic,
            discarded: 0,
        }
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Read buffer, for filling directly from a socket
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        if self.buffer.capacity() - self.buffer.len() < INITIAL_CAPACITY {
            self.buffer.reserve(INITIAL_CAPACITY);
        }
        &mut self.buffer
    }

    /// Bytes dropped while hunting for a frame start
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Whether a frame is partially buffered
    pub fn is_mid_frame(&self) -> bool {
        !matches!(self.state, DecodeState::SeekMagic) || !self.buffer.is_empty()
    }

    /// Pop the next complete payload, if one is buffered
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            match self.state {
                DecodeState::SeekMagic => {
                    match self.buffer.iter().position(|&b| b == FRAME_MAGIC[0]) {
                        Some(pos) => {
                            self.skip(pos);
                            self.buffer.advance(1);
                            self.state = DecodeState::SeekSecondMagic;
                        }
                        None => {
                            let len = self.buffer.len();
                            self.skip(len);
                            return None;
                        }
                    }
                }
                DecodeState::SeekSecondMagic => {
                    let byte = *self.buffer.first()?;
                    self.buffer.advance(1);
                    if byte == FRAME_MAGIC[1] {
                        self.state = DecodeState::Length;
                    } else if byte == FRAME_MAGIC[0] {
                        // The mismatching byte may itself start a frame
                        self.discarded += 1;
                    } else {
                        self.discarded += 2;
                        self.state = DecodeState::SeekMagic;
                    }
                }
                DecodeState::Length => {
                    if self.buffer.len() < 2 {
                        return None;
                    }
                    let length = self.buffer.get_u16() as usize;
                    self.state = DecodeState::Payload(length);
                }
                DecodeState::Payload(length) => {
                    if self.buffer.len() < length {
                        trace!(
                            have = self.buffer.len(),
                            need = length,
                            "Waiting for complete frame"
                        );
                        return None;
                    }
                    let payload = self.buffer.split_to(length).freeze();
                    self.state = DecodeState::SeekMagic;
                    return Some(payload);
                }
            }
        }
    }

    fn skip(&mut self, count: usize) {
        if count > 0 {
            warn!(discarded = count, "Discarding bytes before magic");
            self.buffer.advance(count);
            self.discarded += count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<Bytes> {
        std::iter::from_fn(|| decoder.next_frame()).collect()
    }

    #[test]
    fn test_encode_frame() {
        let framed = encode_frame(b"hello").unwrap();

        assert_eq!(&framed[..2], &[0x94, 0xC3]);
        assert_eq!(u16::from_be_bytes([framed[2], framed[3]]), 5);
        assert_eq!(&framed[4..], b"hello");
    }

    #[test]
    fn test_encode_rejects_oversize_payload() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        let err = encode_frame(&payload).unwrap_err();
        assert!(matches!(
            err,
            LinkError::PayloadTooLarge {
                size: 65536,
                max: 65535
            }
        ));
    }

    #[test]
    fn test_max_payload_roundtrip() {
        let payload: Vec<u8> = (0..MAX_FRAME_PAYLOAD).map(|i| (i % 251) as u8).collect();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_frame(&payload).unwrap());
        assert_eq!(decoder.next_frame().unwrap().as_ref(), payload.as_slice());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x94, 0xC3, 0x00, 0x05, b'a']);
        assert!(decoder.next_frame().is_none());
        assert!(decoder.is_mid_frame());

        decoder.extend(b"bcde");
        assert_eq!(decoder.next_frame().unwrap().as_ref(), b"abcde");
        assert!(!decoder.is_mid_frame());
    }

    #[test]
    fn test_lone_first_magic_is_not_a_frame_start() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x94, 0x00, 0x94, 0xC3, 0x00, 0x03, 1, 2, 3]);

        let frames = decode_all(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), &[1, 2, 3]);
        assert_eq!(decoder.discarded(), 2);
    }

    #[test]
    fn test_repeated_first_magic_resyncs() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x94, 0x94, 0xC3, 0x00, 0x01, 9]);
        assert_eq!(decoder.next_frame().unwrap().as_ref(), &[9]);
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_frame(&[]).unwrap());
        assert_eq!(decoder.next_frame().unwrap().len(), 0);
    }

    #[test]
    fn test_frames_amid_garbage_byte_at_a_time() {
        // Deterministic LCG so failures are reproducible
        let mut seed: u32 = 0x1234_5678;
        let mut next = move || {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (seed >> 16) as u8
        };

        let mut stream = Vec::new();
        let mut expected = Vec::new();
        for i in 0..40usize {
            let garbage_len = next() as usize % 9;
            for _ in 0..garbage_len {
                // Garbage never contains a 0x94 directly before 0xC3
                let mut byte = next();
                if byte == 0xC3 && stream.last() == Some(&0x94) {
                    byte = 0x00;
                }
                stream.push(byte);
            }
            let payload: Vec<u8> = (0..(i * 7 % 50)).map(|_| next()).collect();
            stream.extend_from_slice(&encode_frame(&payload).unwrap());
            expected.push(payload);
        }

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in stream {
            decoder.extend(&[byte]);
            frames.extend(decode_all(&mut decoder));
        }

        assert_eq!(frames.len(), expected.len());
        for (frame, payload) in frames.iter().zip(&expected) {
            assert_eq!(frame.as_ref(), payload.as_slice());
        }
    }
}
