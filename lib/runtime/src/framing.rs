//! Length-prefixed message framing: a 4-byte little-endian length prefix followed by that many
//! payload bytes. The decoder reassembles frames across an arbitrary split of the underlying
//! byte stream into reads — the wire shape here is the plain `len ‖ body` form the broker's
//! clients speak, not a category-tagged packet header.

use byteorder::{ByteOrder, LittleEndian};

const LENGTH_PREFIX_SIZE: usize = 4;

/// Encodes `payload` as a length-prefixed frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    LittleEndian::write_u32(&mut prefix, payload.len() as u32);
    out.extend_from_slice(&prefix);
    out.extend_from_slice(payload);
    out
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum DecodeState {
    AwaitingLength,
    AwaitingBody { len: usize },
}

/// Streaming frame decoder. Bytes arrive incrementally via [`Decoder::push`]; complete frames are
/// drained with [`Decoder::next_frame`]. Safe to feed byte-at-a-time or in arbitrarily large
/// chunks, including multiple frames landing in a single push.
pub struct Decoder {
    state: DecodeState,
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl Decoder {
    pub fn new(max_frame_size: usize) -> Decoder {
        Decoder {
            state: DecodeState::AwaitingLength,
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    /// Appends newly received bytes to the decoder's internal accumulator.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pops the next complete frame out of the accumulator, if one is available. Calling this in
    /// a loop until it returns `Ok(None)` drains every frame currently buffered, including
    /// back-to-back frames delivered in one `push`.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        loop {
            match self.state {
                DecodeState::AwaitingLength => {
                    if self.buffer.len() < LENGTH_PREFIX_SIZE {
                        return Ok(None);
                    }

                    let len = LittleEndian::read_u32(&self.buffer[..LENGTH_PREFIX_SIZE]) as usize;

                    if len > self.max_frame_size {
                        return Err(FramingError::FrameTooLarge(len));
                    }

                    self.buffer.drain(..LENGTH_PREFIX_SIZE);
                    self.state = DecodeState::AwaitingBody { len };
                }
                DecodeState::AwaitingBody { len } => {
                    if self.buffer.len() < len {
                        return Ok(None);
                    }

                    let frame: Vec<u8> = self.buffer.drain(..len).collect();
                    self.state = DecodeState::AwaitingLength;
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Resets the decoder to its initial state, discarding any partially accumulated frame.
    pub fn reset(&mut self) {
        self.state = DecodeState::AwaitingLength;
        self.buffer.clear();
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum FramingError {
    FrameTooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_single_frame() {
        let payload = b"HelloLengthPrefix".to_vec();
        let wire = encode(&payload);

        let mut decoder = Decoder::new(1 << 20);
        decoder.push(&wire);

        assert_eq!(decoder.next_frame().unwrap(), Some(payload));
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn fragmented_header_and_body() {
        let payload = b"HelloLengthPrefix".to_vec();
        let wire = encode(&payload);

        let mut decoder = Decoder::new(1 << 20);

        // Header split across two pushes.
        decoder.push(&wire[..2]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(&wire[2..4]);
        assert_eq!(decoder.next_frame().unwrap(), None);

        // Body split in half.
        let body = &wire[4..];
        let mid = body.len() / 2;
        decoder.push(&body[..mid]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(&body[mid..]);

        assert_eq!(decoder.next_frame().unwrap(), Some(payload));
    }

    #[test]
    fn back_to_back_frames_in_one_push() {
        let a = b"first".to_vec();
        let b = b"second message".to_vec();

        let mut wire = encode(&a);
        wire.extend(encode(&b));

        let mut decoder = Decoder::new(1 << 20);
        decoder.push(&wire);

        assert_eq!(decoder.next_frame().unwrap(), Some(a));
        assert_eq!(decoder.next_frame().unwrap(), Some(b));
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut decoder = Decoder::new(16);
        decoder.push(&encode(&vec![0u8; 17]));

        assert_eq!(decoder.next_frame(), Err(FramingError::FrameTooLarge(17)));
    }

    #[test]
    fn byte_at_a_time_feed() {
        let payload = b"chunked".to_vec();
        let wire = encode(&payload);

        let mut decoder = Decoder::new(1 << 20);
        for b in &wire {
            decoder.push(std::slice::from_ref(b));
        }

        assert_eq!(decoder.next_frame().unwrap(), Some(payload));
    }
}
