//! STK500v2 message framing
//!
//! ```text
//! +-------+-----+--------+--------+-------+-----------+----------+
//! | START | SEQ | LEN_HI | LEN_LO | TOKEN |  PAYLOAD  | CHECKSUM |
//! +-------+-----+--------+--------+-------+-----------+----------+
//! | 0x1B  |  1  |   1    |   1    | 0x0E  |    LEN    |    1     |
//! +-------+-----+--------+--------+-------+-----------+----------+
//! ```
//!
//! The checksum is the XOR of every preceding byte, START included.

use crate::protocol::{MAX_PAYLOAD, MESSAGE_START, TOKEN};

/// A complete, checksum-validated message
#[derive(Clone, PartialEq, Debug)]
pub struct Frame {
    pub sequence: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(sequence: u8, payload: Vec<u8>) -> Self {
        Self { sequence, payload }
    }

    /// XOR checksum over the header and payload
    pub fn checksum(&self) -> u8 {
        let len = self.payload.len() as u16;
        let header = [MESSAGE_START, self.sequence, (len >> 8) as u8, len as u8, TOKEN];

        header
            .iter()
            .chain(self.payload.iter())
            .fold(0, |acc, b| acc ^ b)
    }

    /// Encode the frame for transmission
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len() as u16;

        let mut buf = Vec::with_capacity(self.payload.len() + 6);
        buf.push(MESSAGE_START);
        buf.push(self.sequence);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(TOKEN);
        buf.extend_from_slice(&self.payload);
        buf.push(self.checksum());

        buf
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    AwaitStart,
    AwaitSequence,
    AwaitLengthHigh,
    AwaitLengthLow,
    AwaitToken,
    AwaitPayload,
    AwaitChecksum,
}

/// Byte-at-a-time frame decoder
///
/// Malformed frames (bad token, bad checksum, unsupported length) are dropped
/// and the decoder resynchronises on the next start marker.
pub struct Decoder {
    state: State,
    checksum: u8,
    sequence: u8,
    length: usize,
    payload: Vec<u8>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: State::AwaitStart,
            checksum: 0,
            sequence: 0,
            length: 0,
            payload: Vec::with_capacity(MAX_PAYLOAD),
        }
    }

    /// Fetch the decoder state
    pub fn state(&self) -> State {
        self.state
    }

    /// Drop any partially received frame
    pub fn reset(&mut self) {
        self.state = State::AwaitStart;
        self.checksum = 0;
        self.length = 0;
        self.payload.clear();
    }

    /// Feed one received byte, returning a frame once one is complete
    pub fn feed(&mut self, b: u8) -> Option<Frame> {
        match self.state {
            State::AwaitStart => {
                if b == MESSAGE_START {
                    self.checksum = MESSAGE_START;
                    self.state = State::AwaitSequence;
                }
            }
            State::AwaitSequence => {
                // Whatever the host sends is echoed back, never validated
                self.sequence = b;
                self.checksum ^= b;
                self.state = State::AwaitLengthHigh;
            }
            State::AwaitLengthHigh => {
                self.length = (b as usize) << 8;
                self.checksum ^= b;
                self.state = State::AwaitLengthLow;
            }
            State::AwaitLengthLow => {
                self.length |= b as usize;
                self.checksum ^= b;

                if self.length == 0 || self.length > MAX_PAYLOAD {
                    warn!("Dropping frame with unsupported length {}", self.length);
                    self.reset();
                } else {
                    self.state = State::AwaitToken;
                }
            }
            State::AwaitToken => {
                if b == TOKEN {
                    self.checksum ^= b;
                    self.payload.clear();
                    self.state = State::AwaitPayload;
                } else {
                    debug!("Unexpected token 0x{:02x}, resynchronising", b);
                    self.reset();
                }
            }
            State::AwaitPayload => {
                self.payload.push(b);
                self.checksum ^= b;

                if self.payload.len() == self.length {
                    self.state = State::AwaitChecksum;
                }
            }
            State::AwaitChecksum => {
                if b == self.checksum {
                    let payload = core::mem::replace(&mut self.payload, Vec::with_capacity(MAX_PAYLOAD));
                    let frame = Frame::new(self.sequence, payload);
                    self.reset();
                    return Some(frame);
                }

                debug!(
                    "Checksum mismatch (expected 0x{:02x}, received 0x{:02x})",
                    self.checksum, b
                );
                self.reset();
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(d: &mut Decoder, bytes: &[u8]) -> Vec<Frame> {
        bytes.iter().filter_map(|b| d.feed(*b)).collect()
    }

    #[test]
    fn encode_sign_on_request() {
        let f = Frame::new(1, vec![0x01]);
        assert_eq!(f.encode(), vec![0x1B, 0x01, 0x00, 0x01, 0x0E, 0x01, 0x14]);
    }

    #[test]
    fn decode_valid_frame() {
        let f = Frame::new(0x42, vec![0x03, 0x90]);
        let mut d = Decoder::new();

        let frames = decode_all(&mut d, &f.encode());
        assert_eq!(frames, vec![f]);
        assert_eq!(d.state(), State::AwaitStart);
    }

    #[test]
    fn leading_noise_is_skipped() {
        let f = Frame::new(7, vec![0x01]);
        let mut bytes = vec![0x00, 0xFF, 0x0E, 0x55];
        bytes.extend(f.encode());

        let mut d = Decoder::new();
        assert_eq!(decode_all(&mut d, &bytes), vec![f]);
    }

    #[test]
    fn sequence_numbers_are_not_validated() {
        let mut d = Decoder::new();

        for seq in [5u8, 1, 200, 0, 200, 17].iter() {
            let f = Frame::new(*seq, vec![0x01]);
            let frames = decode_all(&mut d, &f.encode());
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].sequence, *seq);
        }
    }

    #[test]
    fn any_single_bit_flip_is_rejected() {
        let f = Frame::new(3, vec![0x13, 0x00, 0x04, 0xC1, 0x0A, 0x40, 0x4C, 0x20, 0x00, 0x00, 1, 2, 3, 4]);
        let encoded = f.encode();

        for i in 0..encoded.len() {
            for bit in 0..8 {
                let mut corrupt = encoded.clone();
                corrupt[i] ^= 1 << bit;

                let mut d = Decoder::new();
                let frames = decode_all(&mut d, &corrupt);
                assert!(
                    frames.iter().all(|r| r != &f),
                    "corruption at byte {} bit {} accepted",
                    i,
                    bit
                );
            }
        }
    }

    #[test]
    fn checksum_corruption_returns_to_start() {
        let mut encoded = Frame::new(9, vec![0x01]).encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x80;

        let mut d = Decoder::new();
        assert!(decode_all(&mut d, &encoded).is_empty());
        assert_eq!(d.state(), State::AwaitStart);

        // Decoder recovers for the next frame
        let f = Frame::new(10, vec![0x01]);
        assert_eq!(decode_all(&mut d, &f.encode()), vec![f]);
    }

    #[test]
    fn bad_token_restarts() {
        let mut d = Decoder::new();
        for b in [MESSAGE_START, 0x01, 0x00, 0x01].iter() {
            assert!(d.feed(*b).is_none());
        }
        assert_eq!(d.state(), State::AwaitToken);

        assert!(d.feed(0x0F).is_none());
        assert_eq!(d.state(), State::AwaitStart);
    }

    #[test]
    fn oversized_length_is_dropped() {
        let mut d = Decoder::new();
        let len = (MAX_PAYLOAD + 1) as u16;
        let [hi, lo] = len.to_be_bytes();

        for b in [MESSAGE_START, 0x01, hi, lo].iter() {
            assert!(d.feed(*b).is_none());
        }
        assert_eq!(d.state(), State::AwaitStart);
    }

    #[test]
    fn zero_length_is_dropped() {
        let mut d = Decoder::new();
        for b in [MESSAGE_START, 0x01, 0x00, 0x00].iter() {
            d.feed(*b);
        }
        assert_eq!(d.state(), State::AwaitStart);
    }

    #[test]
    fn max_sized_payload_is_accepted() {
        let f = Frame::new(0, vec![0xA5; MAX_PAYLOAD]);
        let mut d = Decoder::new();
        assert_eq!(decode_all(&mut d, &f.encode()), vec![f]);
    }
}
