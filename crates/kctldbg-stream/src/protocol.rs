//! Frame codec for the multiplexed debug stream.
//!
//! After the 101 the connection carries frames of the form
//! `[channel (1 byte)][padding (3 bytes)][length (4 bytes BE)][payload]`.
//! Channels 0-2 carry stdin/stdout/stderr bytes; channel 3 carries JSON
//! terminal-size events. A zero-length stdin frame half-closes stdin.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Frame header length: channel byte, 3 padding bytes, u32 payload length.
pub const HEADER_LEN: usize = 8;

/// Largest payload the decoder will accept in a single frame.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Stream channels multiplexed onto the upgraded connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    /// Bytes from the operator's keyboard (client to agent).
    Stdin = 0,
    /// Debug container output (agent to client).
    Stdout = 1,
    /// Debug container error output (agent to client, non-TTY only).
    Stderr = 2,
    /// Terminal resize events (client to agent, JSON payload).
    Resize = 3,
}

impl Channel {
    /// Maps a wire byte to a channel.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            3 => Some(Self::Resize),
            _ => None,
        }
    }
}

/// A terminal size event from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Columns.
    pub width: u16,
    /// Rows.
    pub height: u16,
}

/// Encodes a single frame.
#[must_use]
pub fn encode_frame(channel: Channel, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(channel as u8);
    buf.put_bytes(0, 3);
    buf.put_u32(u32::try_from(payload.len()).unwrap_or(u32::MAX));
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental frame decoder.
///
/// Feed it raw socket bytes with [`FrameDecoder::extend`] and drain complete
/// frames with [`FrameDecoder::next_frame`]. Partial frames stay buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes from the connection.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pops the next complete frame, if one is buffered.
    ///
    /// Frames on an unknown channel, and frames whose declared length
    /// exceeds [`MAX_FRAME_LEN`], are dropped rather than killing the
    /// connection.
    pub fn next_frame(&mut self) -> Option<(Channel, Bytes)> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                as usize;
            if len > MAX_FRAME_LEN {
                // Unrecoverable framing, drop the buffer.
                self.buf.clear();
                return None;
            }
            if self.buf.len() < HEADER_LEN + len {
                return None;
            }
            let header = self.buf.split_to(HEADER_LEN);
            let payload = self.buf.split_to(len).freeze();
            match Channel::from_byte(header[0]) {
                Some(channel) => return Some((channel, payload)),
                None => continue,
            }
        }
    }
}

/// Parses a resize payload.
#[must_use]
pub fn decode_resize(payload: &[u8]) -> Option<TerminalSize> {
    serde_json::from_slice(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_across_split_reads() {
        let frame = encode_frame(Channel::Stdout, b"hello");
        let mut dec = FrameDecoder::new();

        // Deliver the frame one byte at a time; nothing pops early.
        for (i, b) in frame.iter().enumerate() {
            dec.extend(&[*b]);
            if i < frame.len() - 1 {
                assert!(dec.next_frame().is_none());
            }
        }
        let (ch, payload) = dec.next_frame().unwrap();
        assert_eq!(ch, Channel::Stdout);
        assert_eq!(&payload[..], b"hello");
        assert!(dec.next_frame().is_none());
    }

    #[test]
    fn test_decode_preserves_order() {
        let mut dec = FrameDecoder::new();
        dec.extend(&encode_frame(Channel::Stdin, b"a"));
        dec.extend(&encode_frame(Channel::Resize, b"{\"width\":80,\"height\":24}"));
        dec.extend(&encode_frame(Channel::Stdin, b"b"));

        assert_eq!(dec.next_frame().unwrap().0, Channel::Stdin);
        assert_eq!(dec.next_frame().unwrap().0, Channel::Resize);
        let (ch, payload) = dec.next_frame().unwrap();
        assert_eq!(ch, Channel::Stdin);
        assert_eq!(&payload[..], b"b");
    }

    #[test]
    fn test_zero_length_frame() {
        let mut dec = FrameDecoder::new();
        dec.extend(&encode_frame(Channel::Stdin, b""));
        let (ch, payload) = dec.next_frame().unwrap();
        assert_eq!(ch, Channel::Stdin);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_unknown_channel_skipped() {
        let mut dec = FrameDecoder::new();
        let mut bogus = encode_frame(Channel::Stdin, b"x").to_vec();
        bogus[0] = 9;
        dec.extend(&bogus);
        dec.extend(&encode_frame(Channel::Stdout, b"ok"));

        let (ch, payload) = dec.next_frame().unwrap();
        assert_eq!(ch, Channel::Stdout);
        assert_eq!(&payload[..], b"ok");
    }

    #[test]
    fn test_resize_payload() {
        let size = decode_resize(b"{\"width\":120,\"height\":40}").unwrap();
        assert_eq!(size.width, 120);
        assert_eq!(size.height, 40);
        assert!(decode_resize(b"not json").is_none());
    }

    #[test]
    fn test_oversized_frame_drops_buffer() {
        let mut dec = FrameDecoder::new();
        let mut header = vec![1u8, 0, 0, 0];
        header.extend_from_slice(&u32::MAX.to_be_bytes());
        dec.extend(&header);
        assert!(dec.next_frame().is_none());
        // Decoder stays usable afterwards.
        dec.extend(&encode_frame(Channel::Stdout, b"next"));
        assert_eq!(&dec.next_frame().unwrap().1[..], b"next");
    }
}
