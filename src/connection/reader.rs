use std::io::Cursor;

use bytes::{Buf, BytesMut};

use crate::connection::frame::Frame;
use crate::consts::READ_BUFFER_SIZE;
use crate::error::RelinkParseError;

/// Incremental reply decoder.
///
/// Bytes arrive from the transport in arbitrary chunks; `feed` appends them
/// and `next` yields one decoded frame at a time until the buffer no longer
/// holds a complete one. Frames are validated with [`Frame::check`] before
/// being parsed, so a partial frame leaves the buffer untouched.
pub struct FrameReader {
    buffer: BytesMut,
}

impl FrameReader {
    pub fn new() -> FrameReader {
        FrameReader {
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete frame, or `None` when more bytes are needed.
    pub fn next(&mut self) -> Result<Option<Frame>, RelinkParseError> {
        let mut buf = Cursor::new(&self.buffer[..]);

        match Frame::check(&mut buf) {
            Ok(()) => {
                let len = buf.position() as usize;
                buf.set_position(0);
                let frame = Frame::parse(&mut buf)?;
                self.buffer.advance(len);
                Ok(Some(frame))
            }
            Err(RelinkParseError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Default for FrameReader {
    fn default() -> FrameReader {
        FrameReader::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames_fed_in_fragments() {
        let mut reader = FrameReader::new();

        reader.feed(b"+OK\r\n$5\r\nhe");
        assert!(matches!(reader.next().unwrap(), Some(Frame::Simple(s)) if s == "OK"));
        // The bulk string is still short two bytes and the trailer.
        assert!(reader.next().unwrap().is_none());

        reader.feed(b"llo\r\n");
        match reader.next().unwrap() {
            Some(Frame::Bulk(data)) => assert_eq!(&data[..], b"hello"),
            other => panic!("expected bulk string, got {:?}", other),
        }
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn decodes_multiple_frames_from_one_chunk() {
        let mut reader = FrameReader::new();
        reader.feed(b":1\r\n:2\r\n:3\r\n");

        let mut values = Vec::new();
        while let Some(frame) = reader.next().unwrap() {
            match frame {
                Frame::Integer(n) => values.push(n),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn decodes_nested_arrays() {
        let mut reader = FrameReader::new();
        reader.feed(b"*2\r\n*2\r\n+a\r\n+b\r\n:7\r\n");

        match reader.next().unwrap() {
            Some(Frame::Array(outer)) => {
                assert_eq!(outer.len(), 2);
                assert!(matches!(&outer[0], Frame::Array(inner) if inner.len() == 2));
                assert!(matches!(outer[1], Frame::Integer(7)));
            }
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn surfaces_malformed_input() {
        let mut reader = FrameReader::new();
        reader.feed(b"@bogus\r\n");
        assert!(reader.next().is_err());
    }
}
