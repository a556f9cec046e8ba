//! Provides a type representing a Redis protocol frame, the encoder for
//! outgoing commands, and utilities for parsing frames from a byte array.
//!
//! Redis serialization protocol (RESP) specification:
//!  https://redis.io/docs/reference/protocol-spec/

use std::convert::TryInto;
use std::fmt;
use std::io::Cursor;
use std::str;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::RelinkParseError;

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(u64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
}

impl PartialEq<&str> for Frame {
    fn eq(&self, other: &&str) -> bool {
        match self {
            Frame::Simple(s) => s.eq(other),
            Frame::Bulk(s) => s.eq(other),
            _ => false,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Frame::Simple(response) => response.fmt(fmt),
            Frame::Error(msg) => write!(fmt, "error: {}", msg),
            Frame::Integer(num) => num.fmt(fmt),
            Frame::Bulk(msg) => match str::from_utf8(msg) {
                Ok(string) => string.fmt(fmt),
                Err(_) => write!(fmt, "{:?}", msg),
            },
            Frame::Null => "(nil)".fmt(fmt),
            Frame::Array(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(fmt, " ")?;
                    }
                    part.fmt(fmt)?;
                }
                Ok(())
            }
        }
    }
}

/// Encodes a command as an array of bulk strings, the only request shape the
/// protocol accepts: `*<argc>\r\n` followed by `$<len>\r\n<arg>\r\n` per
/// argument.
pub fn encode_command(args: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 * (args.len() + 1));

    buf.put_u8(b'*');
    buf.extend_from_slice(args.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");

    for arg in args {
        buf.put_u8(b'$');
        buf.extend_from_slice(arg.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }

    buf.freeze()
}

impl Frame {
    /// Checks whether `src` holds a complete frame, advancing the cursor past
    /// it. `Incomplete` means more bytes are needed, not that the data is
    /// malformed.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), RelinkParseError> {
        match get_u8(src)? {
            b'+' => {
                get_line(src)?;
                Ok(())
            }
            b'-' => {
                get_line(src)?;
                Ok(())
            }
            b':' => {
                let _ = get_decimal(src)?;
                Ok(())
            }
            b'$' => {
                if b'-' == peek_u8(src)? {
                    // Null bulk string: `$-1\r\n`
                    skip(src, 4)?;
                } else {
                    let len: usize = get_decimal(src)?.try_into()?;
                    // data plus the trailing \r\n
                    skip(src, len + 2)?;
                }
                Ok(())
            }
            b'*' => {
                let len = get_decimal(src)?;
                for _ in 0..len {
                    Frame::check(src)?;
                }
                Ok(())
            }
            actual => Err(RelinkParseError::Parse(format!(
                "invalid frame type byte `{}`",
                actual
            ))),
        }
    }

    /// Parses a frame already validated by `check`.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, RelinkParseError> {
        match get_u8(src)? {
            b'+' => {
                let line = get_line(src)?.to_vec();
                let string = String::from_utf8(line)?;
                Ok(Frame::Simple(string))
            }
            b'-' => {
                let line = get_line(src)?.to_vec();
                let string = String::from_utf8(line)?;
                Ok(Frame::Error(string))
            }
            b':' => {
                let num = get_decimal(src)?;
                Ok(Frame::Integer(num))
            }
            b'$' => {
                if b'-' == peek_u8(src)? {
                    let line = get_line(src)?;
                    if line != b"-1" {
                        return Err(RelinkParseError::Parse("invalid frame format".into()));
                    }
                    Ok(Frame::Null)
                } else {
                    let len = get_decimal(src)?.try_into()?;
                    let n = len + 2;
                    if src.remaining() < n {
                        return Err(RelinkParseError::Incomplete);
                    }
                    let data = Bytes::copy_from_slice(&src.chunk()[..len]);
                    skip(src, n)?;
                    Ok(Frame::Bulk(data))
                }
            }
            b'*' => {
                let len = get_decimal(src)?.try_into()?;
                let mut out = Vec::with_capacity(len);
                for _ in 0..len {
                    out.push(Frame::parse(src)?);
                }
                Ok(Frame::Array(out))
            }
            _ => Err(RelinkParseError::Unimplemented),
        }
    }
}

fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<(), RelinkParseError> {
    if src.remaining() < n {
        return Err(RelinkParseError::Incomplete);
    }
    src.advance(n);
    Ok(())
}

fn peek_u8(src: &mut Cursor<&[u8]>) -> Result<u8, RelinkParseError> {
    if !src.has_remaining() {
        return Err(RelinkParseError::Incomplete);
    }
    Ok(src.chunk()[0])
}

fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, RelinkParseError> {
    if !src.has_remaining() {
        return Err(RelinkParseError::Incomplete);
    }
    Ok(src.get_u8())
}

fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<u64, RelinkParseError> {
    use atoi::atoi;
    let line = get_line(src)?;
    atoi::<u64>(line)
        .ok_or_else(|| RelinkParseError::Parse("invalid frame format: expected decimal".into()))
}

fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], RelinkParseError> {
    let start = src.position() as usize;
    let end = src.get_ref().len() - 1;
    for i in start..end {
        if src.get_ref()[i] == b'\r' && src.get_ref()[i + 1] == b'\n' {
            src.set_position((i + 2) as u64);
            return Ok(&src.get_ref()[start..i]);
        }
    }
    Err(RelinkParseError::Incomplete)
}
