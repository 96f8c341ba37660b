//! Framing primitives shared by the three protocol generations.
//!
//! Version one and two messages are line oriented:
//!
//! ```text
//! method \x01 arg1 \x01 arg2 \n              argument tuple
//! <decimal length> \n <bytes> done \n        length-prefixed body
//! chunked \n (<hex length> \n <bytes>)* END \n   chunked body (v2 responses)
//! ```
//!
//! Version three messages are a marker, a length-prefixed bencoded header
//! dict, then a sequence of typed parts:
//!
//! ```text
//! +------+-------------------------------+
//! | 'o'  | 1 byte ('S' or 'E')           |  status
//! | 's'  | u32 length | bencoded list    |  structure (arguments)
//! | 'b'  | u32 length | bytes            |  body chunk
//! | 'e'  |                               |  end of message
//! +------+-------------------------------+
//! ```

use crate::bencode::Value;
use crate::error::ProtocolError;
use crate::message::ReadvRange;
use crate::{MAX_LINE_LENGTH, MAX_PART_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Separator between the elements of a V1/V2 tuple.
pub const TUPLE_SEPARATOR: u8 = 0x01;

/// Trailer that closes a length-prefixed body.
pub const BODY_TRAILER: &[u8] = b"done\n";

/// Opens a V2 chunked body.
pub const CHUNKED_BODY_START: &[u8] = b"chunked\n";

/// Closes a V2 chunked body.
pub const CHUNKED_BODY_END: &[u8] = b"END\n";

/// Announces that the next V2 chunk carries an error tuple.
pub const CHUNKED_BODY_ERROR: &[u8] = b"ERR\n";

/// Status byte of a successful V3 response.
pub const STATUS_SUCCESS: u8 = b'S';

/// Status byte of a failed V3 response (or a failed stream).
pub const STATUS_ERROR: u8 = b'E';

/// Appends `args` as a V1/V2 tuple line.
pub fn encode_tuple(args: &[Bytes], buf: &mut BytesMut) -> Result<(), ProtocolError> {
    for (i, arg) in args.iter().enumerate() {
        if arg.iter().any(|&b| b == TUPLE_SEPARATOR || b == b'\n') {
            return Err(ProtocolError::InvalidArgument(arg.clone()));
        }
        if i > 0 {
            buf.put_u8(TUPLE_SEPARATOR);
        }
        buf.put_slice(arg);
    }
    buf.put_u8(b'\n');
    Ok(())
}

/// Splits a tuple line (without its newline) into arguments.
pub fn decode_tuple(line: &[u8]) -> Vec<Bytes> {
    line.split(|&b| b == TUPLE_SEPARATOR)
        .map(Bytes::copy_from_slice)
        .collect()
}

/// Removes and returns the next line (without its newline) from `buf`.
///
/// Returns `Ok(None)` if no complete line is buffered yet.
pub fn take_line(buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    match buf.iter().position(|&b| b == b'\n') {
        Some(idx) => {
            let line = buf.split_to(idx).freeze();
            buf.advance(1);
            Ok(Some(line))
        }
        None if buf.len() > MAX_LINE_LENGTH => Err(ProtocolError::LineTooLong {
            max: MAX_LINE_LENGTH,
        }),
        None => Ok(None),
    }
}

/// Appends a length-prefixed body.
pub fn encode_body(body: &[u8], buf: &mut BytesMut) {
    buf.put_slice(body.len().to_string().as_bytes());
    buf.put_u8(b'\n');
    buf.put_slice(body);
    buf.put_slice(BODY_TRAILER);
}

/// Appends one V2 body chunk.
pub fn encode_chunk(chunk: &[u8], buf: &mut BytesMut) {
    buf.put_slice(format!("{:x}\n", chunk.len()).as_bytes());
    buf.put_slice(chunk);
}

/// Parses the decimal length line of a length-prefixed body.
pub fn parse_body_length(line: &[u8]) -> Result<usize, ProtocolError> {
    parse_length(line, 10)
}

/// Parses the hex length line of a V2 chunk.
pub fn parse_chunk_length(line: &[u8]) -> Result<usize, ProtocolError> {
    parse_length(line, 16)
}

fn parse_length(line: &[u8], radix: u32) -> Result<usize, ProtocolError> {
    let bad = || ProtocolError::BadLength(Bytes::copy_from_slice(line));
    if line.is_empty() || !line.iter().all(|b| (*b as char).is_digit(radix)) {
        return Err(bad());
    }
    let s = std::str::from_utf8(line).map_err(|_| bad())?;
    let len = usize::from_str_radix(s, radix).map_err(|_| bad())?;
    if len > MAX_PART_SIZE as usize {
        return Err(ProtocolError::PartTooLarge {
            size: len.min(u32::MAX as usize) as u32,
            max: MAX_PART_SIZE,
        });
    }
    Ok(len)
}

/// Renders readv ranges as the `offset,length` lines carried in a body.
pub fn encode_readv(ranges: &[ReadvRange]) -> Bytes {
    let lines: Vec<String> = ranges
        .iter()
        .map(|r| format!("{},{}", r.offset, r.length))
        .collect();
    Bytes::from(lines.join("\n"))
}

/// Parses a readv body back into ranges.
pub fn decode_readv(body: &[u8]) -> Result<Vec<ReadvRange>, ProtocolError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    body.split(|&b| b == b'\n')
        .map(|line| {
            let bad = || ProtocolError::BadWireValue {
                value: Bytes::copy_from_slice(line),
                expected: "offset,length",
            };
            let s = std::str::from_utf8(line).map_err(|_| bad())?;
            let (offset, length) = s.split_once(',').ok_or_else(bad)?;
            Ok(ReadvRange {
                offset: offset.parse().map_err(|_| bad())?,
                length: length.parse().map_err(|_| bad())?,
            })
        })
        .collect()
}

/// Appends `bytes` with a big-endian u32 length prefix.
pub fn encode_prefixed(bytes: &[u8], buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let len = bytes.len();
    if len > MAX_PART_SIZE as usize {
        return Err(ProtocolError::PartTooLarge {
            size: len.min(u32::MAX as usize) as u32,
            max: MAX_PART_SIZE,
        });
    }
    buf.put_u32(len as u32);
    buf.put_slice(bytes);
    Ok(())
}

/// Removes a u32 length-prefixed block from the front of `buf`, if complete.
pub fn take_prefixed(buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_PART_SIZE {
        return Err(ProtocolError::PartTooLarge {
            size: len,
            max: MAX_PART_SIZE,
        });
    }
    if buf.len() < 4 + len as usize {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(len as usize).freeze()))
}

/// One part of a version three message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePart {
    /// A single byte; used for response status.
    OneByte(u8),
    /// A bencoded structure; used for argument tuples.
    Structure(Value),
    /// A chunk of body bytes.
    Bytes(Bytes),
    /// End of message.
    End,
}

impl MessagePart {
    const ONE_BYTE: u8 = b'o';
    const STRUCTURE: u8 = b's';
    const BYTES: u8 = b'b';
    const END: u8 = b'e';

    /// Appends the encoded part to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            MessagePart::OneByte(b) => {
                buf.put_u8(Self::ONE_BYTE);
                buf.put_u8(*b);
            }
            MessagePart::Structure(value) => {
                buf.put_u8(Self::STRUCTURE);
                encode_prefixed(&value.to_bytes(), buf)?;
            }
            MessagePart::Bytes(bytes) => {
                buf.put_u8(Self::BYTES);
                encode_prefixed(bytes, buf)?;
            }
            MessagePart::End => buf.put_u8(Self::END),
        }
        Ok(())
    }

    /// Decodes the next part from `buf`.
    ///
    /// Returns `Ok(Some(part))` if a complete part was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let Some(&kind) = buf.first() else {
            return Ok(None);
        };
        match kind {
            Self::ONE_BYTE => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                let b = buf[1];
                buf.advance(2);
                Ok(Some(MessagePart::OneByte(b)))
            }
            Self::STRUCTURE | Self::BYTES => {
                // Peek past the type byte so an incomplete part leaves `buf` untouched.
                if buf.len() < 5 {
                    return Ok(None);
                }
                let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
                if len > MAX_PART_SIZE {
                    return Err(ProtocolError::PartTooLarge {
                        size: len,
                        max: MAX_PART_SIZE,
                    });
                }
                if buf.len() < 5 + len as usize {
                    return Ok(None);
                }
                buf.advance(5);
                let content = buf.split_to(len as usize).freeze();
                if kind == Self::BYTES {
                    Ok(Some(MessagePart::Bytes(content)))
                } else {
                    Ok(Some(MessagePart::Structure(Value::decode(&content)?)))
                }
            }
            Self::END => {
                buf.advance(1);
                Ok(Some(MessagePart::End))
            }
            other => Err(ProtocolError::InvalidPartType(other)),
        }
    }
}
