//! RESP2 framing of client commands and replies.
//!
//! Clients send commands as arrays of bulk strings, or as "inline" commands
//! which are a single line of whitespace-separated words. Replies may be any
//! frame type.

use bytes::{Buf, Bytes, BytesMut};
use std::fmt::Write;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    /// Null bulk string (`$-1`).
    Null,
    /// Null array (`*-1`).
    NullArray,
    Array(Vec<Frame>),
}

impl Frame {
    pub fn ok() -> Self {
        Frame::Simple("OK".to_string())
    }

    /// Error reply prefixed with an upper-case `code`, as in `-TIMEOUT timed out`.
    pub fn error(code: &str, message: impl std::fmt::Display) -> Self {
        Frame::Error(format!("{code} {message}"))
    }

    pub fn bulk(value: impl Into<Bytes>) -> Self {
        Frame::Bulk(value.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid frame: {0}")]
    Invalid(&'static str),
    #[error("frame exceeds the maximum length of {0} bytes")]
    TooLarge(usize),
}

/// Codec of RESP2 frames.
#[derive(Debug, Clone)]
pub struct RespCodec {
    max_frame_length: usize,
    scan: Scan,
}

// Progress through a partial frame at the head of the read buffer,
// carried across calls to `decode` so that each byte is scanned once.
#[derive(Debug, Clone, Default, PartialEq)]
struct Scan {
    // Offset of the next item to scan.
    pos: usize,
    // Items yet to be scanned within each enclosing array.
    remaining: Vec<usize>,
}

// Bound on the nesting of arrays within a frame.
const MAX_DEPTH: usize = 8;

impl Default for RespCodec {
    fn default() -> Self {
        Self::new(64 * 1024 * 1024)
    }
}

impl RespCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            scan: Scan::default(),
        }
    }

    // Scan forward from `self.scan` for the end of the frame at the head of `buf`.
    // Returns its length once the frame is complete.
    fn frame_end(&mut self, buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
        'items: loop {
            let mut pos = self.scan.pos;
            let Some(line) = line(buf, &mut pos) else {
                return Ok(None);
            };
            let Some((&prefix, rest)) = line.split_first() else {
                return Err(ProtocolError::Invalid("empty line"));
            };

            match prefix {
                b'+' | b'-' => {}
                b':' => {
                    integer(rest)?;
                }
                b'$' => {
                    let len = integer(rest)?;
                    if len != -1 {
                        let len = self.length(len)?;

                        if buf.len() < pos + len + 2 {
                            return Ok(None); // Resume from this header.
                        }
                        if &buf[pos + len..pos + len + 2] != b"\r\n" {
                            return Err(ProtocolError::Invalid("bulk string is not terminated by CRLF"));
                        }
                        pos += len + 2;
                    }
                }
                b'*' => {
                    let len = integer(rest)?;
                    if len != -1 {
                        if self.scan.remaining.len() == MAX_DEPTH {
                            return Err(ProtocolError::Invalid("arrays are nested too deeply"));
                        }
                        let len = self.length(len)?;

                        if len != 0 {
                            self.scan.pos = pos;
                            self.scan.remaining.push(len);
                            continue 'items;
                        }
                    }
                }
                _ => return Err(ProtocolError::Invalid("unknown frame type")),
            }
            self.scan.pos = pos;

            // The item completes one of each enclosing array that it finishes.
            while let Some(remaining) = self.scan.remaining.last_mut() {
                if *remaining > 1 {
                    *remaining -= 1;
                    continue 'items;
                }
                self.scan.remaining.pop();
            }
            return Ok(Some(pos));
        }
    }

    fn parse(&self, buf: &[u8], pos: &mut usize, depth: usize) -> Result<Option<Frame>, ProtocolError> {
        let Some(line) = line(buf, pos) else {
            return Ok(None);
        };
        let Some((&prefix, rest)) = line.split_first() else {
            return Err(ProtocolError::Invalid("empty line"));
        };

        let frame = match prefix {
            b'+' => Frame::Simple(utf8(rest)?.to_string()),
            b'-' => Frame::Error(utf8(rest)?.to_string()),
            b':' => Frame::Integer(integer(rest)?),
            b'$' => {
                let len = integer(rest)?;
                if len == -1 {
                    return Ok(Some(Frame::Null));
                }
                let len = self.length(len)?;

                if buf.len() < *pos + len + 2 {
                    return Ok(None);
                }
                let body = &buf[*pos..*pos + len];
                if &buf[*pos + len..*pos + len + 2] != b"\r\n" {
                    return Err(ProtocolError::Invalid("bulk string is not terminated by CRLF"));
                }
                *pos += len + 2;

                Frame::Bulk(Bytes::copy_from_slice(body))
            }
            b'*' => {
                let len = integer(rest)?;
                if len == -1 {
                    return Ok(Some(Frame::NullArray));
                }
                if depth == MAX_DEPTH {
                    return Err(ProtocolError::Invalid("arrays are nested too deeply"));
                }
                let len = self.length(len)?;

                // Don't trust `len` for the allocation: each item is at least three bytes.
                let mut items = Vec::with_capacity(len.min((buf.len() - *pos) / 3));
                for _ in 0..len {
                    let Some(item) = self.parse(buf, pos, depth + 1)? else {
                        return Ok(None);
                    };
                    items.push(item);
                }
                Frame::Array(items)
            }
            _ => return Err(ProtocolError::Invalid("unknown frame type")),
        };
        Ok(Some(frame))
    }

    fn length(&self, len: i64) -> Result<usize, ProtocolError> {
        let len = usize::try_from(len).map_err(|_| ProtocolError::Invalid("negative length"))?;

        if len > self.max_frame_length {
            return Err(ProtocolError::TooLarge(self.max_frame_length));
        }
        Ok(len)
    }
}

impl Decoder for RespCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            let Some(&first) = src.first() else {
                return Ok(None);
            };

            if matches!(first, b'+' | b'-' | b':' | b'$' | b'*') {
                let end = match self.frame_end(&src[..]) {
                    Ok(Some(end)) => end,
                    Ok(None) if src.len() <= self.max_frame_length => return Ok(None),
                    Ok(None) => {
                        self.scan = Scan::default();
                        return Err(ProtocolError::TooLarge(self.max_frame_length));
                    }
                    Err(err) => {
                        self.scan = Scan::default();
                        return Err(err);
                    }
                };
                self.scan = Scan::default();

                let mut pos = 0;
                let frame = self.parse(&src[..end], &mut pos, 0)?;
                src.advance(end);

                return frame
                    .map(Some)
                    .ok_or(ProtocolError::Invalid("incomplete frame"));
            }

            // Inline command, which may be terminated by just LF.
            let Some(end) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_frame_length {
                    return Err(ProtocolError::TooLarge(self.max_frame_length));
                }
                return Ok(None);
            };
            let line = src.split_to(end + 1);

            let words: Vec<Frame> = line[..]
                .split(|b: &u8| b.is_ascii_whitespace())
                .filter(|word| !word.is_empty())
                .map(|word| Frame::Bulk(Bytes::copy_from_slice(word)))
                .collect();

            // Blank lines are ignored.
            if !words.is_empty() {
                return Ok(Some(Frame::Array(words)));
            }
        }
    }
}

impl Encoder<Frame> for RespCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        encode(&frame, dst);
        Ok(())
    }
}

fn encode(frame: &Frame, dst: &mut BytesMut) {
    match frame {
        // Line breaks would corrupt the framing of simple strings and errors.
        Frame::Simple(s) => {
            let _ = write!(dst, "+{}\r\n", s.replace(['\r', '\n'], " "));
        }
        Frame::Error(s) => {
            let _ = write!(dst, "-{}\r\n", s.replace(['\r', '\n'], " "));
        }
        Frame::Integer(i) => {
            let _ = write!(dst, ":{i}\r\n");
        }
        Frame::Bulk(b) => {
            let _ = write!(dst, "${}\r\n", b.len());
            dst.extend_from_slice(b);
            dst.extend_from_slice(b"\r\n");
        }
        Frame::Null => dst.extend_from_slice(b"$-1\r\n"),
        Frame::NullArray => dst.extend_from_slice(b"*-1\r\n"),
        Frame::Array(items) => {
            let _ = write!(dst, "*{}\r\n", items.len());
            for item in items {
                encode(item, dst);
            }
        }
    }
}

// Return the CRLF-terminated line at `pos`, advancing `pos` past it.
fn line<'b>(buf: &'b [u8], pos: &mut usize) -> Option<&'b [u8]> {
    let start = *pos;
    let end = buf[start..].windows(2).position(|w| w == b"\r\n")? + start;

    *pos = end + 2;
    Some(&buf[start..end])
}

fn utf8(b: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(b).map_err(|_| ProtocolError::Invalid("line is not UTF-8"))
}

fn integer(b: &[u8]) -> Result<i64, ProtocolError> {
    utf8(b)?
        .parse()
        .map_err(|_| ProtocolError::Invalid("malformed integer"))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(codec: &mut RespCodec, input: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();

        while let Some(frame) = codec.decode(&mut buf)? {
            out.push(frame);
        }
        Ok(out)
    }

    fn command(words: &[&str]) -> Frame {
        Frame::Array(words.iter().map(|w| Frame::bulk(w.to_string())).collect())
    }

    #[test]
    fn decode_pipelined_commands() {
        let mut codec = RespCodec::default();
        let frames = decode_all(
            &mut codec,
            b"*3\r\n$7\r\nPRODUCE\r\n$5\r\ntopic\r\n$6\r\nhi\r\nyo\r\nPING\r\n\r\n*1\r\n$5\r\nFLUSH\r\n",
        )
        .unwrap();

        assert_eq!(
            frames,
            vec![
                command(&["PRODUCE", "topic", "hi\r\nyo"]),
                command(&["PING"]),
                command(&["FLUSH"]),
            ]
        );
    }

    #[test]
    fn decode_waits_for_complete_frames() {
        let mut codec = RespCodec::default();
        let input = b"*2\r\n$4\r\nPING\r\n$5\r\nhello\r\n";

        for split in 1..input.len() {
            let mut buf = BytesMut::from(&input[..split]);
            assert_eq!(codec.decode(&mut buf).unwrap(), None, "split {split}");
            assert_eq!(buf.len(), split, "partial input must not be consumed");

            buf.extend_from_slice(&input[split..]);
            assert_eq!(
                codec.decode(&mut buf).unwrap(),
                Some(command(&["PING", "hello"]))
            );
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn decode_resumes_scanning_across_reads() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(&b"*3\r\n$7\r\nPRODUCE\r\n$5\r\nto"[..]);

        // Scanning stops at the incomplete item, past the completed ones.
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(
            codec.scan,
            Scan {
                pos: 17,
                remaining: vec![2]
            }
        );

        buf.extend_from_slice(b"pic\r\n$2\r\nhi\r");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(
            codec.scan,
            Scan {
                pos: 28,
                remaining: vec![1]
            }
        );

        buf.extend_from_slice(b"\n+OK\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(command(&["PRODUCE", "topic", "hi"]))
        );
        assert_eq!(codec.scan, Scan::default());
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::ok()));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_inline_commands() {
        let mut codec = RespCodec::default();
        let frames = decode_all(&mut codec, b"CONSUME  topic group id\nQUIT\r\n   \r\n").unwrap();

        assert_eq!(
            frames,
            vec![
                command(&["CONSUME", "topic", "group", "id"]),
                command(&["QUIT"])
            ]
        );
    }

    #[test]
    fn decode_scalars_and_nulls() {
        let mut codec = RespCodec::default();
        let frames = decode_all(
            &mut codec,
            b"+OK\r\n-ERR oops\r\n:-42\r\n$-1\r\n*-1\r\n$0\r\n\r\n*2\r\n*0\r\n:1\r\n",
        )
        .unwrap();

        assert_eq!(
            frames,
            vec![
                Frame::ok(),
                Frame::Error("ERR oops".to_string()),
                Frame::Integer(-42),
                Frame::Null,
                Frame::NullArray,
                Frame::bulk(""),
                Frame::Array(vec![Frame::Array(vec![]), Frame::Integer(1)]),
            ]
        );
    }

    #[test]
    fn decode_errors() {
        let mut codec = RespCodec::new(16);

        let cases: &[(&[u8], &str)] = &[
            (b"$5\r\nhelloXX", "invalid frame: bulk string is not terminated by CRLF"),
            (b"$-2\r\n", "invalid frame: negative length"),
            (b":nan\r\n", "invalid frame: malformed integer"),
            (b"*1\r\n?\r\n", "invalid frame: unknown frame type"),
            (b"$17\r\n", "frame exceeds the maximum length of 16 bytes"),
            (b"PING and then a very long line", "frame exceeds the maximum length of 16 bytes"),
            (b"*1\r\n*1\r\n*1\r\n*1\r\n*1\r\n*1\r\n*1\r\n*1\r\n*1\r\n", "invalid frame: arrays are nested too deeply"),
        ];
        for (input, expect) in cases {
            let err = decode_all(&mut codec, input).unwrap_err();
            assert_eq!(err.to_string(), *expect);
        }
    }

    #[test]
    fn encode_replies() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::new();

        for frame in [
            Frame::ok(),
            Frame::error("TIMEOUT", "timed out\r\nwaiting"),
            Frame::Integer(7),
            Frame::Null,
            Frame::NullArray,
            Frame::Array(vec![
                Frame::bulk("topic"),
                Frame::Integer(0),
                Frame::bulk(&b"\x00\xff"[..]),
            ]),
        ] {
            codec.encode(frame, &mut buf).unwrap();
        }

        assert_eq!(
            &buf[..],
            &b"+OK\r\n-TIMEOUT timed out  waiting\r\n:7\r\n$-1\r\n*-1\r\n*3\r\n$5\r\ntopic\r\n:0\r\n$2\r\n\x00\xff\r\n"[..]
        );
    }
}
