//! Framing for the admin stream
//!
//! Requests arrive as bare JSON objects on a TCP stream with no length
//! prefix; a frame is complete when the brace nesting returns to zero
//! outside of string literals. Responses are written as one JSON document
//! per line.

use bytes::{BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single request frame
const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Splits a byte stream into brace-balanced JSON documents
#[derive(Debug, Default)]
pub struct JsonRpcCodec;

impl JsonRpcCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for JsonRpcCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut depth = 0i32;
        let mut started = false;
        let mut in_string = false;
        let mut escaped = false;

        for (i, &byte) in src.iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if byte == b'\\' {
                    escaped = true;
                } else if byte == b'"' {
                    in_string = false;
                }
                continue;
            }
            match byte {
                b'"' => in_string = true,
                b'{' => {
                    depth += 1;
                    started = true;
                }
                b'}' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "unbalanced braces in admin stream",
                        ));
                    }
                    if started && depth == 0 {
                        let frame = src.split_to(i + 1);
                        let text = String::from_utf8(frame.to_vec()).map_err(|_| {
                            io::Error::new(io::ErrorKind::InvalidData, "admin frame is not UTF-8")
                        })?;
                        return Ok(Some(text));
                    }
                }
                _ => {}
            }
        }

        if src.len() > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "admin frame exceeds size limit",
            ));
        }
        Ok(None)
    }
}

impl Encoder<String> for JsonRpcCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut JsonRpcCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_single_frame() {
        let mut codec = JsonRpcCodec::new();
        let mut buf = BytesMut::from(r#"{"method": "stat"}"#);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames, vec![r#"{"method": "stat"}"#.to_string()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_nested_and_string_braces() {
        let mut codec = JsonRpcCodec::new();
        let mut buf = BytesMut::from(r#"{"params": {"file": "weird}{name.job"}}"#);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("weird}{name.job"));
    }

    #[test]
    fn test_partial_then_complete() {
        let mut codec = JsonRpcCodec::new();
        let mut buf = BytesMut::from(r#"{"method": "st"#);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(br#"at"}{"method":"#);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, r#"{"method": "stat"}"#);
        // The second request is still incomplete
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut codec = JsonRpcCodec::new();
        let mut buf = BytesMut::from(r#"{"a":1}{"b":2}"#);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_escaped_quote_inside_string() {
        let mut codec = JsonRpcCodec::new();
        let mut buf = BytesMut::from(r#"{"s": "quote \" and } brace"}"#);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_unbalanced_close_is_an_error() {
        let mut codec = JsonRpcCodec::new();
        let mut buf = BytesMut::from("}");
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = JsonRpcCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(r#"{"ok":true}"#.to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"{\"ok\":true}\n");
    }
}
