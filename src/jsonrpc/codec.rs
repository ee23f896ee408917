//! Structure-delimited JSON stream codec.
//!
//! Messages are written back to back with no length prefix or separator;
//! the decoder finds message boundaries from the JSON structure itself.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound for a single inbound value
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message exceeds {limit} bytes ({size} buffered)")]
    TooLarge { size: usize, limit: usize },

    #[error("stream ended in the middle of a message")]
    Truncated,
}

/// Progress through a partially received object or array. Kept between
/// reads so each byte is scanned once however the message is split.
#[derive(Debug, Clone, Default)]
struct Scan {
    offset: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Scan {
    /// Advance over `buf[self.offset..]`. Returns the length of the
    /// top-level value once its closing bracket has been seen.
    fn advance(&mut self, buf: &[u8]) -> Option<usize> {
        while self.offset < buf.len() {
            let b = buf[self.offset];
            self.offset += 1;
            if self.in_string {
                match b {
                    _ if self.escaped => self.escaped = false,
                    b'\\' => self.escaped = true,
                    b'"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(self.offset);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct JsonCodec {
    max_message_size: usize,
    scan: Scan,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            scan: Scan::default(),
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn check_size(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_message_size {
            return Err(CodecError::TooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }

    /// Bare scalars at the top level are not messages, but still have to be
    /// consumed so the read loop can reject them.
    fn decode_scalar(&mut self, src: &mut BytesMut) -> Result<Option<Value>, CodecError> {
        let mut stream = serde_json::Deserializer::from_slice(&src[..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                self.check_size(consumed)?;
                src.advance(consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => {
                self.check_size(src.len())?;
                Ok(None)
            }
            Some(Err(e)) => Err(CodecError::Json(e)),
            None => Ok(None),
        }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonCodec {
    type Item = Value;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, CodecError> {
        if self.scan.offset == 0 {
            // メッセージ間の空白を読み飛ばす
            let skip = src
                .iter()
                .position(|b| !b.is_ascii_whitespace())
                .unwrap_or(src.len());
            src.advance(skip);

            match src.first() {
                None => return Ok(None),
                Some(b'{') | Some(b'[') => {}
                Some(_) => return self.decode_scalar(src),
            }
        }

        let Some(end) = self.scan.advance(&src[..]) else {
            self.check_size(src.len())?;
            src.reserve(4096);
            return Ok(None);
        };
        self.scan = Scan::default();

        self.check_size(end)?;
        let value = serde_json::from_slice(&src[..end])?;
        src.advance(end);
        Ok(Some(value))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Value>, CodecError> {
        match self.decode(src)? {
            Some(value) => Ok(Some(value)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::Truncated),
        }
    }
}

impl Encoder<Value> for JsonCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), CodecError> {
        serde_json::to_writer(dst.writer(), &item)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decodes_back_to_back_values() {
        let mut codec = JsonCodec::new();
        let mut buf = BytesMut::from(&b"{\"a\":1}{\"b\":2} \n[1,2]"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"a": 1})));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"b": 2})));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!([1, 2])));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_waits_for_split_message() {
        let mut codec = JsonCodec::new();
        let mut buf = BytesMut::from(&b"{\"jsonrpc\":\"2."[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"0\",\"method\":\"x\"}");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(json!({"jsonrpc": "2.0", "method": "x"}))
        );
    }

    #[test]
    fn test_rejects_malformed_json() {
        let mut codec = JsonCodec::new();
        let mut buf = BytesMut::from(&b"{\"a\" 1}"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_enforces_size_limit() {
        let mut codec = JsonCodec::with_max_message_size(8);
        let mut buf = BytesMut::from(&b"{\"key\":\"0123456789"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::TooLarge { limit: 8, .. })
        ));

        // 一度に届いた完全な値でも上限を超えれば拒否する
        let mut codec = JsonCodec::with_max_message_size(8);
        let mut buf = BytesMut::from(&br#"{"key":"0123456789abcdef"}"#[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::TooLarge { size: 26, limit: 8 })
        ));

        let mut codec = JsonCodec::with_max_message_size(8);
        let mut buf = BytesMut::from(&b"{\"a\":1}"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"a": 1})));
    }

    #[test]
    fn test_brackets_inside_strings() {
        let mut codec = JsonCodec::new();
        let mut buf = BytesMut::from(&br#"{"s":"}]\"{"}[1]"#[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"s": "}]\"{"})));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!([1])));
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut codec = JsonCodec::new();
        let message = br#"{"jsonrpc":"2.0","params":["a\"]",{"b":[]}],"method":"x"}"#;
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in message.iter().chain(b"\n[]".iter()) {
            buf.extend_from_slice(&[*byte]);
            if let Some(value) = codec.decode(&mut buf).unwrap() {
                decoded.push(value);
            }
        }
        assert_eq!(
            decoded,
            vec![
                json!({"jsonrpc": "2.0", "params": ["a\"]", {"b": []}], "method": "x"}),
                json!([]),
            ]
        );
    }

    #[test]
    fn test_truncated_at_eof() {
        let mut codec = JsonCodec::new();
        let mut buf = BytesMut::from(&b"{\"a\":"[..]);
        assert!(matches!(codec.decode_eof(&mut buf), Err(CodecError::Truncated)));

        let mut buf = BytesMut::from(&b"  \n"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_encode_is_compact() {
        let mut codec = JsonCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(json!({"jsonrpc": "2.0", "method": "x"}), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], br#"{"jsonrpc":"2.0","method":"x"}"#);
    }
}
