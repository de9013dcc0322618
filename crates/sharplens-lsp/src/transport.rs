use anyhow::{Context, Result};
use serde_json::Value;

use crate::error::Error;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

/// Encodes one message as `Content-Length: <N>\r\n\r\n<body>`. The caller is
/// responsible for writing the returned bytes in a single serialized write.
pub fn encode_frame(value: &Value) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(value).context("failed to serialize message body")?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Incremental decoder over an accumulating buffer. Feed it raw reads with
/// [`FrameDecoder::extend`], then drain complete messages with
/// [`FrameDecoder::next_frame`] until it returns `Ok(None)`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete message, `Ok(None)` if more bytes are
    /// needed, or an error for a corrupt frame. A corrupt frame is discarded
    /// so the session can log it and keep reading.
    pub fn next_frame(&mut self) -> Result<Option<Value>, Error> {
        let Some(header_end) = find_subsequence(&self.buf, HEADER_SEPARATOR) else {
            return Ok(None);
        };

        let Some(content_length) = parse_content_length(&self.buf[..header_end]) else {
            // Without a trustworthy length there is no body boundary to skip
            // to; dropping through the separator may also eat the start of
            // the next frame. Known fragility of the wire format.
            self.buf.drain(..header_end + HEADER_SEPARATOR.len());
            return Err(Error::MalformedFrame {
                reason: "missing or invalid Content-Length header".to_string(),
            });
        };

        let body_start = header_end + HEADER_SEPARATOR.len();
        let frame_end = body_start + content_length;
        if self.buf.len() < frame_end {
            return Ok(None);
        }

        let parsed: Result<Value, _> = serde_json::from_slice(&self.buf[body_start..frame_end]);
        self.buf.drain(..frame_end);
        match parsed {
            Ok(value) => Ok(Some(value)),
            Err(err) => Err(Error::MalformedFrame {
                reason: format!("invalid JSON body: {err}"),
            }),
        }
    }
}

fn parse_content_length(header: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(header).ok()?;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value.trim().parse().ok();
        }
    }
    None
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_preserves_structure() {
        let original = json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "textDocument/typeDefinition",
            "params": { "position": { "line": 12, "character": 4 } }
        });
        let frame = encode_frame(&original).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn decoding_survives_arbitrary_chunking() {
        let original = json!({ "jsonrpc": "2.0", "method": "initialized", "params": {} });
        let frame = encode_frame(&original).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for byte in frame {
            decoder.extend(&[byte]);
            while let Some(value) = decoder.next_frame().unwrap() {
                decoded.push(value);
            }
        }
        assert_eq!(decoded, vec![original]);
    }

    #[test]
    fn multiple_frames_in_one_chunk_all_decode() {
        let first = json!({ "jsonrpc": "2.0", "id": 1, "result": null });
        let second = json!({ "jsonrpc": "2.0", "method": "$/progress", "params": { "token": 1 } });
        let mut bytes = encode_frame(&first).unwrap();
        bytes.extend(encode_frame(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        assert_eq!(decoder.next_frame().unwrap(), Some(first));
        assert_eq!(decoder.next_frame().unwrap(), Some(second));
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn malformed_length_is_reported_and_skipped() {
        let valid = json!({ "jsonrpc": "2.0", "id": 2, "result": { "ok": true } });
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"Content-Length: not-a-number\r\n\r\n");
        decoder.extend(&encode_frame(&valid).unwrap());

        let err = decoder.next_frame().unwrap_err();
        assert!(matches!(err, Error::MalformedFrame { .. }));
        // The session keeps going: the following frame still decodes.
        assert_eq!(decoder.next_frame().unwrap(), Some(valid));
    }

    #[test]
    fn invalid_json_body_is_reported_and_skipped() {
        let valid = json!({ "jsonrpc": "2.0", "id": 5, "result": null });
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"Content-Length: 9\r\n\r\nnot json!");
        decoder.extend(&encode_frame(&valid).unwrap());

        let err = decoder.next_frame().unwrap_err();
        assert!(matches!(err, Error::MalformedFrame { .. }));
        assert_eq!(decoder.next_frame().unwrap(), Some(valid));
    }

    #[test]
    fn header_names_are_case_insensitive_and_extra_headers_ignored() {
        let body = br#"{"jsonrpc":"2.0","id":7,"result":null}"#;
        let mut decoder = FrameDecoder::new();
        decoder.extend(
            format!(
                "Content-Type: application/vscode-jsonrpc\r\ncontent-length: {}\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        );
        decoder.extend(body);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded["id"], json!(7));
    }
}
