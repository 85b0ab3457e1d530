//! Content-Length framing.
//!
//! Each frame is a header block terminated by an empty line, followed by a
//! JSON body of exactly `Content-Length` bytes:
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"method":"shutdown","params":null}
//! ```

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Message, ProtocolError};

/// Maximum body size in bytes (64 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Maximum header block size before the terminating empty line.
const MAX_HEADER_SIZE: usize = 8 * 1024;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Codec for JSON-RPC messages over a byte stream.
pub struct RpcCodec {
    pub(crate) max_message_size: usize,
}

impl RpcCodec {
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for RpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses the header block, returning the content length.
///
/// Headers other than `Content-Length` (e.g. `Content-Type`) are ignored.
fn parse_headers(block: &[u8]) -> Result<usize, ProtocolError> {
    let text = std::str::from_utf8(block)
        .map_err(|_| ProtocolError::InvalidHeader("headers are not UTF-8".to_string()))?;

    let mut content_length = None;
    for line in text.split("\r\n").filter(|line| !line.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(ProtocolError::InvalidHeader(line.to_string()));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let length = value
                .trim()
                .parse::<usize>()
                .map_err(|_| ProtocolError::InvalidHeader(line.to_string()))?;
            content_length = Some(length);
        }
    }
    content_length.ok_or(ProtocolError::MissingContentLength)
}

impl Decoder for RpcCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(header_len) = src
            .windows(HEADER_END.len())
            .position(|window| window == HEADER_END)
        else {
            if src.len() > MAX_HEADER_SIZE {
                return Err(ProtocolError::InvalidHeader(
                    "header block too long".to_string(),
                ));
            }
            return Ok(None);
        };

        let body_len = parse_headers(&src[..header_len])?;
        if body_len > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: body_len,
                max: self.max_message_size,
            });
        }

        let frame_len = header_len + HEADER_END.len() + body_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        let body = frame.split_off(header_len + HEADER_END.len());
        let message = serde_json::from_slice(&body)?;
        Ok(Some(message))
    }
}

impl Encoder<Message> for RpcCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, RequestId, Response};
    use serde_json::json;

    fn frame(body: &str) -> BytesMut {
        BytesMut::from(format!("Content-Length: {}\r\n\r\n{body}", body.len()).as_bytes())
    }

    #[test]
    fn test_decode_request() {
        let mut codec = RpcCodec::new();
        let mut buf =
            frame(r#"{"jsonrpc":"2.0","id":7,"method":"query/cancel","params":{"ownerUri":"a"}}"#);

        let message = codec.decode(&mut buf).unwrap().unwrap();
        let Message::Request(request) = message else {
            panic!("expected a request, got {message:?}");
        };
        assert_eq!(request.id, RequestId::Number(7));
        assert_eq!(request.method, "query/cancel");
        assert_eq!(request.params, json!({"ownerUri": "a"}));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = RpcCodec::new();
        let full = frame(r#"{"jsonrpc":"2.0","method":"exit"}"#);

        let mut buf = BytesMut::from(&full[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[10..full.len() - 3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[full.len() - 3..]);

        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(message, Message::Notification(n) if n.method == "exit"));
    }

    #[test]
    fn test_decode_two_frames_and_extra_headers() {
        let mut codec = RpcCodec::new();
        let body = r#"{"jsonrpc":"2.0","method":"exit"}"#;
        let mut buf = BytesMut::from(
            format!(
                "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            )
            .as_bytes(),
        );
        buf.extend_from_slice(&frame(body));

        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_errors() {
        let mut codec = RpcCodec::new();
        let mut buf = BytesMut::from(&b"Content-Type: x\r\n\r\n{}"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MissingContentLength)
        ));

        let mut buf = BytesMut::from(&b"Content-Length: abc\r\n\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::InvalidHeader(_))
        ));

        let mut small = RpcCodec::with_max_message_size(4);
        let mut buf = frame(r#"{"jsonrpc":"2.0","method":"exit"}"#);
        assert!(matches!(
            small.decode(&mut buf),
            Err(ProtocolError::MessageTooLarge { max: 4, .. })
        ));
    }

    #[test]
    fn test_encode_response() {
        let mut codec = RpcCodec::new();
        let mut buf = BytesMut::new();
        let response = Response::success(RequestId::Number(1), json!(true));
        codec.encode(Message::Response(response), &mut buf).unwrap();

        let text = String::from_utf8(buf.to_vec()).unwrap();
        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(header, format!("Content-Length: {}", body.len()));
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(body).unwrap(),
            json!({"jsonrpc": "2.0", "id": 1, "result": true})
        );
    }

    #[test]
    fn test_decoded_request_can_be_reencoded() {
        let mut codec = RpcCodec::new();
        let request = Request::new(RequestId::String("r1".into()), "shutdown", json!(null));
        let mut buf = BytesMut::new();
        codec
            .encode(Message::Request(request.clone()), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, Message::Request(r) if r == request));
    }
}
