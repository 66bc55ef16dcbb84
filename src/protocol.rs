//! Binary relay protocol: framing, command parsing, and response encoding.
//!
//! Every frame on the wire is a 4-byte big-endian length followed by that
//! many body bytes. A body starts with common metadata (version, command
//! code, correlation id) and continues with a command-specific payload:
//!
//! ```text
//! Frame    := length:u32 body:byte[length]
//! body     := version:u8 cmdCode:u16 correlationId:u32 payload
//! Login    := usernameLen:u16 username:byte[usernameLen]
//! Message  := msgLen:u16 msg:byte[msgLen]
//!             fromLen:u16 from:byte[fromLen]
//!             toLen:u16 to:byte[toLen]
//!             timestampNanos:i64
//! CorrelationIdTest := <empty>
//! Response := length:u32(=9) version:u8 respCode:u16(=3)
//!             correlationId:u32 statusCode:u16
//! ```
//!
//! All integers are big-endian. Variable-length fields carry a 2-byte
//! length prefix; the Message timestamp is a raw 8-byte signed integer.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::str;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Command code for a Login request.
pub const CMD_LOGIN: u16 = 1;
/// Command code for a directed Message request.
pub const CMD_MESSAGE: u16 = 2;
/// Command code for a CorrelationIdTest request (echo, no side effect).
pub const CMD_CORRELATION_ID_TEST: u16 = 9;
/// Command code carried by every response, distinct from all request codes.
pub const CMD_RESPONSE: u16 = 3;

/// Fixed response body width: version + code + correlation id + status.
pub const RESPONSE_BODY_LEN: u32 = 9;

/// Upper bound on a declared frame body, to cap the read allocation.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Metadata bytes at the start of every body.
const METADATA_LEN: usize = 7;

/// Common header parsed from the start of every command body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub version: u8,
    pub command_code: u16,
    pub correlation_id: u32,
}

/// A fully parsed client command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Bind this connection to a username and mark it online.
    Login { metadata: Metadata, username: String },

    /// Deliver a text message to another username, buffering if offline.
    Message {
        metadata: Metadata,
        text: String,
        from: String,
        to: String,
        sent_at: DateTime<Utc>,
    },

    /// Pure correlation-id echo, exercises the response path only.
    CorrelationIdTest { metadata: Metadata },
}

/// Errors raised while decoding a command body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Body shorter than the fixed metadata header.
    MalformedMetadata,
    /// Body ended inside a length-prefixed or fixed-width field.
    UnexpectedEof,
    /// Body longer than the payload the command code defines.
    TrailingBytes,
    /// A text field was not valid UTF-8.
    InvalidUtf8,
    /// Metadata parsed but the command code is not recognized.
    UnknownCommand(u16),
    /// A response carried a status code outside the known set.
    UnknownStatus(u16),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::MalformedMetadata => write!(f, "Body too short for metadata"),
            ParseError::UnexpectedEof => write!(f, "Body truncated inside a field"),
            ParseError::TrailingBytes => write!(f, "Unexpected bytes after payload"),
            ParseError::InvalidUtf8 => write!(f, "Text field is not valid UTF-8"),
            ParseError::UnknownCommand(code) => write!(f, "Unknown command code: {}", code),
            ParseError::UnknownStatus(code) => write!(f, "Unknown status code: {}", code),
        }
    }
}

impl std::error::Error for ParseError {}

/// Errors raised while reading a frame off the transport.
#[derive(Debug)]
pub enum FrameError {
    /// Stream ended partway through the length field or the body.
    Malformed,
    /// Declared body length exceeds [`MAX_FRAME_LEN`].
    TooLarge(usize),
    /// Transport-level failure.
    Io(std::io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Malformed => write!(f, "Stream ended mid-frame"),
            FrameError::TooLarge(len) => {
                write!(
                    f,
                    "Declared frame length {} exceeds limit {}",
                    len, MAX_FRAME_LEN
                )
            }
            FrameError::Io(e) => write!(f, "I/O error while reading frame: {}", e),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Malformed
        } else {
            FrameError::Io(e)
        }
    }
}

/// Read exactly one frame body from the stream.
///
/// Returns `Ok(None)` on a clean end-of-stream before any length byte;
/// a stream that ends after that point yields [`FrameError::Malformed`].
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let n = stream.read(&mut len_buf).await.map_err(FrameError::from)?;
    if n == 0 {
        return Ok(None);
    }
    if n < len_buf.len() {
        stream.read_exact(&mut len_buf[n..]).await?;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Checked cursor over a frame body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.buf.len() - self.pos < n {
            return Err(ParseError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, ParseError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, ParseError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64, ParseError> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a 2-byte length prefix followed by that many UTF-8 bytes.
    fn read_string(&mut self) -> Result<String, ParseError> {
        let len = self.read_u16()? as usize;
        let raw = self.take(len)?;
        str::from_utf8(raw)
            .map(|s| s.to_string())
            .map_err(|_| ParseError::InvalidUtf8)
    }

    /// Assert the body is fully consumed.
    fn finish(&self) -> Result<(), ParseError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(ParseError::TrailingBytes)
        }
    }
}

impl Command {
    /// Parse one frame body into a command.
    ///
    /// The command code selects the payload layout; an unrecognized code is
    /// reported as [`ParseError::UnknownCommand`] so callers can tell a
    /// protocol mismatch apart from truncated bytes.
    pub fn parse(body: &[u8]) -> Result<Command, ParseError> {
        if body.len() < METADATA_LEN {
            return Err(ParseError::MalformedMetadata);
        }

        let mut r = Reader::new(body);
        let metadata = Metadata {
            version: r.read_u8()?,
            command_code: r.read_u16()?,
            correlation_id: r.read_u32()?,
        };

        match metadata.command_code {
            CMD_LOGIN => {
                let username = r.read_string()?;
                r.finish()?;
                Ok(Command::Login { metadata, username })
            }
            CMD_MESSAGE => {
                let text = r.read_string()?;
                let from = r.read_string()?;
                let to = r.read_string()?;
                let nanos = r.read_i64()?;
                r.finish()?;
                Ok(Command::Message {
                    metadata,
                    text,
                    from,
                    to,
                    sent_at: DateTime::from_timestamp_nanos(nanos),
                })
            }
            CMD_CORRELATION_ID_TEST => {
                r.finish()?;
                Ok(Command::CorrelationIdTest { metadata })
            }
            code => Err(ParseError::UnknownCommand(code)),
        }
    }

    /// Metadata shared by every command variant.
    pub fn metadata(&self) -> Metadata {
        match self {
            Command::Login { metadata, .. } => *metadata,
            Command::Message { metadata, .. } => *metadata,
            Command::CorrelationIdTest { metadata } => *metadata,
        }
    }
}

/// Status code carried in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 1,
    UserNotFound = 3,
    UserAlreadyLogged = 4,
}

impl StatusCode {
    fn from_u16(code: u16) -> Option<StatusCode> {
        match code {
            1 => Some(StatusCode::Ok),
            3 => Some(StatusCode::UserNotFound),
            4 => Some(StatusCode::UserAlreadyLogged),
            _ => None,
        }
    }
}

/// A response frame: fixed shape, echoing the request's version and
/// correlation id alongside a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub version: u8,
    pub correlation_id: u32,
    pub status: StatusCode,
}

impl Response {
    /// Success response echoing the request metadata.
    pub fn ok(metadata: &Metadata) -> Response {
        Response::with_status(metadata, StatusCode::Ok)
    }

    /// Response with an explicit status, echoing the request metadata.
    pub fn with_status(metadata: &Metadata, status: StatusCode) -> Response {
        Response {
            version: metadata.version,
            correlation_id: metadata.correlation_id,
            status,
        }
    }

    /// Encode the full 13-byte response frame, length prefix included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + RESPONSE_BODY_LEN as usize);
        buf.put_u32(RESPONSE_BODY_LEN);
        buf.put_u8(self.version);
        buf.put_u16(CMD_RESPONSE);
        buf.put_u32(self.correlation_id);
        buf.put_u16(self.status as u16);
        buf.freeze()
    }

    /// Decode a full response frame, length prefix included.
    pub fn parse(frame: &[u8]) -> Result<Response, ParseError> {
        let mut r = Reader::new(frame);
        let declared = r.read_u32()?;
        if declared != RESPONSE_BODY_LEN {
            return Err(ParseError::MalformedMetadata);
        }
        let version = r.read_u8()?;
        let code = r.read_u16()?;
        if code != CMD_RESPONSE {
            return Err(ParseError::UnknownCommand(code));
        }
        let correlation_id = r.read_u32()?;
        let status_raw = r.read_u16()?;
        r.finish()?;

        let status =
            StatusCode::from_u16(status_raw).ok_or(ParseError::UnknownStatus(status_raw))?;
        Ok(Response {
            version,
            correlation_id,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch_2025() -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600, 0).unwrap()
    }

    #[test]
    fn test_parse_login() {
        let body = b"\x01\x00\x01\x00\x00\x00\x01\x00\x08TestUser";
        let cmd = Command::parse(body).unwrap();
        assert_eq!(
            cmd,
            Command::Login {
                metadata: Metadata {
                    version: 1,
                    command_code: 1,
                    correlation_id: 1,
                },
                username: "TestUser".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_correlation_id_test() {
        let body = b"\x01\x00\x09\x00\x00\x00\x0A";
        let cmd = Command::parse(body).unwrap();
        assert_eq!(
            cmd,
            Command::CorrelationIdTest {
                metadata: Metadata {
                    version: 1,
                    command_code: 9,
                    correlation_id: 10,
                },
            }
        );
    }

    #[test]
    fn test_parse_message() {
        let body =
            b"\x01\x00\x02\x00\x00\x00\x01\x00\x03msg\x00\x03usr\x00\x03rec\x18\x16\x68\x7E\xC0\x57\x00\x00";
        let cmd = Command::parse(body).unwrap();
        assert_eq!(
            cmd,
            Command::Message {
                metadata: Metadata {
                    version: 1,
                    command_code: 2,
                    correlation_id: 1,
                },
                text: "msg".to_string(),
                from: "usr".to_string(),
                to: "rec".to_string(),
                sent_at: epoch_2025(),
            }
        );
    }

    #[test]
    fn test_parse_metadata_too_short() {
        assert_eq!(Command::parse(b""), Err(ParseError::MalformedMetadata));
        assert_eq!(
            Command::parse(b"\x01\x00"),
            Err(ParseError::MalformedMetadata)
        );
        assert_eq!(
            Command::parse(b"\x01\x00\x01\x00\x00\x00"),
            Err(ParseError::MalformedMetadata)
        );
    }

    #[test]
    fn test_parse_login_truncated_username() {
        // Length prefix cut short
        assert_eq!(
            Command::parse(b"\x01\x00\x01\x00\x00\x00\x01\x00"),
            Err(ParseError::UnexpectedEof)
        );
        // Declares 8 bytes of username, only 5 present
        assert_eq!(
            Command::parse(b"\x01\x00\x01\x00\x00\x00\x01\x00\x08short"),
            Err(ParseError::UnexpectedEof)
        );
    }

    #[test]
    fn test_parse_message_truncated_fields() {
        let meta = b"\x01\x00\x02\x00\x00\x00\x01";

        let cases: &[&[u8]] = &[
            b"\x00",                                          // text length cut
            b"\x00\x08short",                                 // text shorter than declared
            b"\x00\x03msg\x00",                               // from length cut
            b"\x00\x03msg\x00\x03usr\x00\x08short",           // to shorter than declared
            b"\x00\x03msg\x00\x03usr\x00\x03rec\x18\x16\x68", // timestamp cut
        ];
        for payload in cases {
            let mut body = meta.to_vec();
            body.extend_from_slice(payload);
            assert_eq!(Command::parse(&body), Err(ParseError::UnexpectedEof));
        }
    }

    #[test]
    fn test_parse_trailing_bytes_rejected() {
        // Login with one spare byte after the username
        assert_eq!(
            Command::parse(b"\x01\x00\x01\x00\x00\x00\x01\x00\x04userX"),
            Err(ParseError::TrailingBytes)
        );
        // CorrelationIdTest carries no payload at all
        assert_eq!(
            Command::parse(b"\x01\x00\x09\x00\x00\x00\x0A\x00"),
            Err(ParseError::TrailingBytes)
        );
    }

    #[test]
    fn test_parse_unknown_command() {
        let body = b"\x01\x00\x99\x00\x00\x00\x01";
        assert_eq!(Command::parse(body), Err(ParseError::UnknownCommand(0x99)));
    }

    #[test]
    fn test_parse_invalid_utf8_username() {
        let body = b"\x01\x00\x01\x00\x00\x00\x01\x00\x02\xFF\xFE";
        assert_eq!(Command::parse(body), Err(ParseError::InvalidUtf8));
    }

    #[test]
    fn test_response_encode_golden_bytes() {
        let resp = Response {
            version: 1,
            correlation_id: 1,
            status: StatusCode::Ok,
        };
        assert_eq!(
            &resp.encode()[..],
            b"\x00\x00\x00\x09\x01\x00\x03\x00\x00\x00\x01\x00\x01"
        );
    }

    #[test]
    fn test_response_round_trip() {
        for status in [
            StatusCode::Ok,
            StatusCode::UserNotFound,
            StatusCode::UserAlreadyLogged,
        ] {
            let resp = Response {
                version: 1,
                correlation_id: 0xDEADBEEF,
                status,
            };
            assert_eq!(Response::parse(&resp.encode()), Ok(resp));
        }
    }

    #[test]
    fn test_response_parse_rejects_wrong_code() {
        let frame = b"\x00\x00\x00\x09\x01\x00\x07\x00\x00\x00\x01\x00\x01";
        assert_eq!(Response::parse(frame), Err(ParseError::UnknownCommand(7)));
    }

    #[tokio::test]
    async fn test_read_frame_complete() {
        let mut data: &[u8] = b"\x00\x00\x00\x07\x01\x00\x09\x00\x00\x00\x0A";
        let body = read_frame(&mut data).await.unwrap().unwrap();
        assert_eq!(body, b"\x01\x00\x09\x00\x00\x00\x0A");
    }

    #[tokio::test]
    async fn test_read_frame_clean_close() {
        let mut data: &[u8] = b"";
        assert!(read_frame(&mut data).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_truncated_length() {
        let mut data: &[u8] = b"\x00\x00";
        match read_frame(&mut data).await {
            Err(FrameError::Malformed) => {}
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_frame_truncated_body() {
        // Declares 17 body bytes, delivers 1
        let mut data: &[u8] = b"\x00\x00\x00\x11\x01";
        match read_frame(&mut data).await {
            Err(FrameError::Malformed) => {}
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_frame_oversized_length() {
        let mut data: &[u8] = b"\xFF\xFF\xFF\xFF";
        match read_frame(&mut data).await {
            Err(FrameError::TooLarge(len)) => assert_eq!(len, u32::MAX as usize),
            other => panic!("Expected TooLarge, got {:?}", other),
        }
    }
}
