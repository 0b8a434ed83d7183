use std::{fmt, str::FromStr};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod reader;

pub use reader::PushbackReader;

/// Size of one file payload block. The reference server reads with the same
/// block size, so this is part of the protocol.
pub const FILE_CHUNK_BYTES: usize = 1024;
/// Largest unit a single receive hands to the decoder.
pub const MAX_RECEIVE_BYTES: usize = 1024;
pub const LENGTH_HEADER_BYTES: usize = 10;
pub const MAX_DECLARED_LENGTH: u64 = 9_999_999_999;
pub const NAME_IN_USE: &str = "NOMBRE_EN_USO";
pub const LIST_FILES: &str = "LISTA_ARCHIVOS";
pub const LOGIN_STATUS_RECEIVED: &str = "received";
const TAG_SEPARATOR: u8 = b':';
const SENDER_SEPARATOR: &str = ": ";
// Cap on up-front allocation for a declared length; the buffer still grows to
// whatever actually arrives.
const MAX_PREALLOC_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    File,
    Download,
    Credentials,
}

impl Tag {
    pub const ALL: [Tag; 3] = [Tag::File, Tag::Download, Tag::Credentials];

    pub fn as_str(self) -> &'static str {
        match self {
            Tag::File => "ARCHIVO",
            Tag::Download => "DESCARGAR_ARCHIVO",
            Tag::Credentials => "CREDENTIALS",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tag {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownTag(s.to_owned()))
    }
}

/// One received unit, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    PlainText(String),
    Tagged { tag: Tag, payload: Vec<u8> },
    LengthPrefixedHeader(u64),
}

/// Outbound protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    UserName(String),
    Chat(String),
    AnnounceFile(String),
    ListFiles,
    Download(String),
    Credentials(Credentials),
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginResponse {
    pub status: String,
    #[serde(rename = "Resp", default)]
    pub resp: u8,
    #[serde(rename = "Mens", default)]
    pub message: String,
}

impl LoginResponse {
    pub fn received(accepted: bool, message: impl Into<String>) -> Self {
        Self {
            status: LOGIN_STATUS_RECEIVED.to_owned(),
            resp: u8::from(accepted),
            message: message.into(),
        }
    }

    pub fn is_received(&self) -> bool {
        self.status == LOGIN_STATUS_RECEIVED
    }

    pub fn accepted(&self) -> bool {
        self.is_received() && self.resp == 1
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed length header {0:?}")]
    MalformedLength(String),
    #[error("unknown tag {0:?}")]
    UnknownTag(String),
    #[error("stream ended after {received} of {expected} bytes")]
    IncompleteTransfer { expected: u64, received: u64 },
    #[error("invalid file listing: {0}")]
    InvalidListing(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Classifies a received unit. Known tags win over plain text; a header is
/// only recognised when the unit is exactly ten ASCII digits.
pub fn decode(buf: &[u8]) -> Inbound {
    if let Some((tag, payload)) = split_tag(buf) {
        return Inbound::Tagged {
            tag,
            payload: payload.to_vec(),
        };
    }

    if buf.len() == LENGTH_HEADER_BYTES
        && let Ok(length) = parse_length_header(buf)
    {
        return Inbound::LengthPrefixedHeader(length);
    }

    Inbound::PlainText(String::from_utf8_lossy(buf).into_owned())
}

fn split_tag(buf: &[u8]) -> Option<(Tag, &[u8])> {
    let colon = buf.iter().position(|b| *b == TAG_SEPARATOR)?;
    let tag = std::str::from_utf8(&buf[..colon]).ok()?.parse::<Tag>().ok()?;
    Some((tag, &buf[colon + 1..]))
}

pub fn is_name_rejection(buf: &[u8]) -> bool {
    buf == NAME_IN_USE.as_bytes()
}

pub fn parse_length_header(header: &[u8]) -> Result<u64, ProtocolError> {
    let malformed = || ProtocolError::MalformedLength(String::from_utf8_lossy(header).into_owned());
    if header.len() != LENGTH_HEADER_BYTES || !header.iter().all(u8::is_ascii_digit) {
        return Err(malformed());
    }

    std::str::from_utf8(header)
        .map_err(|_| malformed())?
        .parse::<u64>()
        .map_err(|_| malformed())
}

pub fn encode_length_header(length: u64) -> Result<[u8; LENGTH_HEADER_BYTES], ProtocolError> {
    if length > MAX_DECLARED_LENGTH {
        return Err(ProtocolError::MalformedLength(length.to_string()));
    }

    let text = format!("{length:0width$}", width = LENGTH_HEADER_BYTES);
    let mut out = [0_u8; LENGTH_HEADER_BYTES];
    out.copy_from_slice(text.as_bytes());
    Ok(out)
}

pub fn encode_tagged(tag: Tag, payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(tag.as_str().len() + 1 + payload.len());
    out.extend_from_slice(tag.as_str().as_bytes());
    out.push(TAG_SEPARATOR);
    out.extend_from_slice(payload.as_bytes());
    out
}

pub fn encode_command(command: &Command) -> Result<Vec<u8>, ProtocolError> {
    let bytes = match command {
        Command::UserName(text) | Command::Chat(text) => text.as_bytes().to_vec(),
        Command::AnnounceFile(name) => encode_tagged(Tag::File, name),
        Command::ListFiles => LIST_FILES.as_bytes().to_vec(),
        Command::Download(name) => encode_tagged(Tag::Download, name),
        Command::Credentials(credentials) => {
            let json = serde_json::to_string(credentials)
                .map_err(|err| ProtocolError::Serialization(err.to_string()))?;
            encode_tagged(Tag::Credentials, &json)
        }
    };
    Ok(bytes)
}

/// Header plus payload, ready to write in one go.
pub fn encode_length_prefixed(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let header = encode_length_header(payload.len() as u64)?;
    let mut out = Vec::with_capacity(LENGTH_HEADER_BYTES + payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn encode_file_listing(names: &[String]) -> Result<Vec<u8>, ProtocolError> {
    let json =
        serde_json::to_vec(names).map_err(|err| ProtocolError::Serialization(err.to_string()))?;
    encode_length_prefixed(&json)
}

pub fn decode_file_listing(payload: &[u8]) -> Result<Vec<String>, ProtocolError> {
    serde_json::from_slice::<Vec<String>>(payload)
        .map_err(|err| ProtocolError::InvalidListing(err.to_string()))
}

/// Splits an `ARCHIVO:` payload into the file name and any stream bytes that
/// arrived in the same receive.
///
/// A split point is a position followed by ten ASCII digits (the size
/// header). Names may carry digit runs of their own (`IMG_20240101123456.jpg`),
/// so a split is preferred where the name ends in an extension, then the
/// whole payload when it ends in one, then the first zero-led header.
pub fn split_announcement(payload: &[u8]) -> (String, &[u8]) {
    let candidates = || {
        (1..payload.len()).filter(move |&start| {
            payload[start..]
                .get(..LENGTH_HEADER_BYTES)
                .is_some_and(|window| window.iter().all(u8::is_ascii_digit))
        })
    };
    let zero_led = |start: &usize| payload[*start] == b'0';
    let named = |start: &usize| ends_with_extension(&payload[..*start]);

    let split = candidates()
        .find(|start| named(start) && zero_led(start))
        .or_else(|| candidates().find(named))
        .or_else(|| ends_with_extension(payload).then_some(payload.len()))
        .or_else(|| candidates().find(zero_led))
        .or_else(|| candidates().next())
        .unwrap_or(payload.len());
    (
        String::from_utf8_lossy(&payload[..split]).into_owned(),
        &payload[split..],
    )
}

/// `stem.ext` with a short alphanumeric extension holding at least one letter.
fn ends_with_extension(name: &[u8]) -> bool {
    let Ok(name) = std::str::from_utf8(name) else {
        return false;
    };
    name.rsplit_once('.').is_some_and(|(stem, ext)| {
        !stem.is_empty()
            && (1..=8).contains(&ext.len())
            && ext.bytes().all(|b| b.is_ascii_alphanumeric())
            && ext.bytes().any(|b| b.is_ascii_alphabetic())
    })
}

/// Splits a relayed chat line `sender: body`.
pub fn split_sender(line: &str) -> Option<(&str, &str)> {
    line.split_once(SENDER_SEPARATOR)
}

pub fn format_chat_line(sender: &str, body: &str) -> String {
    format!("{sender}{SENDER_SEPARATOR}{body}")
}

/// Incremental reader for one length-prefixed block.
#[derive(Debug, Default)]
pub struct LengthPrefixedDecoder {
    header: BytesMut,
    expected: Option<u64>,
    payload: BytesMut,
}

impl LengthPrefixedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expected(&self) -> Option<u64> {
        self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.expected
            .is_some_and(|expected| self.payload.len() as u64 == expected)
    }

    /// Bytes still needed before the block is complete.
    pub fn remaining(&self) -> usize {
        match self.expected {
            None => LENGTH_HEADER_BYTES - self.header.len(),
            Some(expected) => (expected - self.payload.len() as u64)
                .try_into()
                .unwrap_or(usize::MAX),
        }
    }

    /// Consumes from `input` up to the end of the block and returns how many
    /// bytes were used. Bytes past the block are left for the caller.
    pub fn feed(&mut self, input: &[u8]) -> Result<usize, ProtocolError> {
        let mut consumed = 0;

        if self.expected.is_none() {
            let take = (LENGTH_HEADER_BYTES - self.header.len()).min(input.len());
            self.header.extend_from_slice(&input[..take]);
            consumed += take;
            if self.header.len() < LENGTH_HEADER_BYTES {
                return Ok(consumed);
            }

            let expected = parse_length_header(&self.header)?;
            self.payload
                .reserve(expected.min(MAX_PREALLOC_BYTES) as usize);
            self.expected = Some(expected);
        }

        let take = self.remaining().min(input.len() - consumed);
        self.payload
            .extend_from_slice(&input[consumed..consumed + take]);
        Ok(consumed + take)
    }

    pub fn finish(self) -> Result<Bytes, ProtocolError> {
        match self.expected {
            None => Err(ProtocolError::IncompleteTransfer {
                expected: LENGTH_HEADER_BYTES as u64,
                received: self.header.len() as u64,
            }),
            Some(expected) if (self.payload.len() as u64) < expected => {
                Err(ProtocolError::IncompleteTransfer {
                    expected,
                    received: self.payload.len() as u64,
                })
            }
            Some(_) => Ok(self.payload.freeze()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_takes_priority_over_plain_text() {
        let decoded = decode(b"ARCHIVO:report.pdf");
        assert_eq!(
            decoded,
            Inbound::Tagged {
                tag: Tag::File,
                payload: b"report.pdf".to_vec(),
            }
        );

        let decoded = decode(b"DESCARGAR_ARCHIVO:a:b.txt");
        assert_eq!(
            decoded,
            Inbound::Tagged {
                tag: Tag::Download,
                payload: b"a:b.txt".to_vec(),
            }
        );
    }

    #[test]
    fn chat_lines_with_colons_are_plain_text() {
        assert_eq!(
            decode(b"alice: see you at 10:30"),
            Inbound::PlainText("alice: see you at 10:30".to_owned())
        );
        assert_eq!(
            decode(b"archivo:lowercase"),
            Inbound::PlainText("archivo:lowercase".to_owned())
        );
    }

    #[test]
    fn ten_digits_decode_as_header() {
        assert_eq!(decode(b"0000000042"), Inbound::LengthPrefixedHeader(42));
        assert_eq!(
            decode(b"000000042"),
            Inbound::PlainText("000000042".to_owned())
        );
    }

    #[test]
    fn unknown_tag_is_reported_by_parse() {
        let err = "FOO".parse::<Tag>().unwrap_err();
        assert_eq!(err, ProtocolError::UnknownTag("FOO".to_owned()));
        assert_eq!("CREDENTIALS".parse::<Tag>().unwrap(), Tag::Credentials);
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let bad: [&[u8]; 7] = [
            b"",
            b"12345",
            b"00000000001",
            b"00000000x1",
            b"        12",
            b"-000000001",
            b"+000000001",
        ];
        for header in bad {
            assert!(
                matches!(
                    parse_length_header(header),
                    Err(ProtocolError::MalformedLength(_))
                ),
                "header {header:?} should be malformed"
            );
        }
        assert_eq!(parse_length_header(b"0000001024").unwrap(), 1024);
        assert_eq!(parse_length_header(b"9999999999").unwrap(), MAX_DECLARED_LENGTH);
    }

    #[test]
    fn header_encoding_is_zero_padded() {
        assert_eq!(&encode_length_header(2).unwrap(), b"0000000002");
        assert!(encode_length_header(MAX_DECLARED_LENGTH + 1).is_err());
    }

    #[test]
    fn commands_encode_to_exact_bytes() {
        assert_eq!(
            encode_command(&Command::UserName("alice".to_owned())).unwrap(),
            b"alice"
        );
        assert_eq!(
            encode_command(&Command::AnnounceFile("x.txt".to_owned())).unwrap(),
            b"ARCHIVO:x.txt"
        );
        assert_eq!(encode_command(&Command::ListFiles).unwrap(), b"LISTA_ARCHIVOS");
        assert_eq!(
            encode_command(&Command::Download("x.txt".to_owned())).unwrap(),
            b"DESCARGAR_ARCHIVO:x.txt"
        );

        let credentials = Command::Credentials(Credentials {
            email: "a@b.c".to_owned(),
            password: "pw".to_owned(),
        });
        let encoded = String::from_utf8(encode_command(&credentials).unwrap()).unwrap();
        assert_eq!(encoded, r#"CREDENTIALS:{"email":"a@b.c","password":"pw"}"#);
    }

    #[test]
    fn decoder_stops_at_block_end() {
        let mut decoder = LengthPrefixedDecoder::new();
        let input = b"0000000005helloTRAILING";
        assert_eq!(decoder.feed(&input[..3]).unwrap(), 3);
        assert_eq!(decoder.expected(), None);
        let used = decoder.feed(&input[3..]).unwrap();
        assert_eq!(used, 12);
        assert!(decoder.is_complete());
        assert_eq!(decoder.finish().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn truncated_block_is_incomplete() {
        let mut decoder = LengthPrefixedDecoder::new();
        decoder.feed(b"0000000010abc").unwrap();
        assert_eq!(
            decoder.finish().unwrap_err(),
            ProtocolError::IncompleteTransfer {
                expected: 10,
                received: 3,
            }
        );

        let mut decoder = LengthPrefixedDecoder::new();
        decoder.feed(b"00").unwrap();
        assert!(matches!(
            decoder.finish(),
            Err(ProtocolError::IncompleteTransfer { .. })
        ));
    }

    #[test]
    fn decoder_rejects_non_numeric_header() {
        let mut decoder = LengthPrefixedDecoder::new();
        let err = decoder.feed(b"[\"a.txt\"]xx").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedLength(_)));
    }

    #[test]
    fn empty_listing_block() {
        let mut decoder = LengthPrefixedDecoder::new();
        decoder.feed(b"0000000002[]").unwrap();
        let payload = decoder.finish().unwrap();
        assert!(decode_file_listing(&payload).unwrap().is_empty());

        let names = vec!["a.txt".to_owned(), "b c.png".to_owned()];
        let encoded = encode_file_listing(&names).unwrap();
        assert_eq!(decode_file_listing(&encoded[LENGTH_HEADER_BYTES..]).unwrap(), names);
    }

    #[test]
    fn announcement_split_keeps_stream_bytes() {
        let (name, rest) = split_announcement(b"notes.txt0000000004abcd");
        assert_eq!(name, "notes.txt");
        assert_eq!(rest, b"0000000004abcd");

        let (name, rest) = split_announcement(b"photo.png");
        assert_eq!(name, "photo.png");
        assert!(rest.is_empty());
    }

    #[test]
    fn announcement_split_skips_digit_runs_inside_the_name() {
        let (name, rest) = split_announcement(b"IMG_20240101123456.jpg");
        assert_eq!(name, "IMG_20240101123456.jpg");
        assert!(rest.is_empty());

        let (name, rest) = split_announcement(b"IMG_20240101123456.jpg0000000005hello");
        assert_eq!(name, "IMG_20240101123456.jpg");
        assert_eq!(rest, b"0000000005hello");

        let (name, rest) = split_announcement(b"invoice_1234567890.pdf0000000002ok");
        assert_eq!(name, "invoice_1234567890.pdf");
        assert_eq!(rest, b"0000000002ok");
    }

    #[test]
    fn announcement_split_handles_digit_extensions_and_bare_names() {
        let (name, rest) = split_announcement(b"clip.mp40000000003abc");
        assert_eq!(name, "clip.mp4");
        assert_eq!(rest, b"0000000003abc");

        let (name, rest) = split_announcement(b"notes0000000004abcd");
        assert_eq!(name, "notes");
        assert_eq!(rest, b"0000000004abcd");
    }

    #[test]
    fn sender_split_and_format() {
        assert_eq!(split_sender("bob: hi: there"), Some(("bob", "hi: there")));
        assert_eq!(split_sender("no separator"), None);
        assert_eq!(format_chat_line("bob", "hi"), "bob: hi");
    }

    #[test]
    fn login_response_accepts_only_received_and_resp_one() {
        let ok: LoginResponse =
            serde_json::from_str(r#"{"status":"received","Resp":1,"Mens":"welcome"}"#).unwrap();
        assert!(ok.accepted());
        assert_eq!(ok.message, "welcome");

        let denied: LoginResponse =
            serde_json::from_str(r#"{"status":"received","Resp":0,"Mens":"bad password"}"#)
                .unwrap();
        assert!(!denied.accepted());

        let odd: LoginResponse = serde_json::from_str(r#"{"status":"error","Resp":1}"#).unwrap();
        assert!(!odd.accepted());
    }

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = Credentials {
            email: "a@b.c".to_owned(),
            password: "hunter2".to_owned(),
        };
        assert!(!format!("{credentials:?}").contains("hunter2"));
    }
}
