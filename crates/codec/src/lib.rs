//! ## The Hermes Standard (IPC-HERMES-9852)
//!
//! [IPC-HERMES-9852]: https://www.the-hermes-standard.info
//!
//! Hermes is a vendor-neutral machine-to-machine protocol for board
//! handover on electronics-assembly lines. Neighbouring stations keep a
//! persistent TCP connection per lane and exchange self-contained XML
//! documents; a supervisory system uses the same wire format for board
//! tracking, work-order lookup and remote configuration. Every document
//! is wrapped in a `<Hermes Timestamp="...">` envelope holding exactly
//! one message element. Documents are concatenated on the byte stream
//! with no length prefix, so the only framing signal is the closing
//! envelope tag.
//!
//! This crate owns the data model of the message set, the envelope
//! codec and the incremental stream splitter. It knows nothing about
//! sessions or state machines.

pub mod message;

mod decode;
mod encode;

use self::message::Message;

use std::{str::Utf8Error, string::FromUtf8Error};

use bytes::{Bytes, BytesMut};

/// Closing tag of the Hermes envelope, the sole frame terminator on the
/// wire.
pub const TERMINATOR: &[u8] = b"</Hermes>";

/// Upper bound for a single document. A peer exceeding it is not
/// speaking Hermes and gets disconnected instead of growing the buffer
/// without limit.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug)]
pub enum Error {
    /// The document is not well-formed XML, not UTF-8, or not wrapped
    /// in a Hermes envelope.
    Malformed(String),
    /// Well-formed envelope around a message element this schema does
    /// not define.
    UnknownMessage(String),
    /// A required attribute is absent or an attribute value does not
    /// parse to its schema type.
    InvalidAttribute {
        message: &'static str,
        attribute: &'static str,
    },
    /// The stream grew past [`MAX_MESSAGE_SIZE`] without a terminator.
    Oversize(usize),
    Xml(quick_xml::Error),
    Io(std::io::Error),
    Utf8(Utf8Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(it) => write!(f, "malformed document: {it}"),
            Self::UnknownMessage(it) => write!(f, "unknown message: {it}"),
            Self::InvalidAttribute { message, attribute } => {
                write!(f, "invalid attribute: message={message}, attribute={attribute}")
            }
            Self::Oversize(it) => write!(f, "document exceeds size limit: size={it}"),
            Self::Xml(it) => write!(f, "{it}"),
            Self::Io(it) => write!(f, "{it}"),
            Self::Utf8(it) => write!(f, "{it}"),
        }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(value: quick_xml::Error) -> Self {
        Self::Xml(value)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8(value)
    }
}

impl From<FromUtf8Error> for Error {
    fn from(value: FromUtf8Error) -> Self {
        Self::Utf8(value.utf8_error())
    }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(value: quick_xml::events::attributes::AttrError) -> Self {
        Self::Malformed(value.to_string())
    }
}

/// One complete document popped off the stream: the typed message plus
/// the raw bytes it was parsed from, kept around for tracing.
#[derive(Debug, Clone)]
pub struct Frame {
    pub message: Message,
    pub raw: Bytes,
}

/// Incremental frame splitter over a TCP byte stream.
///
/// Chunks may cut a document anywhere, including inside tags and
/// attribute values, and may carry several documents at once. The
/// decoder accumulates bytes and yields one [`Frame`] per completed
/// envelope.
///
/// ```
/// use hermes_codec::{Decoder, message::Message};
///
/// let doc = b"<Hermes Timestamp=\"2025-01-02T10:11:12.345+01:00\"><RevokeBoardAvailable/></Hermes>";
///
/// let mut decoder = Decoder::default();
/// for byte in doc.iter() {
///     decoder.extend(std::slice::from_ref(byte));
/// }
///
/// let frame = decoder.try_next().unwrap().unwrap();
/// assert!(matches!(frame.message, Message::RevokeBoardAvailable));
/// assert!(decoder.try_next().unwrap().is_none());
/// ```
#[derive(Default)]
pub struct Decoder {
    buffer: BytesMut,
    // Offset up to which the buffer has already been scanned for the
    // terminator, so repeated small chunks do not rescan from zero.
    scanned: usize,
}

impl Decoder {
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Pops the next complete document, if the buffer holds one.
    pub fn try_next(&mut self) -> Result<Option<Frame>, Error> {
        let Some(end) = self.find_terminator() else {
            if self.buffer.len() > MAX_MESSAGE_SIZE {
                return Err(Error::Oversize(self.buffer.len()));
            }

            return Ok(None);
        };

        let raw = self.buffer.split_to(end).freeze();
        self.scanned = 0;

        let document = std::str::from_utf8(&raw)?;
        let message = decode::document(document)?;

        Ok(Some(Frame { message, raw }))
    }

    fn find_terminator(&mut self) -> Option<usize> {
        let haystack = &self.buffer[..];
        let from = self.scanned.saturating_sub(TERMINATOR.len() - 1);

        if let Some(at) = haystack[from..]
            .windows(TERMINATOR.len())
            .position(|it| it == TERMINATOR)
        {
            return Some(from + at + TERMINATOR.len());
        }

        self.scanned = haystack.len();
        None
    }
}

/// Renders a message into a complete envelope document, stamped with
/// the current local time.
pub fn serialize(message: &Message) -> Result<String, Error> {
    encode::document(message, &timestamp())
}

/// Renders with a caller-supplied timestamp. Round-trip tests and
/// replay tooling need the output to be deterministic.
pub fn serialize_with_timestamp(message: &Message, timestamp: &str) -> Result<String, Error> {
    encode::document(message, timestamp)
}

/// ISO-8601 with the local UTC offset, millisecond precision, as the
/// standard requires for envelope timestamps.
pub fn timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        .to_string()
}
