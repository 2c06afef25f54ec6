use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::ProtocolError;
use crate::messages::Envelope;
use crate::types::PROTOCOL_VERSION;

/// Prefix of a base64-encoded binary message.
pub const ENCODED_PREFIX: &str = "?OTR:";
/// Terminator of a base64-encoded binary message.
pub const ENCODED_SUFFIX: char = '.';
/// Prefix of an error message sent by a peer.
pub const ERROR_PREFIX: &str = "?OTR Error:";
/// Prefix of a query message announcing the versions a peer speaks.
pub const QUERY_PREFIX: &str = "?OTRv";

/// Marks a plaintext message as coming from a protocol-capable client.
pub const WHITESPACE_TAG_BASE: &str = " \t  \t\t\t\t \t \t \t  ";
const WHITESPACE_TAG_V1: &str = " \t \t  \t ";
const WHITESPACE_TAG_V2: &str = "  \t\t  \t ";
const WHITESPACE_TAG_V3: &str = "  \t\t  \t\t";

/// A received message, classified by its textual framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// Ordinary text with no protocol markers.
    Plaintext(String),
    /// Text that carried a whitespace tag, with the tag removed.
    TaggedPlaintext { text: String, versions: Vec<u8> },
    /// A request to start a private conversation.
    Query { versions: Vec<u8> },
    /// A human-readable error reported by the peer.
    Error(String),
    /// A binary protocol message.
    Encoded(Envelope),
}

impl Incoming {
    /// True if the peer announced a version this crate speaks.
    pub fn offers_current_version(&self) -> bool {
        match self {
            Self::TaggedPlaintext { versions, .. } | Self::Query { versions } => {
                versions.contains(&PROTOCOL_VERSION)
            }
            _ => false,
        }
    }
}

/// Encode an envelope as `?OTR:<base64(postcard)>.`.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, ProtocolError> {
    let payload = postcard::to_allocvec(envelope)?;
    let mut out = String::with_capacity(ENCODED_PREFIX.len() + payload.len() * 4 / 3 + 4);
    out.push_str(ENCODED_PREFIX);
    out.push_str(&STANDARD.encode(payload));
    out.push(ENCODED_SUFFIX);
    Ok(out)
}

/// Decode the envelope carried by an `?OTR:...` message.
pub fn decode_envelope(text: &str) -> Result<Envelope, ProtocolError> {
    let start = text.find(ENCODED_PREFIX).ok_or(ProtocolError::NotEncoded)?;
    let rest = &text[start + ENCODED_PREFIX.len()..];
    let end = rest.find(ENCODED_SUFFIX).ok_or(ProtocolError::NotEncoded)?;
    let payload = STANDARD.decode(&rest[..end])?;
    let envelope: Envelope = postcard::from_bytes(&payload)?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(envelope.version));
    }
    Ok(envelope)
}

/// Build the query message `account` sends to request a private conversation.
pub fn query_message(account: &str) -> String {
    format!(
        "{QUERY_PREFIX}{PROTOCOL_VERSION}?\n{account} has requested an Off-the-Record \
         private conversation. However, you do not have a plugin to support that."
    )
}

/// Build an error message carrying `text` to the peer.
pub fn error_message(text: &str) -> String {
    format!("{ERROR_PREFIX} {text}")
}

/// Append the whitespace tag advertising the current version.
pub fn add_whitespace_tag(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 24);
    out.push_str(text);
    out.push_str(WHITESPACE_TAG_BASE);
    out.push_str(WHITESPACE_TAG_V3);
    out
}

/// Classify a complete (already reassembled) incoming message.
///
/// Returns `Err` only for a message framed as encoded whose payload cannot
/// be decoded.
pub fn classify(text: &str) -> Result<Incoming, ProtocolError> {
    if text.contains(ENCODED_PREFIX) {
        return decode_envelope(text).map(Incoming::Encoded);
    }

    if let Some(start) = text.find(ERROR_PREFIX) {
        let detail = text[start + ERROR_PREFIX.len()..].trim_start();
        return Ok(Incoming::Error(detail.to_string()));
    }

    if let Some(versions) = parse_query(text) {
        return Ok(Incoming::Query { versions });
    }

    if let Some((stripped, versions)) = strip_whitespace_tag(text) {
        return Ok(Incoming::TaggedPlaintext {
            text: stripped,
            versions,
        });
    }

    Ok(Incoming::Plaintext(text.to_string()))
}

/// Parse `?OTRv<digits>?` or the version-1 form `?OTR?`.
fn parse_query(text: &str) -> Option<Vec<u8>> {
    if text.contains("?OTR?") {
        let mut versions = vec![1];
        if let Some(more) = text.find("?OTR?v") {
            versions.extend(query_digits(&text[more + "?OTR?v".len()..]));
        }
        return Some(versions);
    }

    let start = text.find(QUERY_PREFIX)?;
    let rest = &text[start + QUERY_PREFIX.len()..];
    let end = rest.find('?')?;
    if !rest[..end].bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(query_digits(&rest[..end]))
}

fn query_digits(s: &str) -> Vec<u8> {
    s.bytes()
        .take_while(u8::is_ascii_digit)
        .map(|b| b - b'0')
        .collect()
}

fn strip_whitespace_tag(text: &str) -> Option<(String, Vec<u8>)> {
    let start = text.find(WHITESPACE_TAG_BASE)?;
    let mut rest = &text[start + WHITESPACE_TAG_BASE.len()..];
    let mut versions = Vec::new();

    while let Some(group) = rest.get(..8) {
        let version = match group {
            WHITESPACE_TAG_V1 => 1,
            WHITESPACE_TAG_V2 => 2,
            WHITESPACE_TAG_V3 => 3,
            _ => break,
        };
        versions.push(version);
        rest = &rest[8..];
    }

    let mut stripped = String::with_capacity(start + rest.len());
    stripped.push_str(&text[..start]);
    stripped.push_str(rest);
    Some((stripped, versions))
}
