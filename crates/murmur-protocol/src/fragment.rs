//! Splitting oversized wire messages into `?OTR|...` fragments and
//! reassembling them on the receiving side.
//!
//! Fragment format: `?OTR|<sender:08x>|<receiver:08x>,<k:05>,<n:05>,<piece>,`

use crate::error::ProtocolError;
use crate::types::InstanceTag;

/// Prefix shared by every fragment.
pub const FRAGMENT_PREFIX: &str = "?OTR|";

/// Bytes of framing around each piece: prefix, two tags, two counters,
/// and the four separators.
pub const FRAGMENT_OVERHEAD: usize = FRAGMENT_PREFIX.len() + 8 + 1 + 8 + 1 + 5 + 1 + 5 + 1 + 1;

/// Largest fragment count the five-digit counters can express.
pub const MAX_FRAGMENTS: usize = 65_535;

/// One parsed fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub sender_instance: InstanceTag,
    pub receiver_instance: InstanceTag,
    /// 1-based position of this piece.
    pub index: u16,
    pub total: u16,
    pub piece: &'a str,
}

pub fn is_fragment(text: &str) -> bool {
    text.starts_with(FRAGMENT_PREFIX)
}

/// Split `message` into fragments no longer than `max_size` bytes each.
///
/// A message that already fits is returned as a single unframed element.
pub fn split(
    message: &str,
    max_size: usize,
    sender_instance: InstanceTag,
    receiver_instance: InstanceTag,
) -> Result<Vec<String>, ProtocolError> {
    if message.len() <= max_size {
        return Ok(vec![message.to_string()]);
    }
    if max_size <= FRAGMENT_OVERHEAD {
        return Err(ProtocolError::FragmentSizeTooSmall(max_size));
    }

    let pieces = split_on_char_boundaries(message, max_size - FRAGMENT_OVERHEAD);
    if pieces.len() > MAX_FRAGMENTS {
        return Err(ProtocolError::TooManyFragments(pieces.len()));
    }

    let total = pieces.len();
    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            format!(
                "{FRAGMENT_PREFIX}{sender_instance:08x}|{receiver_instance:08x},{:05},{total:05},{piece},",
                i + 1
            )
        })
        .collect())
}

fn split_on_char_boundaries(message: &str, piece_len: usize) -> Vec<&str> {
    let mut pieces = Vec::with_capacity(message.len() / piece_len + 1);
    let mut rest = message;
    while !rest.is_empty() {
        let mut end = piece_len.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        // A single character wider than the piece budget still has to go somewhere.
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (piece, tail) = rest.split_at(end);
        pieces.push(piece);
        rest = tail;
    }
    pieces
}

/// Parse one fragment.
pub fn parse(text: &str) -> Result<Fragment<'_>, ProtocolError> {
    let malformed = || ProtocolError::MalformedFragment(text.chars().take(40).collect());

    let body = text
        .strip_prefix(FRAGMENT_PREFIX)
        .and_then(|b| b.strip_suffix(','))
        .ok_or_else(malformed)?;

    let (sender, rest) = body.split_once('|').ok_or_else(malformed)?;
    let mut fields = rest.splitn(4, ',');
    let receiver = fields.next().ok_or_else(malformed)?;
    let index = fields.next().ok_or_else(malformed)?;
    let total = fields.next().ok_or_else(malformed)?;
    let piece = fields.next().ok_or_else(malformed)?;

    let sender_instance = InstanceTag::from_str_radix(sender, 16).map_err(|_| malformed())?;
    let receiver_instance = InstanceTag::from_str_radix(receiver, 16).map_err(|_| malformed())?;
    let index: u16 = index.parse().map_err(|_| malformed())?;
    let total: u16 = total.parse().map_err(|_| malformed())?;

    if index == 0 || total == 0 || index > total {
        return Err(malformed());
    }

    Ok(Fragment {
        sender_instance,
        receiver_instance,
        index,
        total,
        piece,
    })
}

/// Reassembles consecutive fragments from one sender.
///
/// Out-of-order or foreign pieces discard the partial message, as does a
/// new first piece.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    buffer: String,
    total: u16,
    received: u16,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns the full message once the last piece arrives.
    pub fn push(&mut self, fragment: &Fragment<'_>) -> Option<String> {
        if fragment.index == 1 {
            self.buffer.clear();
            self.buffer.push_str(fragment.piece);
            self.total = fragment.total;
            self.received = 1;
        } else if fragment.total == self.total && fragment.index == self.received + 1 {
            self.buffer.push_str(fragment.piece);
            self.received = fragment.index;
        } else {
            self.reset();
            return None;
        }

        if self.received == self.total {
            self.total = 0;
            self.received = 0;
            return Some(std::mem::take(&mut self.buffer));
        }
        None
    }

    pub fn is_pending(&self) -> bool {
        self.received > 0
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.total = 0;
        self.received = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_not_fragmented() {
        let pieces = split("hello", 100, 0x100, 0x200).unwrap();
        assert_eq!(pieces, vec!["hello".to_string()]);
        assert!(!is_fragment(&pieces[0]));
    }

    #[test]
    fn split_and_reassemble() {
        let message = "?OTR:".to_string() + &"A".repeat(200) + ".";
        let pieces = split(&message, 60, 0x1234, 0x5678).unwrap();
        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|p| p.len() <= 60));

        let mut assembler = FragmentAssembler::new();
        let mut result = None;
        for (i, text) in pieces.iter().enumerate() {
            let frag = parse(text).unwrap();
            assert_eq!(frag.sender_instance, 0x1234);
            assert_eq!(frag.receiver_instance, 0x5678);
            assert_eq!(usize::from(frag.index), i + 1);
            result = assembler.push(&frag);
        }
        assert_eq!(result.as_deref(), Some(message.as_str()));
        assert!(!assembler.is_pending());
    }

    #[test]
    fn multibyte_text_splits_on_boundaries() {
        let message = "é".repeat(40);
        let pieces = split(&message, FRAGMENT_OVERHEAD + 5, 0x100, 0x100).unwrap();
        let mut assembler = FragmentAssembler::new();
        let mut out = None;
        for p in &pieces {
            out = assembler.push(&parse(p).unwrap());
        }
        assert_eq!(out.unwrap(), message);
    }

    #[test]
    fn out_of_order_fragment_discards() {
        let message = "x".repeat(120);
        let pieces = split(&message, 60, 0x100, 0x100).unwrap();
        assert!(pieces.len() >= 3);

        let mut assembler = FragmentAssembler::new();
        assert!(assembler.push(&parse(&pieces[0]).unwrap()).is_none());
        assert!(assembler.is_pending());
        assert!(assembler.push(&parse(&pieces[2]).unwrap()).is_none());
        assert!(!assembler.is_pending());
    }

    #[test]
    fn size_too_small() {
        let err = split(&"x".repeat(100), FRAGMENT_OVERHEAD, 0x100, 0x100).unwrap_err();
        assert!(matches!(err, ProtocolError::FragmentSizeTooSmall(_)));
    }

    #[test]
    fn malformed_fragments_rejected() {
        assert!(parse("?OTR|zzzz|00000100,00001,00001,x,").is_err());
        assert!(parse("?OTR|00000100|00000100,00002,00001,x,").is_err());
        assert!(parse("?OTR|00000100|00000100,00001,00001,x").is_err());
    }

    #[test]
    fn piece_may_contain_commas() {
        let frag = parse("?OTR|00000100|00000200,00001,00001,a,b,").unwrap();
        assert_eq!(frag.piece, "a,b");
    }
}
