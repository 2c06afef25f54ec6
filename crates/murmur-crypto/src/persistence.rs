//! On-disk formats of the key store and the instance tag store.
//!
//! Key store: `[MKEY magic(4)] [version(1)] [postcard Vec<KeyRecord>]`,
//! rewritten whole on every change.
//!
//! Instance tag store: UTF-8 text, one `account\tprotocol\t%08x` line per tag.

use murmur_protocol::types::{InstanceTag, MIN_VALID_INSTAG};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

const MAGIC: &[u8; 4] = b"MKEY"; // "Murmur KEYs"
const VERSION: u8 = 0x01;
const HEADER_LEN: usize = 4 + 1;

/// One stored private key.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyRecord {
    pub account: String,
    pub protocol: String,
    /// PKCS#8 document of the Ed25519 key.
    pub pkcs8: Vec<u8>,
}

/// Serialize key records to a key store file image.
pub fn encode_key_store(records: &[KeyRecord]) -> anyhow::Result<Vec<u8>> {
    let payload = postcard::to_allocvec(records)
        .map_err(|e| anyhow::anyhow!("serialization failed: {e}"))?;

    let mut file_data = Vec::with_capacity(HEADER_LEN + payload.len());
    file_data.extend_from_slice(MAGIC);
    file_data.push(VERSION);
    file_data.extend_from_slice(&payload);
    Ok(file_data)
}

pub fn decode_key_store(file_data: &[u8]) -> anyhow::Result<Vec<KeyRecord>> {
    if file_data.len() < HEADER_LEN {
        anyhow::bail!("file too short");
    }
    if &file_data[0..4] != MAGIC {
        anyhow::bail!("invalid file format (expected MKEY header)");
    }
    if file_data[4] != VERSION {
        anyhow::bail!("unsupported file version");
    }

    let records: Vec<KeyRecord> = postcard::from_bytes(&file_data[HEADER_LEN..])
        .map_err(|e| anyhow::anyhow!("deserialization failed: {e}"))?;
    Ok(records)
}

/// Check if file data starts with a valid MKEY header.
pub fn has_valid_header(file_data: &[u8]) -> bool {
    file_data.len() >= HEADER_LEN && &file_data[0..4] == MAGIC && file_data[4] == VERSION
}

pub fn format_instags<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str, InstanceTag)>,
{
    let mut out = String::new();
    for (account, protocol, tag) in entries {
        out.push_str(&format!("{account}\t{protocol}\t{tag:08x}\n"));
    }
    out
}

/// Parse an instance tag file. Blank lines are skipped; anything else that
/// is not a well-formed entry is an error.
pub fn parse_instags(text: &str) -> anyhow::Result<Vec<(String, String, InstanceTag)>> {
    let mut entries = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let (Some(account), Some(protocol), Some(tag), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            anyhow::bail!("line {}: expected three tab-separated fields", lineno + 1);
        };
        let tag = InstanceTag::from_str_radix(tag.trim(), 16)
            .map_err(|e| anyhow::anyhow!("line {}: bad instance tag: {e}", lineno + 1))?;
        if tag < MIN_VALID_INSTAG {
            anyhow::bail!("line {}: instance tag {tag:#x} is reserved", lineno + 1);
        }
        entries.push((account.to_string(), protocol.to_string(), tag));
    }
    Ok(entries)
}
