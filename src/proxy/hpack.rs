//! Minimal HPACK (RFC 7541) field decoding for the gRPC handler
//!
//! One decoder instance per connection direction; the dynamic table is the
//! whole point of keeping it alive across frames. Huffman-coded string
//! literals are rejected: the recorder surfaces them as protocol errors
//! rather than silently corrupting header values, and the encoder side never
//! emits them.

use crate::error::{Result, RetraceError};
use std::collections::VecDeque;

/// RFC 7541 Appendix A static table
const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

const DEFAULT_TABLE_SIZE: usize = 4096;
const MAX_TABLE_SIZE: usize = 65536;

/// Stateful HPACK decoder for one connection direction
pub struct HpackDecoder {
    dynamic: VecDeque<(String, String)>,
    max_size: usize,
    current_size: usize,
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self {
            dynamic: VecDeque::new(),
            max_size: DEFAULT_TABLE_SIZE,
            current_size: 0,
        }
    }

    /// Decode one complete header block into name/value pairs
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<(String, String)>> {
        let mut headers = Vec::new();
        let mut pos = 0;

        while pos < block.len() {
            let byte = block[pos];
            if byte & 0x80 != 0 {
                // indexed field
                let (index, consumed) = decode_integer(&block[pos..], 7)?;
                pos += consumed;
                let (name, value) = self.lookup(index)?;
                headers.push((name, value));
            } else if byte & 0x40 != 0 {
                // literal with incremental indexing
                let (name, value, consumed) = self.decode_literal(&block[pos..], 6)?;
                pos += consumed;
                self.insert(name.clone(), value.clone());
                headers.push((name, value));
            } else if byte & 0x20 != 0 {
                // dynamic table size update
                let (size, consumed) = decode_integer(&block[pos..], 5)?;
                pos += consumed;
                if size as usize > MAX_TABLE_SIZE {
                    return Err(RetraceError::Protocol(format!(
                        "HPACK table size update {} exceeds limit",
                        size
                    )));
                }
                self.max_size = size as usize;
                self.evict();
            } else {
                // literal without indexing (0x00) or never indexed (0x10)
                let (name, value, consumed) = self.decode_literal(&block[pos..], 4)?;
                pos += consumed;
                headers.push((name, value));
            }
        }

        Ok(headers)
    }

    fn decode_literal(
        &self,
        buf: &[u8],
        prefix_bits: u8,
    ) -> Result<(String, String, usize)> {
        let (name_index, mut pos) = decode_integer(buf, prefix_bits)?;
        let name = if name_index == 0 {
            let (name, consumed) = decode_string(&buf[pos..])?;
            pos += consumed;
            name
        } else {
            self.lookup(name_index)?.0
        };
        let (value, consumed) = decode_string(&buf[pos..])?;
        pos += consumed;
        Ok((name, value, pos))
    }

    fn lookup(&self, index: u64) -> Result<(String, String)> {
        if index == 0 {
            return Err(RetraceError::Protocol("HPACK index 0".to_string()));
        }
        let index = index as usize;
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok((name.to_string(), value.to_string()));
        }
        self.dynamic
            .get(index - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or_else(|| {
                RetraceError::Protocol(format!("HPACK index {} beyond table", index))
            })
    }

    fn insert(&mut self, name: String, value: String) {
        self.current_size += entry_size(&name, &value);
        self.dynamic.push_front((name, value));
        self.evict();
    }

    fn evict(&mut self) {
        while self.current_size > self.max_size {
            match self.dynamic.pop_back() {
                Some((name, value)) => self.current_size -= entry_size(&name, &value),
                None => {
                    self.current_size = 0;
                    break;
                }
            }
        }
    }
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_size(name: &str, value: &str) -> usize {
    name.len() + value.len() + 32
}

/// Prefixed integer per RFC 7541 §5.1; returns (value, bytes consumed)
fn decode_integer(buf: &[u8], prefix_bits: u8) -> Result<(u64, usize)> {
    if buf.is_empty() {
        return Err(RetraceError::Protocol("empty HPACK integer".to_string()));
    }
    let mask = (1u16 << prefix_bits) as u64 - 1;
    let mut value = (buf[0] as u64) & mask;
    if value < mask {
        return Ok((value, 1));
    }
    let mut pos = 1;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(pos).ok_or_else(|| {
            RetraceError::Protocol("truncated HPACK integer".to_string())
        })?;
        value = value
            .checked_add(((byte & 0x7f) as u64) << shift)
            .ok_or_else(|| RetraceError::Protocol("HPACK integer overflow".to_string()))?;
        pos += 1;
        if byte & 0x80 == 0 {
            return Ok((value, pos));
        }
        shift += 7;
        if shift > 56 {
            return Err(RetraceError::Protocol("HPACK integer overflow".to_string()));
        }
    }
}

/// String literal per RFC 7541 §5.2; returns (string, bytes consumed)
fn decode_string(buf: &[u8]) -> Result<(String, usize)> {
    if buf.is_empty() {
        return Err(RetraceError::Protocol("empty HPACK string".to_string()));
    }
    let huffman = buf[0] & 0x80 != 0;
    let (len, mut pos) = decode_integer(buf, 7)?;
    let len = len as usize;
    if huffman {
        return Err(RetraceError::Protocol(
            "huffman-coded HPACK string is not supported".to_string(),
        ));
    }
    let end = pos + len;
    let bytes = buf.get(pos..end).ok_or_else(|| {
        RetraceError::Protocol("truncated HPACK string".to_string())
    })?;
    pos = end;
    let s = String::from_utf8(bytes.to_vec())
        .map_err(|_| RetraceError::Protocol("non-utf8 HPACK string".to_string()))?;
    Ok((s, pos))
}

fn encode_integer(out: &mut Vec<u8>, value: usize, prefix_bits: u8, flags: u8) {
    let mask = (1u16 << prefix_bits) as usize - 1;
    if value < mask {
        out.push(flags | value as u8);
        return;
    }
    out.push(flags | mask as u8);
    let mut rest = value - mask;
    while rest >= 128 {
        out.push((rest as u8 & 0x7f) | 0x80);
        rest >>= 7;
    }
    out.push(rest as u8);
}

fn encode_string(out: &mut Vec<u8>, s: &str) {
    encode_integer(out, s.len(), 7, 0x00);
    out.extend_from_slice(s.as_bytes());
}

/// Encode headers as literal-without-indexing fields with raw strings.
/// Stateless by construction, so replayed responses never depend on what a
/// client's decoder has already seen.
pub fn encode_literal_block(headers: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in headers {
        out.push(0x00);
        encode_string(&mut out, name);
        encode_string(&mut out, value);
    }
    out
}
