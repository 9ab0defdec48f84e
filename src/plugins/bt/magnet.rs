use crate::core::error::EngineError;
use sanitize_filename::sanitize;
use url::Url;

/// A parsed magnet link. `info_hash` is the lowercase identity used for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub uri: String,
    pub info_hash: String,
    pub display_name: String,
    pub trackers: Vec<String>,
}

fn parse_btih(magnet: &Url) -> Option<String> {
    magnet
        .query_pairs()
        .filter(|(k, _)| k == "xt")
        .find_map(|(_, v)| v.strip_prefix("urn:btih:").map(str::to_string))
}

fn parse_trackers(magnet: &Url) -> Vec<String> {
    magnet
        .query_pairs()
        .filter(|(k, _)| k == "tr")
        .map(|(_, v)| v.to_string())
        .collect()
}

fn is_hex_hash(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

// v1 info hashes also appear base32-encoded (32 chars, RFC 4648 alphabet, no padding).
fn base32_to_hex(s: &str) -> Option<String> {
    if s.len() != 32 {
        return None;
    }
    let mut out = Vec::with_capacity(20);
    let (mut buf, mut bits) = (0u64, 0u32);
    for c in s.bytes() {
        let v = match c.to_ascii_uppercase() {
            c @ b'A'..=b'Z' => c - b'A',
            c @ b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        buf = (buf << 5) | u64::from(v);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buf >> bits) as u8);
            buf &= (1 << bits) - 1;
        }
    }
    Some(hex::encode(out))
}

/// Normalizes a btih value to lowercase 40-char hex.
fn normalize_btih(s: &str) -> Option<String> {
    if is_hex_hash(s) {
        Some(s.to_ascii_lowercase())
    } else {
        base32_to_hex(s)
    }
}

impl MagnetLink {
    /// Accepts `magnet:?xt=urn:btih:...` URIs or a bare 40-char hex info hash.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let raw = raw.trim();
        let invalid = || EngineError::InvalidResourceIdentifier(raw.to_string());

        if is_hex_hash(raw) {
            let info_hash = raw.to_ascii_lowercase();
            return Ok(Self {
                uri: format!("magnet:?xt=urn:btih:{}", info_hash),
                display_name: fallback_name(&info_hash),
                info_hash,
                trackers: vec![],
            });
        }

        let u = Url::parse(raw).map_err(|_| invalid())?;
        if u.scheme() != "magnet" {
            return Err(invalid());
        }
        let info_hash = parse_btih(&u).and_then(|h| normalize_btih(&h)).ok_or_else(invalid)?;

        let display_name = u
            .query_pairs()
            .find(|(k, _)| k == "dn")
            .map(|(_, v)| sanitize(v))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| fallback_name(&info_hash));

        Ok(Self {
            uri: raw.to_string(),
            trackers: parse_trackers(&u),
            info_hash,
            display_name,
        })
    }
}

fn fallback_name(info_hash: &str) -> String {
    format!("torrent-{}", &info_hash[..info_hash.len().min(12)])
}
