use blake2b_simd::Params;

/// 32-byte hash. Equality and ordering are lexicographic on the raw bytes.
pub type Hash = [u8; 32];

/// Reserved sentinel; never a valid digest of real data.
pub const ZERO_HASH: Hash = [0u8; 32];

pub fn blake2b(data: &[u8]) -> Hash {
    let digest = Params::new().hash_length(32).hash(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

pub fn blake2b_pair(prefix: &[u8], data: &[u8]) -> Hash {
    let mut state = Params::new().hash_length(32).to_state();
    state.update(prefix);
    state.update(data);
    let digest = state.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

pub fn hash_to_hex(hash: &Hash) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}

pub fn short_hash(hash: &Hash) -> String {
    let hex = hash_to_hex(hash);
    hex[..12].to_string()
}

pub fn hash_from_hex(raw: &str) -> Option<Hash> {
    let raw = raw.trim();
    if raw.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in raw.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let hash = blake2b(b"mwd");
        let hex = hash_to_hex(&hash);
        assert_eq!(hash_from_hex(&hex), Some(hash));
        assert_eq!(hash_from_hex("zz"), None);
    }

    #[test]
    fn blake2b_pair_matches_concat() {
        assert_eq!(blake2b_pair(b"ab", b"cd"), blake2b(b"abcd"));
    }
}
