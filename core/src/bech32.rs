//! BIP-173 bech32 (npub / nsec 用)

use crate::error::{CoreError, Result};

const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
const GENERATOR: [u32; 5] = [0x3b6a57b2, 0x26508e6d, 0x1ea119fa, 0x3d4233dd, 0x2a1462b3];
const SEPARATOR: char = '1';
const CHECKSUM_LEN: usize = 6;

/// hrp と 8bit データを bech32 文字列にエンコード
pub fn encode(hrp: &str, data: &[u8]) -> Result<String> {
    if hrp.is_empty() || !hrp.bytes().all(|b| (33..=126).contains(&b)) {
        return Err(CoreError::Bech32Error(format!("invalid human-readable part: {:?}", hrp)));
    }
    let hrp = hrp.to_lowercase();

    let words = convert_bits(data, 8, 5, true)?;
    let checksum = create_checksum(&hrp, &words);

    let mut out = String::with_capacity(hrp.len() + 1 + words.len() + CHECKSUM_LEN);
    out.push_str(&hrp);
    out.push(SEPARATOR);
    for w in words.iter().chain(checksum.iter()) {
        out.push(CHARSET[*w as usize] as char);
    }
    Ok(out)
}

/// bech32 文字列を (hrp, 8bit データ) にデコード
///
/// チェックサム不一致、大文字小文字の混在、charset 外の文字はすべてエラー。
pub fn decode(value: &str) -> Result<(String, Vec<u8>)> {
    let has_lower = value.bytes().any(|b| b.is_ascii_lowercase());
    let has_upper = value.bytes().any(|b| b.is_ascii_uppercase());
    if has_lower && has_upper {
        return Err(CoreError::Bech32Error("mixed case".to_string()));
    }
    let value = value.to_lowercase();

    let sep = value
        .rfind(SEPARATOR)
        .ok_or_else(|| CoreError::Bech32Error("missing separator".to_string()))?;
    if sep == 0 || sep + 1 + CHECKSUM_LEN > value.len() {
        return Err(CoreError::Bech32Error("invalid separator position".to_string()));
    }

    let (hrp, rest) = value.split_at(sep);
    if !hrp.bytes().all(|b| (33..=126).contains(&b)) {
        return Err(CoreError::Bech32Error(format!("invalid human-readable part: {:?}", hrp)));
    }

    let mut words = Vec::with_capacity(rest.len() - 1);
    for c in rest[1..].bytes() {
        let pos = CHARSET
            .iter()
            .position(|&x| x == c)
            .ok_or_else(|| CoreError::Bech32Error(format!("invalid character: {:?}", c as char)))?;
        words.push(pos as u8);
    }

    if !verify_checksum(hrp, &words) {
        return Err(CoreError::Bech32Error("checksum mismatch".to_string()));
    }

    words.truncate(words.len() - CHECKSUM_LEN);
    let data = convert_bits(&words, 5, 8, false)?;
    Ok((hrp.to_string(), data))
}

/// ビット幅の詰め替え (8->5 / 5->8)
pub fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Result<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let maxv: u32 = (1 << to) - 1;
    let max_acc: u32 = (1 << (from + to - 1)) - 1;
    let mut ret = Vec::with_capacity(data.len() * from as usize / to as usize + 1);

    for &value in data {
        let v = value as u32;
        if v >> from != 0 {
            return Err(CoreError::Bech32Error(format!("value {} exceeds {} bits", v, from)));
        }
        acc = ((acc << from) | v) & max_acc;
        bits += from;
        while bits >= to {
            bits -= to;
            ret.push(((acc >> bits) & maxv) as u8);
        }
    }

    if pad {
        if bits > 0 {
            ret.push(((acc << (to - bits)) & maxv) as u8);
        }
    } else if bits >= from || ((acc << (to - bits)) & maxv) != 0 {
        return Err(CoreError::Bech32Error("invalid padding".to_string()));
    }

    Ok(ret)
}

fn polymod(values: impl IntoIterator<Item = u8>) -> u32 {
    let mut chk: u32 = 1;
    for v in values {
        let top = chk >> 25;
        // 30bit を超えないよう毎回マスク
        chk = ((chk & 0x01ff_ffff) << 5) ^ v as u32;
        for (i, g) in GENERATOR.iter().enumerate() {
            if (top >> i) & 1 == 1 {
                chk ^= g;
            }
        }
    }
    chk
}

fn hrp_expand(hrp: &str) -> Vec<u8> {
    let bytes = hrp.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() * 2 + 1);
    out.extend(bytes.iter().map(|b| b >> 5));
    out.push(0);
    out.extend(bytes.iter().map(|b| b & 0x1f));
    out
}

fn create_checksum(hrp: &str, words: &[u8]) -> [u8; CHECKSUM_LEN] {
    let values = hrp_expand(hrp)
        .into_iter()
        .chain(words.iter().copied())
        .chain([0u8; CHECKSUM_LEN]);
    let pm = polymod(values) ^ 1;

    let mut out = [0u8; CHECKSUM_LEN];
    for (i, w) in out.iter_mut().enumerate() {
        *w = ((pm >> (5 * (5 - i))) & 0x1f) as u8;
    }
    out
}

fn verify_checksum(hrp: &str, words: &[u8]) -> bool {
    polymod(hrp_expand(hrp).into_iter().chain(words.iter().copied())) == 1
}
