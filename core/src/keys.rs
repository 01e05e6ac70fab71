//! 鍵・ID の型

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::bech32;
use crate::crypto;
use crate::error::{CoreError, Result};

pub const HRP_PUBLIC_KEY: &str = "npub";
pub const HRP_SECRET_KEY: &str = "nsec";

fn decode_fixed<const N: usize>(hex_str: &str, what: &str) -> Result<[u8; N]> {
    if hex_str.len() != N * 2 {
        return Err(CoreError::InvalidKeyFormat(format!(
            "{} must be {} hex chars, got {}",
            what,
            N * 2,
            hex_str.len()
        )));
    }
    let mut out = [0u8; N];
    hex::decode_to_slice(hex_str, &mut out)
        .map_err(|e| CoreError::InvalidKeyFormat(format!("{}: {}", what, e)))?;
    Ok(out)
}

fn from_bech32_32(value: &str, expected_hrp: &str) -> Result<[u8; 32]> {
    let (hrp, data) = bech32::decode(value)?;
    if hrp != expected_hrp {
        return Err(CoreError::InvalidKeyFormat(format!(
            "expected {} prefix, got {}",
            expected_hrp, hrp
        )));
    }
    data.try_into().map_err(|d: Vec<u8>| {
        CoreError::InvalidKeyFormat(format!("{} payload must be 32 bytes, got {}", hrp, d.len()))
    })
}

/// x-only 公開鍵 (32 byte)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        decode_fixed(hex_str, "public key").map(Self)
    }

    pub fn from_bech32(npub: &str) -> Result<Self> {
        from_bech32_32(npub, HRP_PUBLIC_KEY).map(Self)
    }

    /// hex または npub を受け付ける
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.starts_with("npub1") {
            Self::from_bech32(value)
        } else {
            Self::from_hex(value)
        }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_bech32(&self) -> Result<String> {
        bech32::encode(HRP_PUBLIC_KEY, &self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// 秘密鍵 (32 byte スカラー)
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    /// 曲線の位数内にあるか検証して生成
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self> {
        k256::SecretKey::from_slice(&bytes)
            .map_err(|_| CoreError::InvalidKeyFormat("secret key out of range".to_string()))?;
        Ok(Self(bytes))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        Self::from_bytes(decode_fixed(hex_str, "secret key")?)
    }

    pub fn from_bech32(nsec: &str) -> Result<Self> {
        Self::from_bytes(from_bech32_32(nsec, HRP_SECRET_KEY)?)
    }

    /// hex または nsec を受け付ける
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.starts_with("nsec1") {
            Self::from_bech32(value)
        } else {
            Self::from_hex(value)
        }
    }

    pub fn generate() -> Result<Self> {
        loop {
            let mut bytes = [0u8; 32];
            getrandom::getrandom(&mut bytes)
                .map_err(|e| CoreError::Other(format!("random source unavailable: {}", e)))?;
            if let Ok(key) = Self::from_bytes(bytes) {
                return Ok(key);
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_bech32(&self) -> Result<String> {
        bech32::encode(HRP_SECRET_KEY, &self.0)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// 鍵ペア
#[derive(Debug, Clone)]
pub struct Keys {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl Keys {
    pub fn new(secret_key: SecretKey) -> Result<Self> {
        let public_key = crypto::get_public_key(&secret_key)?;
        Ok(Self { secret_key, public_key })
    }

    pub fn parse(secret: &str) -> Result<Self> {
        Self::new(SecretKey::parse(secret)?)
    }

    pub fn generate() -> Result<Self> {
        Self::new(SecretKey::generate()?)
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }
}

/// イベントID (sha256)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId([u8; 32]);

impl EventId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        decode_fixed(hex_str, "event id").map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.to_hex())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// BIP-340 署名 (64 byte)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        decode_fixed(hex_str, "signature").map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

macro_rules! hex_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                <$ty>::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_serde!(PublicKey);
hex_serde!(EventId);
hex_serde!(Signature);
