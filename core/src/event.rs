//! Nostr イベント

use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::{CoreError, Result};
use crate::keys::{EventId, Keys, PublicKey, Signature};

pub const KIND_ENCRYPTED_DM: u16 = 4;
pub const KIND_CLIENT_AUTH: u16 = 22242;
pub const KIND_NWC_REQUEST: u16 = 23194;
pub const KIND_NWC_RESPONSE: u16 = 23195;

/// 未署名イベント
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedEvent {
    pub pubkey: PublicKey,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(pubkey: PublicKey, kind: u16, tags: Vec<Vec<String>>, content: impl Into<String>) -> Self {
        Self {
            pubkey,
            created_at: current_timestamp(),
            kind,
            tags,
            content: content.into(),
        }
    }

    pub fn sign(self, keys: &Keys) -> Result<NostrEvent> {
        crypto::sign_event(self, keys)
    }
}

/// 署名済みイベント（署名後は変更しない）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NostrEvent {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: Signature,
}

impl NostrEvent {
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    pub fn verify(&self) -> Result<()> {
        crypto::verify_event(self)
    }

    /// 最初に一致したタグの値
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::ParseError(format!("invalid event: {}", e)))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| CoreError::ParseError(format!("invalid event: {}", e)))
    }
}

fn p_tag(pubkey: &PublicKey) -> Vec<String> {
    vec!["p".to_string(), pubkey.to_hex()]
}

/// NIP-04 DM (kind 4)
pub fn encrypted_dm(keys: &Keys, recipient: &PublicKey, plaintext: &str) -> Result<NostrEvent> {
    let content = crypto::nip04_encrypt(plaintext, recipient, keys.secret_key())?;
    UnsignedEvent::new(keys.public_key(), KIND_ENCRYPTED_DM, vec![p_tag(recipient)], content).sign(keys)
}

/// NIP-42 AUTH (kind 22242)
pub fn client_auth(keys: &Keys, relay_url: &str, challenge: &str) -> Result<NostrEvent> {
    let tags = vec![
        vec!["relay".to_string(), relay_url.to_string()],
        vec!["challenge".to_string(), challenge.to_string()],
    ];
    UnsignedEvent::new(keys.public_key(), KIND_CLIENT_AUTH, tags, "").sign(keys)
}

/// NWC リクエスト (kind 23194)、payload はウォレット宛に暗号化する
pub fn nwc_request(keys: &Keys, wallet: &PublicKey, payload: &str) -> Result<NostrEvent> {
    let content = crypto::nip04_encrypt(payload, wallet, keys.secret_key())?;
    UnsignedEvent::new(keys.public_key(), KIND_NWC_REQUEST, vec![p_tag(wallet)], content).sign(keys)
}

/// 現在のUNIXタイムスタンプ（秒）
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
