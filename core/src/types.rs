use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::keys::{EventId, PublicKey};

/// 送信キューのアイテム（平文の DM）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmQueueItem {
    pub id: String,
    pub recipient_pubkey: PublicKey,
    pub plaintext: String,
    pub subject: String,
    #[serde(default)]
    pub display_name: String,
    pub enqueued_at: u64,
}

/// 送信済みログのエントリ（本文は保持しない）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentLogEntry {
    pub recipient_pubkey: PublicKey,
    pub subject: String,
    #[serde(default)]
    pub display_name: String,
    pub sent_at: u64,
    pub event_id: EventId,
}

/// 1回のキュー処理の結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    /// 送信を試みた件数
    pub attempted: usize,
    pub sent: usize,
    /// 失敗してキューに残った件数
    pub failed: usize,
    /// キャンセルで手を付けなかった件数
    pub skipped_cancelled: usize,
}

/// `<prefix>_<unix秒>_<ランダムhex>` 形式のID生成
pub fn generate_id(prefix: &str) -> Result<String> {
    let mut random = [0u8; 6];
    getrandom::getrandom(&mut random)
        .map_err(|e| CoreError::Other(format!("random source unavailable: {}", e)))?;
    Ok(format!(
        "{}_{}_{}",
        prefix,
        crate::event::current_timestamp(),
        hex::encode(random)
    ))
}
