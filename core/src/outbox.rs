use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::event::current_timestamp;
use crate::keys::PublicKey;
use crate::storage::{self, KeyValueStore};
use crate::types::{generate_id, DmQueueItem, SentLogEntry};

pub const QUEUE_KEY: &str = "nostr_dm_queue";
pub const SENT_LOG_KEY: &str = "nostr_dm_sent_log";
pub const DEFAULT_SENT_LOG_CAPACITY: usize = 50;

/// DM 送信キュー
///
/// キューと送信済みログはどちらも JSON 配列としてストアに保存される。
/// ストアへの書き込みはこの型のメソッド経由のみ。
#[derive(Clone)]
pub struct DeliveryQueue {
    store: Arc<dyn KeyValueStore>,
    sent_log_capacity: usize,
}

impl DeliveryQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_capacity(store, DEFAULT_SENT_LOG_CAPACITY)
    }

    pub fn with_capacity(store: Arc<dyn KeyValueStore>, sent_log_capacity: usize) -> Self {
        Self {
            store,
            sent_log_capacity: sent_log_capacity.max(1),
        }
    }

    /// アイテムをキューの末尾に追加
    pub async fn enqueue(&self, item: DmQueueItem) -> Result<()> {
        let id = item.id.clone();
        storage::update(self.store.as_ref(), QUEUE_KEY, move |current| {
            let mut items: Vec<DmQueueItem> = decode_or_reset(QUEUE_KEY, current);
            if items.iter().any(|i| i.id == item.id) {
                return Ok((encode_list(&items)?, ()));
            }
            items.push(item.clone());
            Ok((encode_list(&items)?, ()))
        })
        .await?;
        log::debug!("Queued DM {}", id);
        Ok(())
    }

    /// DM を作成してキューに追加
    pub async fn enqueue_dm(
        &self,
        recipient: PublicKey,
        plaintext: &str,
        subject: &str,
        display_name: &str,
    ) -> Result<DmQueueItem> {
        let item = DmQueueItem {
            id: generate_id("dm")?,
            recipient_pubkey: recipient,
            plaintext: plaintext.to_string(),
            subject: subject.to_string(),
            display_name: display_name.to_string(),
            enqueued_at: current_timestamp(),
        };
        self.enqueue(item.clone()).await?;
        Ok(item)
    }

    /// キューの全件（追加順）
    ///
    /// 保存値が壊れていれば空にリセットして空を返す。
    pub async fn list_all(&self) -> Result<Vec<DmQueueItem>> {
        let current = self.store.get(QUEUE_KEY).await?;
        match decode_list::<DmQueueItem>(current.as_ref()) {
            Ok(items) => Ok(items),
            Err(e) => {
                log::warn!("{}; resetting queue", e);
                // 他の書き込みが先に直していれば何もしない
                self.store
                    .compare_and_swap(QUEUE_KEY, current.as_ref(), Some(Value::Array(Vec::new())))
                    .await?;
                Ok(Vec::new())
            }
        }
    }

    /// ID 一致のアイテムを削除。削除したら true
    pub async fn remove_by_id(&self, id: &str) -> Result<bool> {
        storage::update(self.store.as_ref(), QUEUE_KEY, |current| {
            let mut items: Vec<DmQueueItem> = decode_or_reset(QUEUE_KEY, current);
            let before = items.len();
            items.retain(|i| i.id != id);
            let removed = items.len() != before;
            if !removed {
                return Ok((current.cloned(), false));
            }
            Ok((encode_list(&items)?, true))
        })
        .await
    }

    pub async fn clear(&self) -> Result<()> {
        storage::update(self.store.as_ref(), QUEUE_KEY, |current| {
            if current.is_none() {
                return Ok((None, ()));
            }
            Ok((Some(Value::Array(Vec::new())), ()))
        })
        .await
    }

    /// 送信済みログに追加（古いものから溢れる）
    pub async fn record_sent(&self, entry: SentLogEntry) -> Result<()> {
        let capacity = self.sent_log_capacity;
        storage::update(self.store.as_ref(), SENT_LOG_KEY, move |current| {
            let mut entries: Vec<SentLogEntry> = decode_or_reset(SENT_LOG_KEY, current);
            entries.push(entry.clone());
            if entries.len() > capacity {
                let overflow = entries.len() - capacity;
                entries.drain(..overflow);
            }
            Ok((encode_list(&entries)?, ()))
        })
        .await
    }

    /// 送信済みログ（新しい順）
    pub async fn sent_log(&self) -> Result<Vec<SentLogEntry>> {
        let current = self.store.get(SENT_LOG_KEY).await?;
        let mut entries: Vec<SentLogEntry> = decode_or_reset(SENT_LOG_KEY, current.as_ref());
        entries.reverse();
        Ok(entries)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.list_all().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// 指定宛先の未送信アイテム
    pub async fn pending_for(&self, recipient: &PublicKey) -> Result<Vec<DmQueueItem>> {
        let mut items = self.list_all().await?;
        items.retain(|i| i.recipient_pubkey == *recipient);
        Ok(items)
    }
}

fn decode_list<T: DeserializeOwned>(value: Option<&Value>) -> Result<Vec<T>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(list @ Value::Array(_)) => serde_json::from_value(list.clone())
            .map_err(|e| CoreError::QueueCorrupted(format!("malformed entry: {}", e))),
        Some(other) => Err(CoreError::QueueCorrupted(format!(
            "expected a list, found {}",
            json_type(other)
        ))),
    }
}

/// 壊れた値は空リストとして扱う（次の書き込みで上書きされる）
fn decode_or_reset<T: DeserializeOwned>(key: &str, value: Option<&Value>) -> Vec<T> {
    decode_list(value).unwrap_or_else(|e| {
        log::warn!("{} under {}; treating as empty", e, key);
        Vec::new()
    })
}

fn encode_list<T: Serialize>(items: &[T]) -> Result<Option<Value>> {
    Ok(Some(serde_json::to_value(items)?))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
