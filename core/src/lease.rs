//! キュー処理の排他リース
//!
//! 定期実行と手動実行が同じキューを同時に処理しないよう、
//! ストア上に有効期限付きのロックレコードを置く。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::event::current_timestamp;
use crate::storage::{self, KeyValueStore};
use crate::types::generate_id;

pub const LEASE_KEY: &str = "nostr_dm_queue_lease";

/// ストアに保存されるリース
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner: String,
    pub expires_at: u64,
}

/// 取得済みリース。処理が終わったら `release` する
///
/// release されなかった場合も expires_at を過ぎれば他者が取得できる。
pub struct ProcessingLease {
    store: Arc<dyn KeyValueStore>,
    record: LeaseRecord,
    ttl_secs: u64,
}

impl ProcessingLease {
    /// リースを取得。期限内の他者のリースがあれば `LeaseHeld`
    pub async fn acquire(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Result<Self> {
        let owner = generate_id("lease")?;
        let ttl_secs = ttl.as_secs().max(1);

        let record = storage::update(store.as_ref(), LEASE_KEY, |current| {
            let now = current_timestamp();
            if let Some(existing) = current.and_then(|v| serde_json::from_value::<LeaseRecord>(v.clone()).ok()) {
                if existing.expires_at > now && existing.owner != owner {
                    return Err(CoreError::LeaseHeld {
                        owner: existing.owner,
                        expires_at: existing.expires_at,
                    });
                }
                if existing.owner != owner {
                    log::info!("Taking over expired lease from {}", existing.owner);
                }
            }
            let record = LeaseRecord {
                owner: owner.clone(),
                expires_at: now + ttl_secs,
            };
            Ok((Some(serde_json::to_value(&record)?), record))
        })
        .await?;

        log::debug!("Acquired processing lease {} until {}", record.owner, record.expires_at);
        Ok(Self { store, record, ttl_secs })
    }

    pub fn owner(&self) -> &str {
        &self.record.owner
    }

    pub fn expires_at(&self) -> u64 {
        self.record.expires_at
    }

    /// 期限を now + ttl に延ばす
    ///
    /// ストア上のリースがもう自分のものでなければ `LeaseLost`。
    pub async fn renew(&mut self) -> Result<()> {
        let owner = self.record.owner.clone();
        let ttl_secs = self.ttl_secs;
        let record = storage::update(self.store.as_ref(), LEASE_KEY, |current| {
            let ours = current
                .and_then(|v| serde_json::from_value::<LeaseRecord>(v.clone()).ok())
                .map_or(false, |r| r.owner == owner);
            if !ours {
                return Err(CoreError::LeaseLost(owner.clone()));
            }
            let record = LeaseRecord {
                owner: owner.clone(),
                expires_at: current_timestamp() + ttl_secs,
            };
            Ok((Some(serde_json::to_value(&record)?), record))
        })
        .await?;

        self.record = record;
        Ok(())
    }

    /// 自分のリースのときだけ削除する
    pub async fn release(self) -> Result<()> {
        let owner = self.record.owner.clone();
        let released = storage::update(self.store.as_ref(), LEASE_KEY, |current| {
            let ours = current
                .and_then(|v| serde_json::from_value::<LeaseRecord>(v.clone()).ok())
                .map_or(false, |r| r.owner == owner);
            if ours {
                Ok((None, true))
            } else {
                Ok((current.cloned(), false))
            }
        })
        .await?;

        if !released {
            log::warn!("Lease {} was taken over before release", owner);
        }
        Ok(())
    }
}

/// 現在のリース（期限切れも含む）
pub async fn current_lease(store: &dyn KeyValueStore) -> Result<Option<LeaseRecord>> {
    Ok(store
        .get(LEASE_KEY)
        .await?
        .and_then(|v| serde_json::from_value(v).ok()))
}
